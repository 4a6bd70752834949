//! Wire-level tests: raw sockets speaking the framed protocol against a live
//! broker.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use buxtehude::{
    CURRENT_VERSION, DEFAULT_MAX_MESSAGE_LENGTH, Frame, FrameReader, MSG_DISCONNECT, MSG_ERROR,
    MSG_HANDSHAKE, MSG_YOU, Message, MessageFormat, ReadError, Server, ServerConfig, write_frame,
};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(300);

struct WirePeer<R, W> {
    reader: FrameReader,
    rx: R,
    tx: W,
    format: MessageFormat,
}

impl<R, W> WirePeer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn read_frame(&mut self) -> Result<Frame> {
        match timeout(READ_TIMEOUT, self.reader.next_frame(&mut self.rx)).await {
            Ok(result) => result.context("broken frame"),
            Err(_) => Err(anyhow!("timed out waiting for a frame")),
        }
    }

    async fn read_message(&mut self) -> Result<Message> {
        let frame = self.read_frame().await?;
        Message::decode(frame.format, &frame.payload).context("undecodable frame body")
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        write_frame(&mut self.tx, message, self.format).await?;
        Ok(())
    }

    /// Read the broker's greeting and answer it with our handshake.
    async fn join(&mut self, team: &str) -> Result<()> {
        let greeting = self.read_message().await?;
        assert_eq!(greeting.ty, MSG_HANDSHAKE);
        assert!(greeting.content["version"].is_number());
        self.send(&handshake(team, self.format)).await
    }

    async fn expect_closed(&mut self) -> Result<()> {
        match timeout(READ_TIMEOUT, self.reader.next_frame(&mut self.rx)).await {
            Ok(Err(ReadError::Closed)) | Ok(Err(ReadError::Io(_))) => Ok(()),
            Ok(other) => Err(anyhow!("expected closed stream, got {other:?}")),
            Err(_) => Err(anyhow!("timed out waiting for the stream to close")),
        }
    }

    async fn expect_silence(&mut self) -> Result<()> {
        match timeout(SILENCE, self.reader.next_frame(&mut self.rx)).await {
            Err(_) => Ok(()),
            Ok(other) => Err(anyhow!("expected silence, got {other:?}")),
        }
    }
}

type TcpPeer = WirePeer<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>;
type UnixPeer = WirePeer<tokio::net::unix::OwnedReadHalf, tokio::net::unix::OwnedWriteHalf>;

async fn tcp_peer(addr: SocketAddr, format: MessageFormat) -> Result<TcpPeer> {
    let stream = TcpStream::connect(addr).await?;
    let (rx, tx) = stream.into_split();
    Ok(WirePeer {
        reader: FrameReader::new(DEFAULT_MAX_MESSAGE_LENGTH),
        rx,
        tx,
        format,
    })
}

async fn unix_peer(path: &std::path::Path) -> Result<UnixPeer> {
    let stream = UnixStream::connect(path).await?;
    let (rx, tx) = stream.into_split();
    Ok(WirePeer {
        reader: FrameReader::new(DEFAULT_MAX_MESSAGE_LENGTH),
        rx,
        tx,
        format: MessageFormat::Json,
    })
}

fn handshake(team: &str, format: MessageFormat) -> Message {
    Message {
        ty: MSG_HANDSHAKE.to_string(),
        content: json!({
            "teamname": team,
            "format": format as u8,
            "version": CURRENT_VERSION,
            "max-message-length": DEFAULT_MAX_MESSAGE_LENGTH,
        }),
        ..Message::default()
    }
}

fn routed(ty: &str, dest: &str) -> Message {
    Message {
        ty: ty.to_string(),
        dest: dest.to_string(),
        ..Message::default()
    }
}

async fn wait_for_handshaken(server: &Server, count: usize) {
    for _ in 0..200 {
        let done = server
            .clients()
            .iter()
            .filter(|client| client.handshaken)
            .count();
        if done >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} handshaken sessions");
}

#[tokio::test]
async fn messages_before_the_handshake_are_fatal() -> Result<()> {
    let server = Server::new();
    let addr = server.listen_tcp(0).await?;

    let mut peer = tcp_peer(addr, MessageFormat::Json).await?;
    let greeting = peer.read_message().await?;
    assert_eq!(greeting.ty, MSG_HANDSHAKE);

    peer.send(&routed("ping", "anyone")).await?;

    let notice = peer.read_message().await?;
    assert_eq!(notice.ty, MSG_DISCONNECT);
    assert_eq!(notice.content["who"], json!(MSG_YOU));
    assert_eq!(notice.content["reason"], json!("Failed handshake"));
    peer.expect_closed().await?;

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn unix_transport_routes_between_teams() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bx");

    let server = Server::new();
    server.listen_unix(&path)?;

    let mut alpha = unix_peer(&path).await?;
    alpha.join("alpha").await?;
    let mut beta = unix_peer(&path).await?;
    beta.join("a").await?;
    wait_for_handshaken(&server, 2).await;

    let mut ping = routed("ping", "a");
    ping.content = json!(42);
    alpha.send(&ping).await?;

    let received = beta.read_message().await?;
    assert_eq!(received.ty, "ping");
    assert_eq!(received.src, "alpha");
    assert_eq!(received.content, json!(42));
    alpha.expect_silence().await?;

    server.close().await;
    assert!(!path.exists(), "socket file should be unlinked on close");
    Ok(())
}

#[tokio::test]
async fn oversize_frame_draws_an_error_and_the_next_frame_routes() -> Result<()> {
    let server = Server::with_config(ServerConfig {
        max_msg_length: 1024,
        handshake_timeout: Duration::from_secs(60),
    });
    let addr = server.listen_tcp(0).await?;

    let mut alpha = tcp_peer(addr, MessageFormat::Json).await?;
    alpha.join("alpha").await?;
    let mut beta = tcp_peer(addr, MessageFormat::Json).await?;
    beta.join("b").await?;
    wait_for_handshaken(&server, 2).await;

    // A bare header declaring a body one byte over the broker's cap.
    let mut header = vec![MessageFormat::Json as u8];
    header.extend_from_slice(&1025u32.to_le_bytes());
    alpha.tx.write_all(&header).await?;

    let error = alpha.read_message().await?;
    assert_eq!(error.ty, MSG_ERROR);
    assert_eq!(error.content, json!("Buffer size too big!"));

    alpha.send(&routed("note", "b")).await?;
    let received = beta.read_message().await?;
    assert_eq!(received.ty, "note");
    assert_eq!(received.src, "alpha");

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn error_replies_are_limited_to_one_per_second() -> Result<()> {
    let server = Server::new();
    let addr = server.listen_tcp(0).await?;

    let mut peer = tcp_peer(addr, MessageFormat::Json).await?;
    peer.join("storm").await?;
    wait_for_handshaken(&server, 1).await;

    // Two bad headers in quick succession; only the first draws a reply.
    for _ in 0..2 {
        peer.tx.write_all(&[9, 0, 0, 0, 0]).await?;
    }

    let error = peer.read_message().await?;
    assert_eq!(error.ty, MSG_ERROR);
    assert_eq!(error.content, json!("Invalid message type!"));
    peer.expect_silence().await?;

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn silent_connections_are_closed_after_the_handshake_timeout() -> Result<()> {
    let server = Server::with_config(ServerConfig {
        max_msg_length: 1024,
        handshake_timeout: Duration::from_millis(200),
    });
    let addr = server.listen_tcp(0).await?;

    let mut peer = tcp_peer(addr, MessageFormat::Json).await?;
    let greeting = peer.read_message().await?;
    assert_eq!(greeting.ty, MSG_HANDSHAKE);

    let notice = peer.read_message().await?;
    assert_eq!(notice.ty, MSG_DISCONNECT);
    assert_eq!(notice.content["reason"], json!("Failed handshake"));
    peer.expect_closed().await?;

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn departures_are_broadcast_to_every_remaining_session() -> Result<()> {
    let server = Server::new();
    let addr = server.listen_tcp(0).await?;

    let mut leaver = tcp_peer(addr, MessageFormat::Json).await?;
    leaver.join("t").await?;
    let mut stays = tcp_peer(addr, MessageFormat::Json).await?;
    stays.join("t").await?;
    let mut watches = tcp_peer(addr, MessageFormat::Json).await?;
    watches.join("w").await?;
    wait_for_handshaken(&server, 3).await;

    leaver.tx.shutdown().await?;
    drop(leaver);

    for peer in [&mut stays, &mut watches] {
        let notice = peer.read_message().await?;
        assert_eq!(notice.ty, MSG_DISCONNECT);
        assert_eq!(notice.content["who"], json!("t"));
        peer.expect_silence().await?;
    }

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn each_session_receives_its_negotiated_format() -> Result<()> {
    let server = Server::new();
    let addr = server.listen_tcp(0).await?;

    let mut packed = tcp_peer(addr, MessageFormat::Msgpack).await?;
    packed.join("m").await?;
    let mut plain = tcp_peer(addr, MessageFormat::Json).await?;
    plain.join("j").await?;
    wait_for_handshaken(&server, 2).await;

    plain.send(&routed("note", "m")).await?;
    let frame = packed.read_frame().await?;
    assert_eq!(frame.format, MessageFormat::Msgpack);
    let message = Message::decode(frame.format, &frame.payload)?;
    assert_eq!(message.ty, "note");
    assert_eq!(message.src, "j");

    server.close().await;
    Ok(())
}

#[tokio::test]
async fn closing_the_server_notifies_connected_peers() -> Result<()> {
    let server = Server::new();
    let addr = server.listen_tcp(0).await?;

    let mut peer = tcp_peer(addr, MessageFormat::Json).await?;
    peer.join("t").await?;
    wait_for_handshaken(&server, 1).await;

    server.close().await;

    let notice = peer.read_message().await?;
    assert_eq!(notice.ty, MSG_DISCONNECT);
    assert_eq!(notice.content["who"], json!(MSG_YOU));
    assert_eq!(notice.content["reason"], json!("Shutting down server"));
    peer.expect_closed().await?;
    Ok(())
}
