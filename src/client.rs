//! The peer side of the bus: connect over Unix, TCP or in-process, register
//! per-type handlers, and write team-addressed messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream, lookup_host};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::{FrameReader, ReadError};
use crate::message::{CodecError, Message, MessageFormat};
use crate::server::{Server, ServerState};
use crate::session::SessionId;
use crate::validate::{self, validate};
use crate::{CURRENT_VERSION, DEFAULT_MAX_MESSAGE_LENGTH, MSG_AVAILABLE, MSG_ERROR, MSG_HANDSHAKE};

/// What a peer proposes in its handshake.
#[derive(Debug, Clone)]
pub struct ClientPreferences {
    pub teamname: String,
    pub format: MessageFormat,
    pub max_msg_length: u32,
}

impl ClientPreferences {
    pub fn new(teamname: impl Into<String>) -> Self {
        Self {
            teamname: teamname.into(),
            format: MessageFormat::Json,
            max_msg_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }

    pub fn format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn max_msg_length(mut self, max_msg_length: u32) -> Self {
        self.max_msg_length = max_msg_length;
        self
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve {0} to an IPv4 address")]
    Resolve(String),
    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("failed to send handshake: {0}")]
    Handshake(#[from] WriteError),
    #[error("server has shut down")]
    ServerClosed,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("client is not connected")]
    NotConnected,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A message handler. Handlers run on the client's event-loop task — or, for
/// in-process clients, on the broker task that routed the message — and must
/// not block. They may freely mutate the handler registry.
pub type Handler = Arc<dyn Fn(&Client, &Message) + Send + Sync>;

enum Transport {
    Stream {
        egress: mpsc::UnboundedSender<Vec<u8>>,
    },
    Internal {
        server: Weak<ServerState>,
        session: OnceLock<SessionId>,
    },
}

pub(crate) struct ClientInner {
    prefs: ClientPreferences,
    handlers: Mutex<HashMap<String, Handler>>,
    transport: Transport,
    alive: AtomicBool,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A connected peer. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to a broker over TCP. The host is resolved to an IPv4
    /// address.
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        prefs: ClientPreferences,
    ) -> Result<Self, ConnectError> {
        let mut addrs = lookup_host((host, port))
            .await
            .map_err(|_| ConnectError::Resolve(host.to_string()))?;
        let addr = addrs
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| ConnectError::Resolve(host.to_string()))?;
        let stream = TcpStream::connect(addr).await?;
        info!("connected to {addr}");
        Self::start_stream(stream, prefs)
    }

    /// Connect to a broker's Unix-domain socket.
    pub async fn connect_unix(
        path: impl AsRef<std::path::Path>,
        prefs: ClientPreferences,
    ) -> Result<Self, ConnectError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        info!("connected to {}", path.as_ref().display());
        Self::start_stream(stream, prefs)
    }

    /// Register with a broker in the same process. No socket is involved:
    /// writes enqueue onto the broker's internal queue, and inbound messages
    /// are dispatched synchronously by the broker's tasks.
    pub fn connect_internal(server: &Server, prefs: ClientPreferences) -> Result<Self, ConnectError> {
        let state = Arc::clone(server.state());
        if state.is_closed() {
            return Err(ConnectError::ServerClosed);
        }

        let inner = Arc::new(ClientInner {
            prefs,
            handlers: Mutex::new(HashMap::new()),
            transport: Transport::Internal {
                server: Arc::downgrade(&state),
                session: OnceLock::new(),
            },
            alive: AtomicBool::new(true),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        });
        let client = Self { inner };
        client.install_default_handlers();

        let id = state.register_internal(Arc::downgrade(&client.inner), &client.inner.prefs.teamname);
        if let Transport::Internal { session, .. } = &client.inner.transport {
            let _ = session.set(id);
        }

        // The broker greets first, then we introduce ourselves; both legs run
        // through the same state machine as a socket connection.
        state.send_server_handshake(id);
        client.write(client.handshake_message())?;
        Ok(client)
    }

    fn start_stream<S>(stream: S, prefs: ClientPreferences) -> Result<Self, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            prefs,
            handlers: Mutex::new(HashMap::new()),
            transport: Transport::Stream { egress: egress_tx },
            alive: AtomicBool::new(true),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        });
        let client = Self { inner };
        client.install_default_handlers();
        client.write(client.handshake_message())?;

        let task = tokio::spawn(run_stream_loop(client.clone(), stream, egress_rx));
        *client
            .inner
            .task
            .lock()
            .expect("client task lock poisoned") = Some(task);
        Ok(client)
    }

    fn handshake_message(&self) -> Message {
        let prefs = &self.inner.prefs;
        Message {
            ty: MSG_HANDSHAKE.to_string(),
            content: json!({
                "format": prefs.format as u8,
                "teamname": prefs.teamname,
                "version": CURRENT_VERSION,
                "max-message-length": prefs.max_msg_length,
            }),
            ..Message::default()
        }
    }

    fn install_default_handlers(&self) {
        // Validate the broker's greeting once, then get out of the way.
        self.add_handler(MSG_HANDSHAKE, |client, message| {
            if !validate(&message.content, validate::HANDSHAKE_CLIENTSIDE) {
                warn!("rejected server handshake, disconnecting");
                client.shutdown();
                return;
            }
            client.erase_handler(MSG_HANDSHAKE);
        });

        self.add_handler(MSG_ERROR, |_, message| {
            if !validate(&message.content, validate::SERVER_MESSAGE) {
                warn!("received malformed error payload from server");
                return;
            }
            info!(
                "error message from server: {}",
                message.content.as_str().unwrap_or_default()
            );
        });
    }

    /// Send a message to the broker. Synchronous: stream transports encode
    /// and enqueue the frame, in-process transports enqueue onto the broker's
    /// internal queue.
    pub fn write(&self, message: Message) -> Result<(), WriteError> {
        if !self.is_alive() {
            return Err(WriteError::NotConnected);
        }
        match &self.inner.transport {
            Transport::Stream { egress } => {
                let frame = message.to_frame(self.inner.prefs.format)?;
                egress.send(frame).map_err(|_| WriteError::NotConnected)
            }
            Transport::Internal { server, session } => {
                let state = server.upgrade().ok_or(WriteError::NotConnected)?;
                let id = session.get().copied().ok_or(WriteError::NotConnected)?;
                state
                    .receive_internal(id, message)
                    .map_err(|_| WriteError::NotConnected)
            }
        }
    }

    /// Declare whether this peer accepts messages of the given type when the
    /// sender asked for a single recipient.
    pub fn set_available(&self, ty: &str, available: bool) -> Result<(), WriteError> {
        self.write(Message {
            ty: MSG_AVAILABLE.to_string(),
            content: json!({ "type": ty, "available": available }),
            ..Message::default()
        })
    }

    pub fn add_handler<F>(&self, ty: impl Into<String>, handler: F)
    where
        F: Fn(&Client, &Message) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .insert(ty.into(), Arc::new(handler));
    }

    pub fn erase_handler(&self, ty: &str) {
        self.inner
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .remove(ty);
    }

    pub fn clear_handlers(&self) {
        self.inner
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .clear();
    }

    pub fn teamname(&self) -> &str {
        &self.inner.prefs.teamname
    }

    pub fn preferences(&self) -> &ClientPreferences {
        &self.inner.prefs
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Signal the connection to stop without waiting. Safe to call from
    /// inside a handler.
    pub fn shutdown(&self) {
        self.inner.alive.store(false, Ordering::Release);
        self.inner.shutdown.notify_one();
    }

    /// Tear the connection down and wait for the event loop to finish.
    /// In-process clients deregister from their broker, which announces the
    /// departure to the remaining sessions. Idempotent.
    pub async fn close(&self) {
        let was_alive = self.inner.alive.swap(false, Ordering::AcqRel);
        self.inner.shutdown.notify_one();

        if was_alive
            && let Transport::Internal { server, session } = &self.inner.transport
            && let (Some(state), Some(id)) = (server.upgrade(), session.get())
        {
            state.remove_session(*id);
        }

        let task = self
            .inner
            .task
            .lock()
            .expect("client task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!("closed client");
    }

    /// Invoke the registered handler for a message, if any. Messages without
    /// a type are dropped.
    pub(crate) fn dispatch(&self, message: &Message) {
        if message.ty.is_empty() {
            warn!("received message with no type");
            return;
        }
        // Clone the handler out of the registry so handlers can add or erase
        // entries without deadlocking.
        let handler = self
            .inner
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .get(&message.ty)
            .cloned();
        if let Some(handler) = handler {
            handler(self, message);
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }
}

/// Event loop for socket transports: pump the frame reader, flush queued
/// writes, stop on shutdown or stream failure.
async fn run_stream_loop<S>(
    client: Client,
    stream: S,
    mut egress: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(client.inner.prefs.max_msg_length);

    loop {
        tokio::select! {
            result = reader.next_frame(&mut read_half) => match result {
                Ok(frame) => match Message::decode(frame.format, &frame.payload) {
                    Ok(message) => client.dispatch(&message),
                    Err(err) => warn!("error parsing message: {err}"),
                },
                Err(ReadError::Frame(err)) => warn!("{err}"),
                Err(ReadError::Closed) => {
                    debug!("server closed the connection");
                    break;
                }
                Err(ReadError::Io(err)) => {
                    warn!(error = %err, "read failed");
                    break;
                }
            },
            Some(frame) = egress.recv() => {
                let result = async {
                    write_half.write_all(&frame).await?;
                    write_half.flush().await
                }
                .await;
                if let Err(err) = result {
                    warn!(error = %err, "failed to write, closing connection");
                    break;
                }
            },
            _ = client.inner.shutdown.notified() => break,
        }
    }

    client.inner.alive.store(false, Ordering::Release);
}
