//! Resumable framed reading of the bus wire protocol.
//!
//! A [`FrameReader`] turns an arbitrary byte stream into whole frames without
//! ever blocking on an incomplete one. Bytes accumulate inside the reader, so
//! a read future can be dropped mid-frame (e.g. when another `select!` branch
//! wins) and the next call picks up exactly where the stream left off,
//! regardless of how the peer's writes were chunked.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::message::{FRAME_HEADER_LEN, MessageFormat};

/// One complete frame as received from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub format: MessageFormat,
    pub payload: Bytes,
}

/// A frame header that cannot be accepted. The offending header is consumed,
/// so parsing resynchronises at the following byte.
///
/// The `Display` text doubles as the error string reported to the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid message type!")]
    InvalidFormat(u8),
    #[error("Buffer size too big!")]
    Oversize { length: u32, max: u32 },
}

/// Stream-level read failure.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The peer closed the stream.
    #[error("connection closed")]
    Closed,
    /// A recoverable framing error; the caller may keep reading.
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What the reader expects next.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    Header,
    Body { format: MessageFormat, length: u32 },
}

/// Incremental frame parser with an upper bound on body length.
///
/// Memory use is bounded by one in-flight frame plus whatever the transport
/// hands over in a single read; the internal buffer's allocation is reused
/// from frame to frame.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    state: ReadState,
    max_length: u32,
}

impl FrameReader {
    pub fn new(max_length: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(FRAME_HEADER_LEN + max_length.min(4096) as usize),
            state: ReadState::Header,
            max_length,
        }
    }

    /// Append raw bytes, e.g. from a transport the reader does not drive
    /// itself.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Consume as much buffered input as possible.
    ///
    /// Returns `Ok(Some(frame))` once a whole frame is available and
    /// `Ok(None)` when more bytes are needed. A rejected header yields an
    /// error after being consumed; subsequent frames parse normally.
    pub fn try_next(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                ReadState::Header => {
                    if self.buf.len() < FRAME_HEADER_LEN {
                        return Ok(None);
                    }
                    let format_byte = self.buf[0];
                    let length = u32::from_le_bytes([
                        self.buf[1],
                        self.buf[2],
                        self.buf[3],
                        self.buf[4],
                    ]);
                    self.buf.advance(FRAME_HEADER_LEN);

                    let format = MessageFormat::try_from(format_byte)
                        .map_err(FrameError::InvalidFormat)?;
                    if length > self.max_length {
                        return Err(FrameError::Oversize {
                            length,
                            max: self.max_length,
                        });
                    }
                    self.state = ReadState::Body { format, length };
                }
                ReadState::Body { format, length } => {
                    if self.buf.len() < length as usize {
                        return Ok(None);
                    }
                    let payload = self.buf.split_to(length as usize).freeze();
                    self.state = ReadState::Header;
                    return Ok(Some(Frame { format, payload }));
                }
            }
        }
    }

    /// Drive the reader from an async source until one frame is complete.
    ///
    /// Cancel-safe: partial reads land in the internal buffer, not in the
    /// future, so dropping the returned future never tears a frame.
    pub async fn next_frame<R>(&mut self, io: &mut R) -> Result<Frame, ReadError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.try_next()? {
                return Ok(frame);
            }
            let read = io.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(ReadError::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::message::Message;

    const MAX: u32 = 1024;

    fn frame_bytes(ty: &str) -> Vec<u8> {
        Message::new(ty)
            .to_frame(MessageFormat::Json)
            .expect("frame")
    }

    fn drain(reader: &mut FrameReader) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = reader.try_next().expect("frame") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn parses_frames_from_a_single_chunk() {
        let mut stream = frame_bytes("one");
        stream.extend_from_slice(&frame_bytes("two"));

        let mut reader = FrameReader::new(MAX);
        reader.extend(&stream);
        let frames = drain(&mut reader);

        assert_eq!(frames.len(), 2);
        let first = Message::decode(frames[0].format, &frames[0].payload).expect("decode");
        let second = Message::decode(frames[1].format, &frames[1].payload).expect("decode");
        assert_eq!(first.ty, "one");
        assert_eq!(second.ty, "two");
    }

    #[test]
    fn any_chunking_yields_the_same_frames() {
        let mut stream = frame_bytes("alpha");
        stream.extend_from_slice(&frame_bytes("beta"));
        stream.extend_from_slice(&frame_bytes("gamma"));

        let mut whole = FrameReader::new(MAX);
        whole.extend(&stream);
        let expected = drain(&mut whole);

        for chunk_size in [1, 2, 3, 7, 64] {
            let mut reader = FrameReader::new(MAX);
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                reader.extend(chunk);
                frames.extend(drain(&mut reader));
            }
            assert_eq!(frames, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn oversize_header_is_rejected_then_recovers() {
        let mut reader = FrameReader::new(MAX);
        let mut header = vec![MessageFormat::Json as u8];
        header.extend_from_slice(&(MAX + 1).to_le_bytes());
        reader.extend(&header);

        assert_eq!(
            reader.try_next(),
            Err(FrameError::Oversize {
                length: MAX + 1,
                max: MAX
            })
        );

        reader.extend(&frame_bytes("after"));
        let frame = reader.try_next().expect("frame").expect("complete");
        let message = Message::decode(frame.format, &frame.payload).expect("decode");
        assert_eq!(message.ty, "after");
    }

    #[test]
    fn unknown_format_byte_is_rejected_then_recovers() {
        let mut reader = FrameReader::new(MAX);
        reader.extend(&[9, 0, 0, 0, 0]);
        assert_eq!(reader.try_next(), Err(FrameError::InvalidFormat(9)));

        reader.extend(&frame_bytes("ok"));
        assert!(reader.try_next().expect("frame").is_some());
    }

    #[tokio::test]
    async fn next_frame_reads_across_partial_writes() {
        let (mut tx, mut rx) = tokio::io::duplex(16);
        let bytes = frame_bytes("split");
        let (head, tail) = bytes.split_at(3);

        let mut reader = FrameReader::new(MAX);
        tx.write_all(head).await.expect("head");

        let read = tokio::spawn(async move {
            let frame = reader.next_frame(&mut rx).await.expect("frame");
            Message::decode(frame.format, &frame.payload).expect("decode")
        });

        tx.write_all(tail).await.expect("tail");
        let message = read.await.expect("join");
        assert_eq!(message.ty, "split");
    }

    #[tokio::test]
    async fn eof_reports_closed() {
        let (tx, mut rx) = tokio::io::duplex(16);
        drop(tx);

        let mut reader = FrameReader::new(MAX);
        match reader.next_frame(&mut rx).await {
            Err(ReadError::Closed) => {}
            other => panic!("expected closed stream, got {other:?}"),
        }
    }
}
