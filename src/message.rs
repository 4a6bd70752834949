use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Length of the per-frame header: one format byte plus a little-endian
/// `u32` body length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Wire encoding negotiated per peer. The discriminant is the format byte
/// that leads every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageFormat {
    Json = 0,
    Msgpack = 1,
}

impl TryFrom<u8> for MessageFormat {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Json),
            1 => Ok(Self::Msgpack),
            other => Err(other),
        }
    }
}

/// The unit of communication on the bus.
///
/// `dest` names a team (or the `$$all` wildcard); `src` is stamped by the
/// broker and ignored on input. Empty `dest`/`src` and null `content` are
/// omitted on the wire. A payload without a `type` does not decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(default)]
    pub only_first: bool,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed MessagePack payload: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
    #[error("MessagePack encoding failed: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),
}

impl Message {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            ..Self::default()
        }
    }

    /// Serialise the body in the given format. The returned length is exactly
    /// what goes on the wire and sizes the frame header.
    pub fn encode(&self, format: MessageFormat) -> Result<Vec<u8>, CodecError> {
        match format {
            MessageFormat::Json => Ok(serde_json::to_vec(self)?),
            // Named (map-keyed) encoding so both formats carry the same shape.
            MessageFormat::Msgpack => Ok(rmp_serde::to_vec_named(self)?),
        }
    }

    pub fn decode(format: MessageFormat, data: &[u8]) -> Result<Self, CodecError> {
        match format {
            MessageFormat::Json => Ok(serde_json::from_slice(data)?),
            MessageFormat::Msgpack => Ok(rmp_serde::from_slice(data)?),
        }
    }

    /// Encode into a complete frame: format byte, little-endian `u32` body
    /// length, body.
    pub fn to_frame(&self, format: MessageFormat) -> Result<Vec<u8>, CodecError> {
        let body = self.encode(format)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.push(format as u8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Write one framed message and flush it so peers get timely delivery.
pub async fn write_frame<W>(
    writer: &mut W,
    message: &Message,
    format: MessageFormat,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message
        .to_frame(format)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}
