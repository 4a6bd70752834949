//! Broker-side state for one connected peer.

use std::fmt;
use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::warn;

use crate::TEAM_UNAUTHORISED;
use crate::client::ClientInner;
use crate::internal;
use crate::message::{Message, MessageFormat};

pub(crate) type SessionId = u64;

/// How a peer reached the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Unix,
    Tcp,
    Internal,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionType::Unix => "unix",
            ConnectionType::Tcp => "tcp",
            ConnectionType::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Where writes to this peer go: a frame queue drained by the session's
/// connection task, or a direct reference to an in-process peer.
pub(crate) enum Outbound {
    Stream(mpsc::UnboundedSender<Vec<u8>>),
    Internal(Weak<ClientInner>),
}

/// One entry in the broker's session table.
///
/// Everything here is mutated under the table lock; writes to the peer happen
/// after the lock is released, through a [`Delivery`] prepared while it was
/// held.
pub(crate) struct Session {
    pub id: SessionId,
    pub conn_type: ConnectionType,
    pub team: String,
    pub format: MessageFormat,
    pub max_msg_length: u32,
    /// Message types this peer has declared it will not accept.
    pub unavailable: Vec<String>,
    pub handshaken: bool,
    last_error: Option<Instant>,
    outbound: Outbound,
}

impl Session {
    pub fn stream(
        id: SessionId,
        conn_type: ConnectionType,
        outbox: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            conn_type,
            team: TEAM_UNAUTHORISED.to_string(),
            format: MessageFormat::Json,
            max_msg_length: crate::DEFAULT_MAX_MESSAGE_LENGTH,
            unavailable: Vec::new(),
            handshaken: false,
            last_error: None,
            outbound: Outbound::Stream(outbox),
        }
    }

    pub fn internal(id: SessionId, team: &str, peer: Weak<ClientInner>) -> Self {
        Self {
            id,
            conn_type: ConnectionType::Internal,
            team: team.to_string(),
            format: MessageFormat::Json,
            max_msg_length: crate::DEFAULT_MAX_MESSAGE_LENGTH,
            unavailable: Vec::new(),
            handshaken: false,
            last_error: None,
            outbound: Outbound::Internal(peer),
        }
    }

    pub fn available(&self, ty: &str) -> bool {
        !self.unavailable.iter().any(|t| t == ty)
    }

    /// Team match for routing purposes.
    pub fn matches(&self, dest: &str) -> bool {
        self.team == dest || dest == crate::MSG_ALL
    }

    /// At most one error reply per wall-second. Stamps the clock when the
    /// reply is permitted.
    pub fn error_permitted(&mut self, now: Instant) -> bool {
        if self
            .last_error
            .is_some_and(|last| now.duration_since(last) < Duration::from_secs(1))
        {
            return false;
        }
        self.last_error = Some(now);
        true
    }

    /// Stage a write in this session's negotiated format. Returns `None` only
    /// when the message cannot be encoded, which is logged and treated as
    /// undeliverable rather than fatal.
    pub fn prepare(&self, message: &Message) -> Option<Delivery> {
        match &self.outbound {
            Outbound::Stream(outbox) => match message.to_frame(self.format) {
                Ok(frame) => Some(Delivery::Stream {
                    id: self.id,
                    outbox: outbox.clone(),
                    frame,
                }),
                Err(err) => {
                    warn!(team = %self.team, error = %err, "failed to encode outbound message");
                    None
                }
            },
            Outbound::Internal(peer) => Some(Delivery::Internal {
                id: self.id,
                peer: peer.clone(),
                message: message.clone(),
            }),
        }
    }
}

/// A staged write, executed outside the session-table lock.
pub(crate) enum Delivery {
    Stream {
        id: SessionId,
        outbox: mpsc::UnboundedSender<Vec<u8>>,
        frame: Vec<u8>,
    },
    Internal {
        id: SessionId,
        peer: Weak<ClientInner>,
        message: Message,
    },
}

impl Delivery {
    /// Perform the write. `Err` carries the session id of a peer that is
    /// gone, so the caller can purge it without retrying.
    pub fn send(self) -> Result<(), SessionId> {
        match self {
            Delivery::Stream { id, outbox, frame } => outbox.send(frame).map_err(|_| id),
            Delivery::Internal { id, peer, message } => {
                if internal::deliver(&peer, &message) {
                    Ok(())
                } else {
                    Err(id)
                }
            }
        }
    }
}
