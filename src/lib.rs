//! Team-addressed message bus over Unix, TCP and in-process transports.
//!
//! Cooperating processes exchange typed JSON (or MessagePack) messages
//! through a central broker. Peers identify themselves with a *team name*
//! (not unique) and address messages to a team; the broker routes a copy to
//! every matching peer, or to a single representative when the message asks
//! for only one. Each module owns a concrete responsibility:
//!
//! - [`message`] defines the [`Message`] record, its two wire encodings and
//!   the length-prefixed frame layout.
//! - [`frame`] reads frames incrementally, surviving arbitrarily chunked
//!   socket reads.
//! - [`validate`] checks control payloads against declarative predicate
//!   batteries.
//! - [`server`] is the broker: listeners, the session table, routing and
//!   disconnect notices.
//! - [`client`] is the peer: three transports, a per-type handler registry
//!   and a background event loop.
//! - [`session`] carries the broker-side per-peer state; a private module
//!   bridges in-process peers onto the broker's internal queue.
//!
//! Integration tests drive this crate over all three transports to check
//! that routing behaves identically regardless of how a peer connected.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

pub mod client;
pub mod frame;
mod internal;
pub mod message;
pub mod server;
pub mod session;
pub mod validate;

pub use client::{Client, ClientPreferences, ConnectError, WriteError};
pub use frame::{Frame, FrameError, FrameReader, ReadError};
pub use message::{FRAME_HEADER_LEN, Message, MessageFormat, write_frame};
pub use server::{ClientInfo, ListenError, Server, ServerConfig};
pub use session::ConnectionType;

/// Default TCP port for brokers.
pub const DEFAULT_PORT: u16 = 1637;

/// Protocol version this build speaks.
pub const CURRENT_VERSION: u32 = 0;

/// Oldest peer version a session will be accepted from.
pub const MINIMUM_COMPATIBLE_VERSION: u32 = 0;

/// Frame-body cap a client proposes by default.
pub const DEFAULT_MAX_MESSAGE_LENGTH: u32 = 32 * 1024;

/// Frame-body cap a broker enforces on inbound frames by default.
pub const SERVER_MAX_MESSAGE_LENGTH: u32 = 128 * 1024;

/// Destination wildcard matching every session.
pub const MSG_ALL: &str = "$$all";
/// Availability-mask updates.
pub const MSG_AVAILABLE: &str = "$$available";
/// Departure notices; `who` names the leaver, or `$$you` for the recipient.
pub const MSG_DISCONNECT: &str = "$$disconnect";
/// Broker error replies; the content is a bare string.
pub const MSG_ERROR: &str = "$$error";
/// Session negotiation, both directions.
pub const MSG_HANDSHAKE: &str = "$$handshake";
/// Advisory broker-to-peer notices.
pub const MSG_INFO: &str = "$$info";
/// The broker itself, as a message source.
pub const MSG_SERVER: &str = "$$server";
/// Reserved; carries no broker semantics yet.
pub const MSG_SUBSCRIBE: &str = "$$subscribe";
/// Self-reference in a disconnect notice.
pub const MSG_YOU: &str = "$$you";

/// Team assigned to sessions that have not completed their handshake.
pub const TEAM_UNAUTHORISED: &str = "$$unauthorised";

/// What to do with SIGPIPE at initialisation.
///
/// A write to a Unix socket whose peer has gone raises SIGPIPE, which kills
/// the process under the default disposition; ignoring it turns the write
/// into an ordinary error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigpipePolicy {
    #[default]
    Ignore,
    /// Restore the OS default (terminate on SIGPIPE).
    Default,
    /// Leave whatever disposition the embedding application installed.
    Untouched,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("library already initialised")]
    AlreadyInitialised,
}

static INITIALISED: AtomicBool = AtomicBool::new(false);

/// One-shot, process-global initialisation. Call once before opening any
/// broker or client; a second call reports [`InitError::AlreadyInitialised`]
/// and changes nothing.
///
/// Log output goes through [`tracing`]; install a subscriber to capture it.
pub fn init() -> Result<(), InitError> {
    init_with(SigpipePolicy::default())
}

/// [`init`] with an explicit SIGPIPE disposition.
pub fn init_with(policy: SigpipePolicy) -> Result<(), InitError> {
    if INITIALISED.swap(true, Ordering::SeqCst) {
        return Err(InitError::AlreadyInitialised);
    }

    #[cfg(unix)]
    match policy {
        SigpipePolicy::Ignore => unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        },
        SigpipePolicy::Default => unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        },
        SigpipePolicy::Untouched => {}
    }
    #[cfg(not(unix))]
    let _ = policy;

    Ok(())
}
