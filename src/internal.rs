//! In-process transport plumbing.
//!
//! Internal peers share the broker's address space, so both directions skip
//! the wire entirely: peer→broker writes enqueue onto an unbounded channel
//! drained by the broker's pump task, and broker→peer writes invoke the
//! peer's handlers directly on whichever broker task performed the routing.
//! Handlers for internal peers therefore must not block.

use std::sync::Weak;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::client::{Client, ClientInner};
use crate::message::Message;
use crate::server::ServerState;
use crate::session::SessionId;

pub(crate) type Queue = mpsc::UnboundedSender<(SessionId, Message)>;
pub(crate) type QueueReceiver = mpsc::UnboundedReceiver<(SessionId, Message)>;

pub(crate) fn queue() -> (Queue, QueueReceiver) {
    mpsc::unbounded_channel()
}

/// Drain the internal-message queue, routing each entry exactly as if it had
/// arrived on a socket.
pub(crate) async fn pump(
    state: Weak<ServerState>,
    mut queue: QueueReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break,
            entry = queue.recv() => {
                let Some((id, message)) = entry else { break };
                let Some(state) = state.upgrade() else { break };
                state.handle_internal(id, message);
            }
        }
    }
    debug!("internal transport pump stopped");
}

/// Hand a routed message to an in-process peer.
///
/// The peer is only dereferenced after its liveness is observed, so a
/// half-torn-down client is skipped rather than touched. Returns false when
/// the peer is gone.
pub(crate) fn deliver(peer: &Weak<ClientInner>, message: &Message) -> bool {
    let Some(inner) = peer.upgrade() else {
        return false;
    };
    let client = Client::from_inner(inner);
    if !client.is_alive() {
        return false;
    }
    client.dispatch(message);
    true
}
