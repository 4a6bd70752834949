//! The broker: listeners, session table, routing and disconnect notices.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ClientInner;
use crate::frame::{FrameReader, ReadError};
use crate::internal;
use crate::message::{Message, MessageFormat, write_frame};
use crate::session::{ConnectionType, Delivery, Session, SessionId};
use crate::validate::{self, validate};
use crate::{CURRENT_VERSION, MSG_AVAILABLE, MSG_DISCONNECT, MSG_ERROR, MSG_HANDSHAKE, MSG_YOU};

/// Knobs for a broker instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on inbound frame bodies; larger headers are rejected with
    /// an `$$error` reply.
    pub max_msg_length: u32,
    /// How long a fresh connection may take to complete its handshake.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_msg_length: crate::SERVER_MAX_MESSAGE_LENGTH,
            handshake_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    #[error("server is closed")]
    Closed,
}

/// Snapshot of one connected peer, for introspection.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub team: String,
    pub conn_type: ConnectionType,
    pub handshaken: bool,
}

/// What a connection task should do after one inbound message.
pub(crate) enum Flow {
    Continue,
    HandshakeComplete,
    Close { notify: Option<&'static str> },
}

/// Result of attempting a rate-limited `$$error` reply.
pub(crate) enum ErrorOutcome {
    /// Within the one-per-second window; nothing was sent.
    Suppressed,
    Sent,
    /// The session must be disconnected: it has not handshaken, or the reply
    /// could not be written.
    Fatal,
}

/// Team-addressed message broker over Unix, TCP and in-process transports.
///
/// All transports share one session table and one routing policy, so peers
/// behave identically regardless of how they connected. Must be created
/// inside a tokio runtime; `close` shuts every listener and session down and
/// is safe to call more than once.
pub struct Server {
    state: Arc<ServerState>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (internal_tx, internal_rx) = internal::queue();
        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(ServerState {
            config,
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            internal_tx,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            unix_path: Mutex::new(None),
        });

        let pump = tokio::spawn(internal::pump(
            Arc::downgrade(&state),
            internal_rx,
            state.shutdown.subscribe(),
        ));
        state.track(pump);

        Self { state }
    }

    /// Accept Unix-domain connections at the given path. The socket file is
    /// unlinked again when the server closes.
    pub fn listen_unix(&self, path: impl AsRef<Path>) -> Result<(), ListenError> {
        if self.state.is_closed() {
            return Err(ListenError::Closed);
        }
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;
        *self
            .state
            .unix_path
            .lock()
            .expect("unix path lock poisoned") = Some(path.clone());
        info!("listening on file {}", path.display());

        let task = tokio::spawn(accept_unix(
            Arc::clone(&self.state),
            listener,
            self.state.shutdown.subscribe(),
        ));
        self.state.track(task);
        Ok(())
    }

    /// Accept TCP connections on `0.0.0.0:port`. Returns the bound address,
    /// which is useful when asking for an ephemeral port.
    pub async fn listen_tcp(&self, port: u16) -> Result<SocketAddr, ListenError> {
        if self.state.is_closed() {
            return Err(ListenError::Closed);
        }
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let addr = listener.local_addr()?;
        info!("listening on port {}", addr.port());

        let task = tokio::spawn(accept_tcp(
            Arc::clone(&self.state),
            listener,
            self.state.shutdown.subscribe(),
        ));
        self.state.track(task);
        Ok(addr)
    }

    /// Write a message to every connected session, regardless of team.
    pub fn broadcast(&self, message: &Message) {
        let deliveries: Vec<Delivery> = {
            let sessions = self.state.lock_sessions();
            sessions
                .iter()
                .filter_map(|session| session.prepare(message))
                .collect()
        };
        self.state.deliver_all(deliveries);
    }

    /// Snapshot of the current session table.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let sessions = self.state.lock_sessions();
        sessions
            .iter()
            .map(|session| ClientInfo {
                team: session.team.clone(),
                conn_type: session.conn_type,
                handshaken: session.handshaken,
            })
            .collect()
    }

    /// Stop listening, disconnect every session and wait for the broker's
    /// tasks to finish. Idempotent.
    pub async fn close(&self) {
        if self.state.shutdown.send_replace(true) {
            return;
        }
        debug!("shutting down server");

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.state.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        // Stream sessions hear the farewell from their own connection tasks;
        // in-process peers are told here, before the entries are dropped.
        let survivors: Vec<Delivery> = {
            let mut sessions = self.state.lock_sessions();
            let notice = disconnect_notice("Shutting down server");
            sessions
                .drain(..)
                .filter(|session| session.conn_type == ConnectionType::Internal)
                .filter_map(|session| session.prepare(&notice))
                .collect()
        };
        for delivery in survivors {
            let _ = delivery.send();
        }

        let unix_path = self
            .state
            .unix_path
            .lock()
            .expect("unix path lock poisoned")
            .take();
        if let Some(path) = unix_path {
            let _ = std::fs::remove_file(&path);
        }
    }

    pub(crate) fn state(&self) -> &Arc<ServerState> {
        &self.state
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared broker state: the session table and everything the connection
/// tasks need to route messages through it.
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    sessions: Mutex<Vec<Session>>,
    next_id: AtomicU64,
    internal_tx: internal::Queue,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    unix_path: Mutex<Option<PathBuf>>,
}

impl ServerState {
    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, Vec<Session>> {
        self.sessions.lock().expect("session table lock poisoned")
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .expect("task list lock poisoned")
            .push(task);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert_stream(
        &self,
        conn_type: ConnectionType,
        outbox: mpsc::UnboundedSender<Vec<u8>>,
    ) -> SessionId {
        let id = self.next_id();
        self.lock_sessions()
            .push(Session::stream(id, conn_type, outbox));
        id
    }

    pub(crate) fn register_internal(&self, peer: Weak<ClientInner>, team: &str) -> SessionId {
        let id = self.next_id();
        self.lock_sessions().push(Session::internal(id, team, peer));
        debug!(team, "registered in-process client");
        id
    }

    /// Greet a newly registered session with the broker's handshake.
    pub(crate) fn send_server_handshake(&self, id: SessionId) {
        let delivery = {
            let sessions = self.lock_sessions();
            sessions
                .iter()
                .find(|session| session.id == id)
                .and_then(|session| session.prepare(&server_handshake()))
        };
        if let Some(delivery) = delivery
            && let Err(dead) = delivery.send()
        {
            self.remove_session_quiet(dead);
        }
    }

    /// Enqueue a message from an in-process peer, as its `write`.
    pub(crate) fn receive_internal(&self, id: SessionId, message: Message) -> Result<(), ()> {
        self.internal_tx.send((id, message)).map_err(|_| ())
    }

    /// Route one drained internal-queue entry, applying the same session
    /// state machine as the socket path.
    pub(crate) fn handle_internal(&self, id: SessionId, message: Message) {
        match self.handle_message(id, message) {
            Flow::Continue | Flow::HandshakeComplete => {}
            Flow::Close { notify } => {
                if let Some(reason) = notify {
                    self.notify_disconnect(id, reason);
                }
                self.remove_session(id);
            }
        }
    }

    pub(crate) fn session_meta(&self, id: SessionId) -> Option<(String, MessageFormat)> {
        let sessions = self.lock_sessions();
        sessions
            .iter()
            .find(|session| session.id == id)
            .map(|session| (session.team.clone(), session.format))
    }

    /// Interpret one well-formed inbound message from the given session.
    pub(crate) fn handle_message(&self, id: SessionId, mut message: Message) -> Flow {
        let mut invalid_available = false;
        let deliveries: Vec<Delivery> = {
            let mut sessions = self.lock_sessions();
            let Some(index) = sessions.iter().position(|session| session.id == id) else {
                return Flow::Continue;
            };

            if !sessions[index].handshaken {
                if message.ty != MSG_HANDSHAKE
                    || !validate(&message.content, validate::HANDSHAKE_SERVERSIDE)
                {
                    return Flow::Close {
                        notify: Some("Failed handshake"),
                    };
                }
                let session = &mut sessions[index];
                let content = &message.content;
                session.team = content
                    .get("teamname")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let format_byte = content.get("format").and_then(Value::as_u64).unwrap_or(0);
                session.format =
                    MessageFormat::try_from(format_byte as u8).unwrap_or(MessageFormat::Json);
                session.max_msg_length = content
                    .get("max-message-length")
                    .and_then(Value::as_u64)
                    .unwrap_or(u64::from(crate::DEFAULT_MAX_MESSAGE_LENGTH))
                    .min(u64::from(u32::MAX)) as u32;
                session.handshaken = true;
                debug!(team = %session.team, kind = %session.conn_type, "completed handshake");
                return Flow::HandshakeComplete;
            }

            if message.ty == MSG_AVAILABLE {
                if !validate(&message.content, validate::AVAILABLE) {
                    invalid_available = true;
                } else {
                    let ty = message
                        .content
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let available = message
                        .content
                        .get("available")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    let session = &mut sessions[index];
                    if available {
                        session.unavailable.retain(|t| t != &ty);
                    } else if !session.unavailable.contains(&ty) {
                        session.unavailable.push(ty);
                    }
                }
            }

            if invalid_available || message.dest.is_empty() {
                Vec::new()
            } else {
                message.src = sessions[index].team.clone();
                route(sessions.as_slice(), id, &message)
            }
        };

        if invalid_available {
            return match self.error_reply(id, "Incorrect format for $$available message") {
                ErrorOutcome::Fatal => Flow::Close {
                    notify: Some("Failed handshake"),
                },
                ErrorOutcome::Suppressed | ErrorOutcome::Sent => Flow::Continue,
            };
        }

        self.deliver_all(deliveries);
        Flow::Continue
    }

    /// Rate-limited `$$error` reply to one session.
    pub(crate) fn error_reply(&self, id: SessionId, text: &str) -> ErrorOutcome {
        let (handshaken, delivery) = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions.iter_mut().find(|session| session.id == id) else {
                return ErrorOutcome::Suppressed;
            };
            if !session.error_permitted(Instant::now()) {
                return ErrorOutcome::Suppressed;
            }
            let reply = Message {
                ty: MSG_ERROR.to_string(),
                content: Value::String(text.to_string()),
                ..Message::default()
            };
            (session.handshaken, session.prepare(&reply))
        };

        let sent = delivery.is_some_and(|delivery| delivery.send().is_ok());
        if !handshaken || !sent {
            ErrorOutcome::Fatal
        } else {
            ErrorOutcome::Sent
        }
    }

    /// Send `$$disconnect {who: $$you, reason}` to a session the broker is
    /// about to drop.
    pub(crate) fn notify_disconnect(&self, id: SessionId, reason: &str) {
        let delivery = {
            let sessions = self.lock_sessions();
            sessions
                .iter()
                .find(|session| session.id == id)
                .and_then(|session| session.prepare(&disconnect_notice(reason)))
        };
        if let Some(delivery) = delivery {
            let _ = delivery.send();
        }
    }

    /// Remove a session and tell every remaining one who left.
    pub(crate) fn remove_session(&self, id: SessionId) {
        let notices: Vec<Delivery> = {
            let mut sessions = self.lock_sessions();
            let Some(index) = sessions.iter().position(|session| session.id == id) else {
                return;
            };
            let session = sessions.remove(index);
            debug!(team = %session.team, kind = %session.conn_type, "disconnecting client");
            let notice = Message {
                ty: MSG_DISCONNECT.to_string(),
                content: json!({ "who": session.team }),
                ..Message::default()
            };
            sessions
                .iter()
                .filter_map(|remaining| remaining.prepare(&notice))
                .collect()
        };
        self.deliver_all(notices);
    }

    /// Remove a session without notifying anyone.
    pub(crate) fn remove_session_quiet(&self, id: SessionId) {
        let mut sessions = self.lock_sessions();
        sessions.retain(|session| session.id != id);
    }

    /// Execute staged writes; peers that turn out to be gone are purged,
    /// which in turn broadcasts their departure.
    pub(crate) fn deliver_all(&self, deliveries: Vec<Delivery>) {
        let mut dead = Vec::new();
        for delivery in deliveries {
            if let Err(id) = delivery.send() {
                dead.push(id);
            }
        }
        for id in dead {
            self.remove_session(id);
        }
    }
}

/// Select recipients for a routed message, sender excluded.
///
/// `only_first` walks the table in insertion order and takes the first
/// matching session that is available for the message's type; when every
/// match has opted out, the last match still receives it.
fn route(sessions: &[Session], sender: SessionId, message: &Message) -> Vec<Delivery> {
    if message.only_first {
        let mut fall_back = None;
        let mut chosen = None;
        for session in sessions {
            if session.id == sender || !session.matches(&message.dest) {
                continue;
            }
            fall_back = Some(session);
            if session.available(&message.ty) {
                chosen = Some(session);
                break;
            }
        }
        return chosen
            .or(fall_back)
            .and_then(|session| session.prepare(message))
            .into_iter()
            .collect();
    }

    sessions
        .iter()
        .filter(|session| session.id != sender && session.matches(&message.dest))
        .filter_map(|session| session.prepare(message))
        .collect()
}

fn server_handshake() -> Message {
    Message {
        ty: MSG_HANDSHAKE.to_string(),
        content: json!({ "version": CURRENT_VERSION }),
        ..Message::default()
    }
}

fn disconnect_notice(reason: &str) -> Message {
    Message {
        ty: MSG_DISCONNECT.to_string(),
        content: json!({ "reason": reason, "who": MSG_YOU }),
        ..Message::default()
    }
}

async fn accept_tcp(
    state: Arc<ServerState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "new client connected on internet domain");
                    tokio::spawn(serve_connection(
                        Arc::clone(&state),
                        stream,
                        ConnectionType::Tcp,
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
        }
    }
}

async fn accept_unix(
    state: Arc<ServerState>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    debug!("new client connected on unix domain");
                    tokio::spawn(serve_connection(
                        Arc::clone(&state),
                        stream,
                        ConnectionType::Unix,
                        shutdown.clone(),
                    ));
                }
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            }
        }
    }
}

/// Await until the shutdown flag flips to `true`, without holding the
/// watch channel's read guard across an `.await` (which would make the
/// enclosing `select!` future non-`Send`).
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Per-connection event loop: pump the frame reader, drain the session's
/// outbox, and enforce the handshake deadline.
async fn serve_connection<S>(
    state: Arc<ServerState>,
    stream: S,
    conn_type: ConnectionType,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (outbox_tx, mut outbox) = mpsc::unbounded_channel();
    let id = state.insert_stream(conn_type, outbox_tx);

    // Greet before reading anything; a peer that cannot even be greeted is
    // not worth announcing to the others.
    if write_frame(&mut write_half, &server_handshake(), MessageFormat::Json)
        .await
        .is_err()
    {
        state.remove_session_quiet(id);
        return;
    }

    let mut reader = FrameReader::new(state.config.max_msg_length);
    let handshake_deadline = tokio::time::Instant::now() + state.config.handshake_timeout;
    let mut handshaken = false;

    loop {
        tokio::select! {
            result = reader.next_frame(&mut read_half) => match result {
                Ok(frame) => match Message::decode(frame.format, &frame.payload) {
                    Ok(message) => match state.handle_message(id, message) {
                        Flow::Continue => {}
                        Flow::HandshakeComplete => handshaken = true,
                        Flow::Close { notify } => {
                            if let Some(reason) = notify {
                                let format = write_format(&state, id);
                                let _ = write_frame(
                                    &mut write_half,
                                    &disconnect_notice(reason),
                                    format,
                                )
                                .await;
                            }
                            break;
                        }
                    },
                    Err(err) => {
                        let (team, format) = state
                            .session_meta(id)
                            .unwrap_or((crate::TEAM_UNAUTHORISED.to_string(), MessageFormat::Json));
                        let text = format!("Error parsing message from {team}: {err}");
                        warn!("{text}");
                        if matches!(state.error_reply(id, &text), ErrorOutcome::Fatal) {
                            let _ = write_frame(
                                &mut write_half,
                                &disconnect_notice("Failed handshake"),
                                format,
                            )
                            .await;
                            break;
                        }
                    }
                },
                Err(ReadError::Frame(err)) => {
                    if matches!(state.error_reply(id, &err.to_string()), ErrorOutcome::Fatal) {
                        let format = write_format(&state, id);
                        let _ = write_frame(
                            &mut write_half,
                            &disconnect_notice("Failed handshake"),
                            format,
                        )
                        .await;
                        break;
                    }
                }
                Err(ReadError::Closed) => break,
                Err(ReadError::Io(err)) => {
                    debug!(error = %err, "read failed");
                    break;
                }
            },
            Some(frame) = outbox.recv() => {
                let result = async {
                    write_half.write_all(&frame).await?;
                    write_half.flush().await
                }
                .await;
                // Write failure closes the session without further attempts.
                if result.is_err() {
                    break;
                }
            },
            _ = tokio::time::sleep_until(handshake_deadline), if !handshaken => {
                let format = write_format(&state, id);
                let _ = write_frame(
                    &mut write_half,
                    &disconnect_notice("Failed handshake"),
                    format,
                )
                .await;
                break;
            },
            _ = wait_for_shutdown(&mut shutdown) => {
                let format = write_format(&state, id);
                let _ = write_frame(
                    &mut write_half,
                    &disconnect_notice("Shutting down server"),
                    format,
                )
                .await;
                state.remove_session_quiet(id);
                return;
            },
        }
    }

    state.remove_session(id);
}

fn write_format(state: &ServerState, id: SessionId) -> MessageFormat {
    state
        .session_meta(id)
        .map(|(_, format)| format)
        .unwrap_or(MessageFormat::Json)
}
