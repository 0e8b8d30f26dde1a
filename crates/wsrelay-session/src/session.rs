//! The session: one upgraded connection's read/write lifecycle.
//!
//! A session is driven by two tasks:
//! - the task running [`Session::serve`], which performs the handshake and
//!   then owns the read loop, and
//! - a write task that owns the writer half and drains the session's
//!   outbound queue one message at a time.
//!
//! Only the read-loop task dispatches to the router, so the order
//! `open → message* → (close | error)` holds even when a write fails
//! concurrently: the write task records its error and wakes the read loop,
//! which performs the teardown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wsrelay_transport::{
    Connection, MessageKind, MessageReader, MessageWriter, TransportError,
};

use crate::router::{CloseContext, ErrorContext, MessageContext, OpenContext};
use crate::{Router, SessionError, SessionId, SessionRegistry};

/// How long a locally closed session waits for the peer's close reply
/// before it is torn down anyway.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
///
/// ```text
///   Connecting ──(handshake ok)──→ Active ──(close / error)──→ Closing ──→ Closed
///       │                                                                   ↑
///       └──────────────────────(handshake failed)───────────────────────────┘
/// ```
///
/// - **Connecting**: accepted, handshake pending, not addressable.
/// - **Active**: registered, reading, accepting writes.
/// - **Closing**: a close was requested or the connection ended; the
///   terminal event is about to be (or is being) dispatched.
/// - **Closed**: the terminal event was dispatched and the session left
///   the registry. No further I/O happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake pending.
    Connecting,
    /// Open and registered.
    Active,
    /// Shutting down.
    Closing,
    /// Terminal.
    Closed,
}

/// Work items for the write task.
pub(crate) enum Outbound {
    Message(MessageKind, Arc<[u8]>),
    Close,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A single WebSocket session.
///
/// Always handled through an `Arc<Session>`: the registry, the read loop,
/// the write task, and any router that kept a handle share ownership, and
/// the session is freed once the last of them lets go.
pub struct Session {
    id: SessionId,
    path: String,
    state: Mutex<SessionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// First write failure, handed from the write task to the read loop.
    write_failure: Mutex<Option<TransportError>>,
    /// Cancelled when the write task fails and again once teardown is done.
    shutdown: CancellationToken,
    /// Cancelled by a local close; starts the wait for the peer's reply.
    closing: CancellationToken,
    close_deadline: Mutex<Option<Instant>>,
    terminated: AtomicBool,
    router: Arc<dyn Router>,
    registry: SessionRegistry,
}

impl Session {
    /// Creates a session in the `Connecting` state.
    pub(crate) fn new(
        path: String,
        router: Arc<dyn Router>,
        registry: SessionRegistry,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: SessionId::generate(),
            path,
            state: Mutex::new(SessionState::Connecting),
            outbound,
            write_failure: Mutex::new(None),
            shutdown: CancellationToken::new(),
            closing: CancellationToken::new(),
            close_deadline: Mutex::new(None),
            terminated: AtomicBool::new(false),
            router,
            registry,
        });
        (session, outbound_rx)
    }

    /// Runs a connection from handshake to its terminal event.
    ///
    /// On handshake success the session registers itself, dispatches
    /// `open`, and reads until the connection ends. A failed handshake
    /// never registers the session; it is reported as its single `error`
    /// (or `close`, for a peer that hung up mid-handshake) instead. Never
    /// returns an error: every fault becomes a router event.
    pub async fn serve<C: Connection>(
        conn: C,
        path: impl Into<String>,
        router: Arc<dyn Router>,
        registry: SessionRegistry,
    ) {
        let (session, outbound_rx) = Session::new(path.into(), router, registry);

        let (reader, writer) = match conn.handshake().await {
            Ok(halves) => halves,
            Err(e) => {
                tracing::debug!(
                    id = %session.id,
                    path = %session.path,
                    "WebSocket handshake failed"
                );
                session.terminate(e);
                return;
            }
        };

        session.activate();
        tokio::spawn(Arc::clone(&session).write_loop(writer, outbound_rx));
        session.read_loop(reader).await;
    }

    /// Returns the session's id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the path the connection was upgraded on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` while the session accepts writes.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Queues one message for the peer.
    ///
    /// Returns as soon as the write is issued; completion is not awaited.
    /// A write that later fails terminates the session.
    ///
    /// # Errors
    /// - [`SessionError::NotActive`] if the session is not `Active`.
    /// - [`SessionError::InvalidText`] if `kind` is text and the payload
    ///   is not UTF-8.
    pub fn send(
        &self,
        payload: impl Into<Arc<[u8]>>,
        kind: MessageKind,
    ) -> Result<(), SessionError> {
        self.send_shared(kind, payload.into())
    }

    /// Queues a text message.
    pub fn send_text(&self, text: &str) -> Result<(), SessionError> {
        self.send_shared(MessageKind::Text, Arc::from(text.as_bytes()))
    }

    /// Queues a binary message.
    pub fn send_binary(&self, data: &[u8]) -> Result<(), SessionError> {
        self.send_shared(MessageKind::Binary, Arc::from(data))
    }

    /// Queues an already-shared payload. Used by batch sends so every
    /// target shares one snapshot.
    pub(crate) fn send_shared(
        &self,
        kind: MessageKind,
        payload: Arc<[u8]>,
    ) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(self.not_active(state));
        }
        if kind.is_text() && std::str::from_utf8(&payload).is_err() {
            return Err(SessionError::InvalidText(self.id.clone()));
        }

        tracing::trace!(id = %self.id, len = payload.len(), %kind, "message queued");
        self.outbound
            .send(Outbound::Message(kind, payload))
            .map_err(|_| self.not_active(SessionState::Closed))
    }

    /// Starts a local close.
    ///
    /// The session stops accepting writes and sends a close frame after
    /// any writes already queued. The `close` event follows once the peer
    /// acknowledges, or after [`CLOSE_TIMEOUT`] if it never does. Calling
    /// this on a session that is not `Active` does nothing.
    pub fn close(&self) {
        {
            let mut state =
                self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != SessionState::Active {
                return;
            }
            *state = SessionState::Closing;
        }
        tracing::debug!(id = %self.id, path = %self.path, "local close requested");
        *self
            .close_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            Some(Instant::now() + CLOSE_TIMEOUT);
        self.closing.cancel();
        // The write task may already be gone if the connection failed.
        let _ = self.outbound.send(Outbound::Close);
    }

    fn not_active(&self, state: SessionState) -> SessionError {
        SessionError::NotActive {
            id: self.id.clone(),
            state,
        }
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    // -- lifecycle --------------------------------------------------------

    /// `Connecting → Active`: register, then tell the router.
    fn activate(self: &Arc<Self>) {
        self.set_state(SessionState::Active);
        self.registry.insert(Arc::clone(self));
        tracing::info!(id = %self.id, path = %self.path, "session opened");

        self.router.dispatch_open(
            &self.path,
            OpenContext {
                session: self,
                path: &self.path,
            },
        );
    }

    async fn read_loop<R: MessageReader>(self: &Arc<Self>, mut reader: R) {
        let mut buffer = Vec::new();
        loop {
            debug_assert!(buffer.is_empty());

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let cause = self
                        .take_write_failure()
                        .unwrap_or(TransportError::Closed);
                    self.terminate(cause);
                    return;
                }
                _ = self.close_deadline_elapsed() => {
                    tracing::debug!(id = %self.id, "peer did not answer close");
                    self.terminate(TransportError::Closed);
                    return;
                }
                result = reader.read_message(&mut buffer) => result,
            };

            match result {
                Ok(kind) => {
                    tracing::trace!(
                        id = %self.id,
                        len = buffer.len(),
                        %kind,
                        "message received"
                    );
                    self.router.dispatch_message(
                        &self.path,
                        MessageContext {
                            session: self,
                            payload: &buffer,
                            kind,
                            path: &self.path,
                        },
                    );
                    buffer.clear();
                }
                Err(e) => {
                    self.terminate(e);
                    return;
                }
            }
        }
    }

    async fn write_loop<W: MessageWriter>(
        self: Arc<Self>,
        mut writer: W,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = outbound_rx.recv() => next,
            };
            // The sender lives inside `self`, so the queue never closes here.
            let Some(item) = next else { break };

            let write = async {
                match item {
                    Outbound::Message(kind, payload) => {
                        writer.write_message(kind, payload).await
                    }
                    Outbound::Close => writer.close().await,
                }
            };
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = write => result,
            };

            if let Err(e) = result {
                self.record_write_failure(e);
                break;
            }
        }
        tracing::debug!(id = %self.id, "write task finished");
    }

    /// Completes once a local close has waited its full timeout.
    async fn close_deadline_elapsed(&self) {
        self.closing.cancelled().await;
        let deadline = *self
            .close_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(deadline) = deadline {
            tokio::time::sleep_until(deadline).await;
        }
    }

    fn record_write_failure(&self, e: TransportError) {
        {
            let mut slot = self
                .write_failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(e);
            }
        }
        self.shutdown.cancel();
    }

    fn take_write_failure(&self) -> Option<TransportError> {
        self.write_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// `Connecting | Active | Closing → Closed`: leave the registry, then
    /// dispatch the single terminal event.
    ///
    /// Every terminal transition removes the registry entry, including
    /// the error path, so no stale session stays addressable. A session
    /// whose handshake failed was never registered and only dispatches.
    fn terminate(self: &Arc<Self>, cause: TransportError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(SessionState::Closing);
        self.registry.remove_session(self);

        if cause.is_normal_closure() {
            tracing::info!(id = %self.id, path = %self.path, "session closed");
            self.router.dispatch_close(
                &self.path,
                CloseContext {
                    session: self,
                    path: &self.path,
                    cause: &cause,
                },
            );
        } else {
            tracing::warn!(
                id = %self.id,
                path = %self.path,
                error = %cause,
                "session terminated by transport error"
            );
            self.router.dispatch_error(
                &self.path,
                ErrorContext {
                    session: self,
                    path: &self.path,
                    error: &cause,
                },
            );
        }

        self.set_state(SessionState::Closed);
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for unit tests that need sessions without a connection.

    use super::*;

    /// A router that ignores every event.
    pub(crate) struct NoopRouter;

    impl Router for NoopRouter {
        fn dispatch_message(&self, _path: &str, _ctx: MessageContext<'_>) {}
    }

    /// An `Active`, registered session plus the receiving end of its
    /// outbound queue (kept so sends succeed).
    pub(crate) fn active_session(
        registry: &SessionRegistry,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let (session, rx) =
            Session::new("/test".into(), Arc::new(NoopRouter), registry.clone());
        session.set_state(SessionState::Active);
        registry.insert(Arc::clone(&session));
        (session, rx)
    }

    /// Drains the queue, returning the queued messages.
    pub(crate) fn drain(
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Vec<(MessageKind, Vec<u8>)> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(kind, payload) = item {
                out.push((kind, payload.to_vec()));
            }
        }
        out
    }
}
