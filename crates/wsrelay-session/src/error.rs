//! Error types for the session layer.

use crate::{SessionId, SessionState};

/// Errors returned to callers that act on a session directly.
///
/// I/O faults never show up here: a session converts them into a single
/// `error` or `close` event for its router instead.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session is not accepting writes: it has not finished its
    /// handshake yet, or it is closing or closed.
    #[error("session {id} is not active (state: {state:?})")]
    NotActive {
        /// The session that rejected the write.
        id: SessionId,
        /// Its state at the time of the call.
        state: SessionState,
    },

    /// A text message was requested for a payload that is not UTF-8.
    #[error("session {0}: text payload is not valid UTF-8")]
    InvalidText(SessionId),
}
