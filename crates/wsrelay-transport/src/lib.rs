//! Transport abstraction layer for wsrelay.
//!
//! Provides the [`Connection`], [`MessageReader`] and [`MessageWriter`]
//! traits that the session layer drives. A connection starts out
//! pre-handshake; completing the handshake splits it into a reader half
//! (owned by the session's read loop) and a writer half (owned by the
//! session's write task).
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

mod error;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{
    HandshakeConfig, Incoming, PendingWebSocket, WebSocketListener,
    WebSocketReader, WebSocketWriter,
};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Whether a message travels as a text or a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

impl MessageKind {
    /// Maps a text/binary flag onto a `MessageKind`.
    pub fn from_text_flag(is_text: bool) -> Self {
        if is_text { Self::Text } else { Self::Binary }
    }

    /// Returns `true` for [`MessageKind::Text`].
    pub fn is_text(self) -> bool {
        matches!(self, Self::Text)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Binary => f.write_str("binary"),
        }
    }
}

/// An accepted connection that has not completed its handshake yet.
pub trait Connection: Send + 'static {
    /// The receiving half produced by a successful handshake.
    type Reader: MessageReader;
    /// The sending half produced by a successful handshake.
    type Writer: MessageWriter;

    /// Completes the upgrade handshake and splits the connection.
    fn handshake(
        self,
    ) -> impl Future<Output = Result<(Self::Reader, Self::Writer), TransportError>>
    + Send;
}

/// The receiving half of an open connection.
pub trait MessageReader: Send + 'static {
    /// Reads the next complete message, appending its payload to `buf`.
    ///
    /// Control frames are handled internally and never returned. A close
    /// from the peer surfaces as an error for which
    /// [`TransportError::is_normal_closure`] is `true`.
    fn read_message(
        &mut self,
        buf: &mut Vec<u8>,
    ) -> impl Future<Output = Result<MessageKind, TransportError>> + Send;
}

/// The sending half of an open connection.
pub trait MessageWriter: Send + 'static {
    /// Writes one complete message.
    fn write_message(
        &mut self,
        kind: MessageKind,
        payload: Arc<[u8]>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Starts the closing handshake.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
