/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer sent a close frame, or the connection was already closed.
    #[error("connection closed")]
    Closed,

    /// The underlying stream ended without a closing handshake.
    #[error("end of stream")]
    Eof,

    /// The WebSocket upgrade handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// Receiving a message failed.
    #[error("receive failed: {0}")]
    Read(#[source] std::io::Error),

    /// Sending a message failed.
    #[error("send failed: {0}")]
    Write(#[source] std::io::Error),

    /// A text message was requested for a payload that is not UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidText,

    /// An inbound message exceeded the configured size limit.
    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

impl TransportError {
    /// Returns `true` for the closure-class errors that signal an orderly
    /// disconnect rather than a fault.
    ///
    /// Sessions surface these as a `close` event, never as an `error`.
    pub fn is_normal_closure(&self) -> bool {
        matches!(self, Self::Closed | Self::Eof)
    }
}
