//! Unified error type for wsrelay.

use wsrelay_session::SessionError;
use wsrelay_transport::TransportError;

/// Top-level error that wraps the layer-specific errors.
///
/// `#[from]` on each variant lets `?` convert layer errors directly.
#[derive(Debug, thiserror::Error)]
pub enum WsRelayError {
    /// Binding or accepting on the listener failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A direct session operation was rejected.
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use std::io;

    use wsrelay_session::{SessionId, SessionState};

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::Accept(io::Error::new(
            io::ErrorKind::AddrInUse,
            "port taken",
        ));
        let relay_err: WsRelayError = err.into();
        assert!(matches!(relay_err, WsRelayError::Transport(_)));
        assert!(relay_err.to_string().contains("port taken"));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::NotActive {
            id: SessionId::from("abc"),
            state: SessionState::Closed,
        };
        let relay_err: WsRelayError = err.into();
        assert!(matches!(relay_err, WsRelayError::Session(_)));
        assert!(relay_err.to_string().contains("abc"));
    }
}
