//! # wsrelay
//!
//! Per-connection WebSocket session manager.
//!
//! Every upgraded connection becomes a [`Session`](wsrelay_session::Session)
//! with a unique id. Sessions register themselves in a shared registry for
//! as long as they are open, so any code holding a list of ids can write to
//! those peers in one call. Lifecycle events (`open`, `message`, `error`,
//! `close`) go to a [`Router`](wsrelay_session::Router) you supply.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wsrelay::prelude::*;
//!
//! struct Echo;
//!
//! impl Router for Echo {
//!     fn dispatch_message(&self, _path: &str, ctx: MessageContext<'_>) {
//!         let _ = ctx.session.send(ctx.payload, ctx.kind);
//!     }
//! }
//!
//! # async fn run() -> Result<(), WsRelayError> {
//! wsrelay::init_tracing("info");
//! let server = WsRelayServer::builder()
//!     .bind("0.0.0.0:8080")
//!     .build(Echo)
//!     .await?;
//! server.run().await
//! # }
//! ```

mod error;
mod server;

pub use error::WsRelayError;
pub use server::{ServerConfig, WsRelayServer, WsRelayServerBuilder};

pub use wsrelay_session as session;
pub use wsrelay_transport as transport;

use tracing_subscriber::prelude::*;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` when the variable is unset or invalid.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing(default_directive: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .try_init();
}

/// Everything a typical server needs.
pub mod prelude {
    pub use crate::{
        ServerConfig, WsRelayError, WsRelayServer, WsRelayServerBuilder,
    };
    pub use wsrelay_session::{
        CloseContext, ErrorContext, MessageContext, MessageKind, OpenContext,
        PathRouter, Router, Session, SessionError, SessionId, SessionRegistry,
        SessionState,
    };
    pub use wsrelay_transport::{HandshakeConfig, TransportError};
}
