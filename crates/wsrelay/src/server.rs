//! `WsRelayServer` builder and accept loop.
//!
//! This is the entry point for running a wsrelay server. It ties the
//! layers together: the transport accepts and upgrades, the session layer
//! runs each connection, and the router supplied to
//! [`WsRelayServerBuilder::build`] receives every lifecycle event.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use wsrelay_session::{Router, Session, SessionRegistry};
use wsrelay_transport::{HandshakeConfig, Incoming, WebSocketListener};

use crate::WsRelayError;

/// Listener-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `"0.0.0.0:8080"`. Port `0` picks a free port.
    pub bind_addr: String,

    /// Settings for the WebSocket upgrade.
    pub handshake: HandshakeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            handshake: HandshakeConfig::default(),
        }
    }
}

/// Builder for configuring and starting a wsrelay server.
///
/// # Example
///
/// ```rust,no_run
/// use wsrelay::prelude::*;
///
/// struct Echo;
///
/// impl Router for Echo {
///     fn dispatch_message(&self, _path: &str, ctx: MessageContext<'_>) {
///         let _ = ctx.session.send(ctx.payload, ctx.kind);
///     }
/// }
///
/// # async fn run() -> Result<(), WsRelayError> {
/// let server = WsRelayServer::builder()
///     .bind("0.0.0.0:8080")
///     .build(Echo)
///     .await?;
/// server.run().await
/// # }
/// ```
#[derive(Debug, Default)]
pub struct WsRelayServerBuilder {
    config: ServerConfig,
    registry: Option<SessionRegistry>,
}

impl WsRelayServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets how long a client gets to complete the upgrade.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake.handshake_timeout = timeout;
        self
    }

    /// Sets the `Server` header sent on the handshake response.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.handshake.server_name = name.into();
        self
    }

    /// Caps inbound message size. `None` removes the cap.
    pub fn max_message_size(mut self, max: Option<usize>) -> Self {
        self.config.handshake.max_message_size = max;
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `registry` instead of the process-wide one.
    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Binds the listener. Connections are not accepted until
    /// [`WsRelayServer::run`] is called.
    pub async fn build(
        self,
        router: impl Router,
    ) -> Result<WsRelayServer, WsRelayError> {
        let listener = WebSocketListener::bind(
            &self.config.bind_addr,
            self.config.handshake,
        )
        .await?;
        let registry = self
            .registry
            .unwrap_or_else(|| SessionRegistry::global().clone());

        Ok(WsRelayServer {
            listener,
            router: Arc::new(router),
            registry,
        })
    }
}

/// A bound wsrelay server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct WsRelayServer {
    listener: WebSocketListener,
    router: Arc<dyn Router>,
    registry: SessionRegistry,
}

impl WsRelayServer {
    /// Creates a new builder.
    pub fn builder() -> WsRelayServerBuilder {
        WsRelayServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The registry sessions of this server register in.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Runs the accept loop.
    ///
    /// Each accepted connection gets its own task that reads the upgrade
    /// request and then serves the session until it ends. Accept errors are
    /// logged and the loop keeps going; it runs until the task is dropped.
    pub async fn run(self) -> Result<(), WsRelayError> {
        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            "wsrelay server running"
        );

        loop {
            match self.listener.accept().await {
                Ok(incoming) => {
                    let router = Arc::clone(&self.router);
                    let registry = self.registry.clone();
                    tokio::spawn(handle_connection(incoming, router, registry));
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn handle_connection(
    incoming: Incoming,
    router: Arc<dyn Router>,
    registry: SessionRegistry,
) {
    let peer_addr = incoming.peer_addr();
    let pending = match incoming.read_request().await {
        Ok(pending) => pending,
        Err(e) => {
            tracing::warn!(%peer_addr, error = %e, "rejected upgrade request");
            return;
        }
    };
    let path = pending.path().to_string();
    Session::serve(pending, path, router, registry).await;
}
