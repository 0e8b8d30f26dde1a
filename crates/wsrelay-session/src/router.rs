//! The router boundary: where session lifecycle events leave the core.
//!
//! wsrelay does not decide what a message means. Each session hands its
//! four lifecycle events to a [`Router`], tagged with the path the
//! connection was upgraded on:
//!
//! | Event     | When                                         |
//! |-----------|----------------------------------------------|
//! | `open`    | handshake done, session registered           |
//! | `message` | one complete inbound message                 |
//! | `error`   | the connection failed with a transport fault |
//! | `close`   | the connection ended normally                |
//!
//! Every opened session produces `open`, any number of `message`s, then
//! exactly one of `error` or `close`. A session whose handshake failed
//! produces only that final `error` or `close`.
//!
//! Dispatch is synchronous and runs on the session's read task, so a
//! router must not block. Writing to sessions from a router is fine:
//! [`Session::send`] only queues.

use std::collections::HashMap;
use std::sync::Arc;

use wsrelay_transport::{MessageKind, TransportError};

use crate::Session;

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// Passed with the `open` event.
#[derive(Debug, Clone, Copy)]
pub struct OpenContext<'a> {
    /// The session that just opened. Clone the `Arc` to keep it.
    pub session: &'a Arc<Session>,
    /// The upgrade path.
    pub path: &'a str,
}

/// Passed with each `message` event.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    /// The receiving session.
    pub session: &'a Arc<Session>,
    /// The complete message payload, exactly as received.
    pub payload: &'a [u8],
    /// Whether the message arrived as a text or binary frame.
    pub kind: MessageKind,
    /// The upgrade path.
    pub path: &'a str,
}

impl<'a> MessageContext<'a> {
    /// Returns `true` if the message arrived as a text frame.
    pub fn is_text(&self) -> bool {
        self.kind.is_text()
    }

    /// Returns the payload as `&str` for text messages.
    pub fn text(&self) -> Option<&'a str> {
        if self.is_text() {
            std::str::from_utf8(self.payload).ok()
        } else {
            None
        }
    }
}

/// Passed with the `error` event.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    /// The failed session. It has already left the registry.
    pub session: &'a Arc<Session>,
    /// The upgrade path.
    pub path: &'a str,
    /// The fault that ended the connection.
    pub error: &'a TransportError,
}

/// Passed with the `close` event.
#[derive(Debug, Clone, Copy)]
pub struct CloseContext<'a> {
    /// The closed session. It has already left the registry.
    pub session: &'a Arc<Session>,
    /// The upgrade path.
    pub path: &'a str,
    /// The closure-class condition that ended the connection.
    pub cause: &'a TransportError,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Receives session lifecycle events.
///
/// Only `dispatch_message` is required; the other events default to
/// doing nothing.
///
/// # Example
///
/// ```rust
/// use wsrelay_session::{MessageContext, Router};
///
/// /// Sends every message straight back to its sender.
/// struct Echo;
///
/// impl Router for Echo {
///     fn dispatch_message(&self, _path: &str, ctx: MessageContext<'_>) {
///         let _ = ctx.session.send(ctx.payload, ctx.kind);
///     }
/// }
/// ```
pub trait Router: Send + Sync + 'static {
    /// A session finished its handshake and is now addressable.
    fn dispatch_open(&self, path: &str, ctx: OpenContext<'_>) {
        let _ = (path, ctx);
    }

    /// A session received one complete message.
    fn dispatch_message(&self, path: &str, ctx: MessageContext<'_>);

    /// A session failed with a transport fault.
    fn dispatch_error(&self, path: &str, ctx: ErrorContext<'_>) {
        let _ = (path, ctx);
    }

    /// A session ended normally.
    fn dispatch_close(&self, path: &str, ctx: CloseContext<'_>) {
        let _ = (path, ctx);
    }
}

impl<R: Router + ?Sized> Router for Arc<R> {
    fn dispatch_open(&self, path: &str, ctx: OpenContext<'_>) {
        (**self).dispatch_open(path, ctx)
    }

    fn dispatch_message(&self, path: &str, ctx: MessageContext<'_>) {
        (**self).dispatch_message(path, ctx)
    }

    fn dispatch_error(&self, path: &str, ctx: ErrorContext<'_>) {
        (**self).dispatch_error(path, ctx)
    }

    fn dispatch_close(&self, path: &str, ctx: CloseContext<'_>) {
        (**self).dispatch_close(path, ctx)
    }
}

// ---------------------------------------------------------------------------
// PathRouter
// ---------------------------------------------------------------------------

/// A [`Router`] that forwards each event to the router mounted on the
/// event's path.
///
/// Paths match exactly. Events on an unmounted path go to the fallback
/// router if one is set and are dropped otherwise.
#[derive(Default)]
pub struct PathRouter {
    routes: HashMap<String, Arc<dyn Router>>,
    fallback: Option<Arc<dyn Router>>,
}

impl PathRouter {
    /// Creates a router with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `router` on `path`, replacing any router already there.
    pub fn route(mut self, path: impl Into<String>, router: impl Router) -> Self {
        self.routes.insert(path.into(), Arc::new(router));
        self
    }

    /// Sets the router for paths with no mounted route.
    pub fn fallback(mut self, router: impl Router) -> Self {
        self.fallback = Some(Arc::new(router));
        self
    }

    fn resolve(&self, path: &str) -> Option<&Arc<dyn Router>> {
        let found = self.routes.get(path).or(self.fallback.as_ref());
        if found.is_none() {
            tracing::debug!(path, "no route for path; event dropped");
        }
        found
    }
}

impl Router for PathRouter {
    fn dispatch_open(&self, path: &str, ctx: OpenContext<'_>) {
        if let Some(router) = self.resolve(path) {
            router.dispatch_open(path, ctx);
        }
    }

    fn dispatch_message(&self, path: &str, ctx: MessageContext<'_>) {
        if let Some(router) = self.resolve(path) {
            router.dispatch_message(path, ctx);
        }
    }

    fn dispatch_error(&self, path: &str, ctx: ErrorContext<'_>) {
        if let Some(router) = self.resolve(path) {
            router.dispatch_error(path, ctx);
        }
    }

    fn dispatch_close(&self, path: &str, ctx: CloseContext<'_>) {
        if let Some(router) = self.resolve(path) {
            router.dispatch_close(path, ctx);
        }
    }
}
