//! WebSocket session management for wsrelay.
//!
//! This crate owns the lifecycle of every upgraded connection:
//!
//! 1. **Identity**: each session gets a unique [`SessionId`]
//! 2. **Lifecycle**: [`Session::serve`] runs handshake, read loop, writes,
//!    and teardown for one connection
//! 3. **Directory**: live sessions are addressable by id through the
//!    [`SessionRegistry`], including batch sends to many ids at once
//! 4. **Dispatch**: lifecycle events go out to a [`Router`]
//!
//! # How it fits in the stack
//!
//! ```text
//! Router (above)        ← your code: reacts to open / message / error / close
//!     ↕
//! Session Layer (this crate)  ← session state machine + registry
//!     ↕
//! Transport Layer (below)     ← handshake, framed reads and writes
//! ```

mod error;
mod identity;
mod registry;
mod router;
mod session;

pub use error::SessionError;
pub use identity::{IdGenerator, SessionId};
pub use registry::SessionRegistry;
pub use router::{
    CloseContext, ErrorContext, MessageContext, OpenContext, PathRouter, Router,
};
pub use session::{CLOSE_TIMEOUT, Session, SessionState};
pub use wsrelay_transport::MessageKind;
