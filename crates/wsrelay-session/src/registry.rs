//! The session registry: every live session, addressable by id.
//!
//! Sessions insert themselves when their handshake succeeds and remove
//! themselves on their terminal transition. Routers handling another
//! session's message, or background jobs, look sessions up here to write
//! to them.
//!
//! # Concurrency note
//!
//! The whole map sits behind one `std::sync::Mutex`. Every critical
//! section is a single map operation; the lock is never held across an
//! `.await`. Actions run under the lock (see [`SessionRegistry::resolve_many`])
//! must not block: session writes only enqueue onto the session's write
//! task.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use wsrelay_transport::MessageKind;

use crate::{Session, SessionId};

static GLOBAL: LazyLock<SessionRegistry> = LazyLock::new(SessionRegistry::new);

/// A shared directory of live sessions keyed by [`SessionId`].
///
/// Cloning is cheap and yields a handle to the same map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, Arc<Session>>>>,
}

impl SessionRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static SessionRegistry {
        &GLOBAL
    }

    /// Registers a session under its id.
    ///
    /// Ids are unique by construction; should one repeat anyway, the new
    /// session replaces the old entry, which is returned.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let id = session.id().clone();
        let replaced = self.lock().insert(id, session);
        if let Some(old) = &replaced {
            tracing::warn!(id = %old.id(), "session id registered twice; replacing");
        }
        replaced
    }

    /// Removes the entry for `id`, if any. Removing an unknown id is a
    /// no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().remove(id)
    }

    /// Removes `session`'s entry only if it still points at this very
    /// session, so a replaced session cannot evict its replacement.
    pub(crate) fn remove_session(&self, session: &Session) -> bool {
        let mut sessions = self.lock();
        let same = sessions
            .get(session.id().as_str())
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), session));
        if same {
            sessions.remove(session.id().as_str());
        }
        same
    }

    /// Looks up a session by id.
    pub fn resolve(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    /// Runs `action` on every session whose id is in `ids` and returns how
    /// many times it reported success.
    ///
    /// Unknown ids are skipped; a stale id is an expected condition, not a
    /// failure. `action` runs with the registry locked and must not block.
    pub fn resolve_many<I, F>(&self, ids: I, mut action: F) -> usize
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        F: FnMut(&Arc<Session>) -> bool,
    {
        let sessions = self.lock();
        ids.into_iter()
            .filter_map(|id| sessions.get(id.as_ref()))
            .filter(|session| action(*session))
            .count()
    }

    /// Sends one payload to every listed session.
    ///
    /// The payload is snapshotted once and shared by all targets. Returns
    /// the number of sessions the write was issued to; delivery to the
    /// peer is not awaited.
    pub fn send_to<I>(
        &self,
        ids: I,
        payload: impl Into<Arc<[u8]>>,
        kind: MessageKind,
    ) -> usize
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let payload = payload.into();
        self.resolve_many(ids, |session| {
            match session.send_shared(kind, Arc::clone(&payload)) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping session in batch send");
                    false
                }
            }
        })
    }

    /// Sends one payload to a single session. Returns `true` if the write
    /// was issued.
    pub fn send(
        &self,
        id: &str,
        payload: impl Into<Arc<[u8]>>,
        kind: MessageKind,
    ) -> bool {
        self.send_to([id], payload, kind) > 0
    }

    /// Returns a snapshot of the registered ids.
    pub fn ids(&self) -> Vec<SessionId> {
        self.lock().keys().cloned().collect()
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no session is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Poisoning cannot leave the map half-updated: every critical section
    // is a single std map call.
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

// =========================================================================
// Tests
// =========================================================================
