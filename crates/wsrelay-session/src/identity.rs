//! Session identifiers and the generator that mints them.
//!
//! An id is the only handle a session exposes outside the process, so it
//! must be unique for as long as the process runs. Ids are 128 random
//! bits rendered as a canonical hyphenated UUID (version 4 layout), e.g.
//! `"3f0d1c52-9a5e-4b8e-a2f4-6c1d7e0b9a31"`.

use std::borrow::Borrow;
use std::fmt;
use std::sync::{LazyLock, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// The process-wide generator behind [`SessionId::generate`].
static GENERATOR: LazyLock<IdGenerator> = LazyLock::new(IdGenerator::new);

/// The string identifier of a session.
///
/// Serializes as a plain string, so it can be handed to clients and come
/// back in later requests unchanged.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mints a fresh id from the process-wide generator.
    pub fn generate() -> Self {
        GENERATOR.generate()
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id, returning the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Lets `HashMap<SessionId, _>` be queried with a plain `&str`.
impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Generates session ids from a seeded RNG behind its own lock.
///
/// The lock is independent of the registry lock, so minting ids never
/// contends with registry mutation.
pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl IdGenerator {
    /// Creates a generator seeded from the operating system.
    ///
    /// # Panics
    /// Panics if the OS entropy source is unavailable; there is no
    /// meaningful way to continue without one.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Returns a new, random session id.
    pub fn generate(&self) -> SessionId {
        let bytes: [u8; 16] = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random();
        let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
        SessionId(uuid.hyphenated().to_string())
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
