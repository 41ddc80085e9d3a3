//! Pluggable checkpoint storage backends for memento
//!
//! A checkpoint engine addresses every cached result by the pair
//! `(identity container, call hash)`:
//! - the *identity container* (`fn_key`) is the callable's stable path joined
//!   with its identity hash, so a behavior change lands in a fresh container
//! - the *call hash* addresses one invocation's record inside that container
//!
//! Backends implement the [`Storage`] trait. Two built-ins are provided:
//! - [`MemoryStorage`]: an unbounded in-process map, discarded at process end
//! - [`FileStorage`]: one JSON record per call at
//!   `root/<fn_key>/<call_hash>.json`; removing the container directory is the
//!   natural unit of bulk invalidation
//!
//! Staleness is never decided here: backends report what they hold and when
//! it was created, the engine decides whether that is still fresh.

mod error;
mod file;
mod memory;

pub use error::{Error, Result};
pub use file::FileStorage;
pub use memory::MemoryStorage;

use chrono::{DateTime, Utc};
use memento_hash::HashValue;
use serde::{Deserialize, Serialize};

/// What a backend persists for one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// When the result was stored
    pub created_at: DateTime<Utc>,
    /// The serialized computation result
    pub payload: serde_json::Value,
}

impl CheckpointRecord {
    /// Create a record stamped with the current time
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            created_at: Utc::now(),
            payload,
        }
    }
}

/// Capability contract any checkpoint backend implements.
///
/// Retry policy for transient I/O failures, if any, is the backend's
/// responsibility; the engine propagates [`Error`]s unchanged.
pub trait Storage: Send + Sync {
    /// Whether a record exists for `(fn_key, call_hash)`
    fn exists(&self, fn_key: &str, call_hash: &HashValue) -> Result<bool>;

    /// Creation timestamp of the record, [`Error::NotFound`] if absent
    fn checkpoint_date(&self, fn_key: &str, call_hash: &HashValue) -> Result<DateTime<Utc>>;

    /// Load the stored payload, [`Error::NotFound`] if absent
    fn load(&self, fn_key: &str, call_hash: &HashValue) -> Result<serde_json::Value>;

    /// Persist a record, overwriting any previous one.
    ///
    /// Echoes the payload back so a backend may return a round-tripped
    /// representation of what it actually persisted.
    fn store(
        &self,
        fn_key: &str,
        call_hash: &HashValue,
        record: CheckpointRecord,
    ) -> Result<serde_json::Value>;

    /// Remove one record; a no-op if absent
    fn delete(&self, fn_key: &str, call_hash: &HashValue) -> Result<()>;

    /// Remove every record in the identity container; a no-op if absent
    fn clear(&self, fn_key: &str) -> Result<()>;
}
