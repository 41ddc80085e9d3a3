//! Error types for the checkpoint engine

use miette::Diagnostic;
use thiserror::Error;

use crate::ident::CallableId;

/// Error type for checkpoint operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// `get` found no valid entry; expected and recoverable
    #[error("Cache miss: {key}")]
    #[diagnostic(
        code(memento::engine::cache_miss),
        help("Call `invoke` to compute and store the result")
    )]
    CacheMiss {
        /// The `(identity, call hash)` rendering of the missed entry
        key: String,
    },

    /// A value reachable during hashing has no canonical representation
    #[error(transparent)]
    #[diagnostic(transparent)]
    Hash(#[from] memento_hash::Error),

    /// Backend I/O failure, propagated unchanged
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] memento_storage::Error),

    /// Arguments could not be reconciled against the declared parameters
    #[error("Argument binding error: {message}")]
    #[diagnostic(code(memento::engine::binding))]
    Binding {
        /// What went wrong while binding
        message: String,
    },

    /// The dependency resolver failed for the callable itself.
    ///
    /// Failures on *dependencies* are soft and degrade to a
    /// dependency-incomplete identity; this variant is only for a callable
    /// whose own body cannot be obtained at all.
    #[error("Failed to resolve callable `{id}`: {message}")]
    #[diagnostic(code(memento::engine::resolver))]
    Resolver {
        /// The callable that could not be resolved
        id: CallableId,
        /// Resolver-reported reason
        message: String,
    },

    /// The wrapped computation itself failed
    #[error("Computation failed: {message}")]
    #[diagnostic(code(memento::engine::computation))]
    Computation {
        /// Error message reported by the computation
        message: String,
    },
}

impl Error {
    /// Create a cache-miss error from the addressing pair
    #[must_use]
    pub fn cache_miss(fn_key: &str, call_hash: impl std::fmt::Display) -> Self {
        Self::CacheMiss {
            key: format!("{fn_key}/{call_hash}"),
        }
    }

    /// Create an argument binding error
    #[must_use]
    pub fn binding(msg: impl Into<String>) -> Self {
        Self::Binding {
            message: msg.into(),
        }
    }

    /// Create a computation error
    #[must_use]
    pub fn computation(msg: impl Into<String>) -> Self {
        Self::Computation {
            message: msg.into(),
        }
    }

    /// Whether this error is a recoverable cache miss
    #[must_use]
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Self::CacheMiss { .. })
    }
}

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, Error>;
