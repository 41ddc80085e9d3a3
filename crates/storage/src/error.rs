//! Error types for storage backends

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for storage operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during a storage operation
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(memento::storage::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// No record for the requested key
    #[error("Checkpoint not found: {key}")]
    #[diagnostic(
        code(memento::storage::not_found),
        help("The entry may have been deleted or never stored")
    )]
    NotFound {
        /// The `(fn_key, call_hash)` rendering of the missing entry
        key: String,
    },

    /// Record serialization or deserialization failed
    #[error("Serialization error: {message}")]
    #[diagnostic(code(memento::storage::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// Backend configuration problem
    #[error("Storage configuration error: {message}")]
    #[diagnostic(code(memento::storage::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a not-found error from the addressing pair
    #[must_use]
    pub fn not_found(fn_key: &str, call_hash: impl std::fmt::Display) -> Self {
        Self::NotFound {
            key: format!("{fn_key}/{call_hash}"),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Whether this error means "nothing stored", as opposed to a failure
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;
