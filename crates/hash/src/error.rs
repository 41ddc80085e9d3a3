//! Error types for content hashing

use miette::Diagnostic;
use thiserror::Error;

/// Error type for hashing operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// A value reachable during hashing has no canonical representation
    #[error("Value of type `{type_name}` has no canonical representation")]
    #[diagnostic(
        code(memento::hash::unhashable),
        help("Implement `Hashable` for the type, or mark the parameter as Excluded or Transform")
    )]
    UnhashableValue {
        /// Name of the offending type
        type_name: String,
    },

    /// A digest string failed validation
    #[error("Invalid digest: {message}")]
    #[diagnostic(code(memento::hash::invalid_digest))]
    InvalidDigest {
        /// What was wrong with the digest string
        message: String,
    },
}

impl Error {
    /// Create an unhashable-value error
    #[must_use]
    pub fn unhashable(type_name: impl Into<String>) -> Self {
        Self::UnhashableValue {
            type_name: type_name.into(),
        }
    }

    /// Create an invalid-digest error
    #[must_use]
    pub fn invalid_digest(msg: impl Into<String>) -> Self {
        Self::InvalidDigest {
            message: msg.into(),
        }
    }
}

/// Result type for hashing operations
pub type Result<T> = std::result::Result<T, Error>;
