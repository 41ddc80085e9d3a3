//! Deterministic content hashing for memento cache keys
//!
//! This crate is the foundation of memento's invalidation model: every cache
//! key is ultimately a digest produced here. It provides:
//! - A canonical value model ([`Value`]) for arbitrary structured data
//! - A capability trait ([`Hashable`]) adapting user types onto that model
//! - A streaming hasher ([`ContentHasher`]) with a documented framing rule
//!
//! # Canonicalization
//!
//! Two values hash equal exactly when their canonical forms are equal,
//! independent of container implementation or insertion order:
//! - Maps are hashed in key order
//! - Sets hash each element to a nested digest and feed the sorted digests
//! - Binary buffers are fed to the digest in raw chunks, never through a
//!   textual projection
//! - Every node is framed by a `kind:detail:len` header so that, e.g., the
//!   string `"3"` and the integer `3` can never collide
//!
//! Values with no canonical representation (`NaN`, [`Value::Opaque`]) fail
//! with [`Error::UnhashableValue`]; callers exclude or transform them instead.

mod error;
mod hasher;
mod value;

pub use error::{Error, Result};
pub use hasher::{ContentHasher, HashValue, hash_all, hash_value};
pub use value::{Hashable, Value};
