//! Code-aware memoization.
//!
//! `memento` caches the results of expensive computations under a two-part
//! key. The *identity hash* digests a callable's normalized implementation
//! and every implementation it transitively depends on, so editing code
//! anywhere in the graph retires stale entries without manual version bumps.
//! The *call hash* digests one invocation's effective inputs after argument
//! reconciliation, per-parameter policies, and captured context.
//!
//! [`Checkpoint`] wraps a synchronous computation, [`AsyncCheckpoint`] an
//! awaited one, and [`Stack`] layers several storage backends around a single
//! computation (a fast ephemeral layer over a durable one, for instance).
//!
//! ```no_run
//! use memento::{Args, CallableSpec, Checkpoint, Options, Signature};
//!
//! # fn main() -> memento::Result<()> {
//! let square = Checkpoint::new(
//!     CallableSpec::declared("demo/square", "x * x", vec![]),
//!     Signature::new(["x"]),
//!     Options::new(),
//!     |bound| Ok(bound.i64("x")? * bound.i64("x")?),
//! )?;
//!
//! let n = square.invoke(&Args::new().pos(4i64))?; // computes, stores 16
//! let again = square.invoke(&Args::new().pos(4i64))?; // remembered
//! assert_eq!(n, again);
//! # Ok(())
//! # }
//! ```

mod call;
mod engine;
mod error;
mod ident;

pub use call::{
    ArgPolicies, ArgPolicy, Args, BoundArgs, CapturePolicy, CaptureReader, CaptureSet, Param,
    Signature, TransformFn, call_hash,
};
pub use engine::{
    AsyncCheckpoint, AsyncComputeFn, Backend, BoxFuture, Checkpoint, ComputeFn, Engine, ExpiryFn,
    Options, Stack, Verbosity,
};
pub use error::{Error, Result};
pub use ident::{
    CallableId, CallableIdentity, CallableSpec, DependencyResolver, DependencySource, Registry,
    ResolveError, ResolvedCallable, normalize_body,
};

pub use memento_hash::{ContentHasher, HashValue, Hashable, Value, hash_all, hash_value};
pub use memento_storage::{CheckpointRecord, FileStorage, MemoryStorage, Storage};
