//! The checkpoint engine: lookup, execute, store
//!
//! Per call the engine walks `LOOKUP -> {HIT, MISS}`; a miss continues
//! `EXECUTE -> STORE`; either way the result is returned. The identity hash
//! is computed lazily once per callable (memoized in the registry), the call
//! hash on every invocation.
//!
//! Two concurrent calls sharing an identical `(identity, call hash)` are not
//! deduplicated: each executes independently and the later store wins. That
//! is a deliberate limitation; adding a locking layer would be a separate
//! revision.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use memento_hash::HashValue;
use memento_storage::{CheckpointRecord, FileStorage, MemoryStorage, Storage};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::call::{ArgPolicies, Args, BoundArgs, CaptureSet, Signature, call_hash};
use crate::error::{Error, Result};
use crate::ident::{CallableIdentity, CallableSpec, DependencySource, Registry};

/// Storage backend selector
#[derive(Clone, Default)]
pub enum Backend {
    /// Ephemeral in-process mapping
    #[default]
    Memory,
    /// Durable filesystem backend; `None` resolves the default root
    File {
        /// Base directory for checkpoint containers
        root: Option<PathBuf>,
    },
    /// Caller-supplied backend
    Custom(Arc<dyn Storage>),
}

impl Backend {
    fn build(&self) -> Result<Arc<dyn Storage>> {
        Ok(match self {
            Self::Memory => Arc::new(MemoryStorage::new()),
            Self::File { root: Some(root) } => Arc::new(FileStorage::new(root.clone())),
            Self::File { root: None } => Arc::new(FileStorage::new_default()?),
            Self::Custom(storage) => Arc::clone(storage),
        })
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::File { root } => f.debug_struct("File").field("root", root).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// How much the engine says about cache activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// No log output
    Silent,
    /// Log "computed" vs "remembered" per invocation
    #[default]
    Coarse,
    /// Also log individual cache hits with their call hash
    PerCall,
}

/// Expiration predicate over a record's creation timestamp
pub type ExpiryFn = Arc<dyn Fn(DateTime<Utc>) -> bool + Send + Sync>;

/// Engine configuration
#[derive(Clone)]
pub struct Options {
    /// Storage backend selector
    pub backend: Backend,
    /// When false, bypass all hashing and storage and call straight through
    pub enabled: bool,
    /// Treat every capture field as `EveryCall` unless individually excluded
    pub capture_all: bool,
    /// Entries whose timestamp satisfies the predicate are treated as misses.
    /// Absent means never expires. A panicking predicate propagates.
    pub expiry: Option<ExpiryFn>,
    /// Replaces the computed identity hash outright
    pub ident_override: Option<HashValue>,
    /// Log verbosity
    pub verbosity: Verbosity,
}

impl Options {
    /// Defaults: memory backend, enabled, coarse verbosity, never expires
    #[must_use]
    pub fn new() -> Self {
        Self {
            backend: Backend::Memory,
            enabled: true,
            capture_all: false,
            expiry: None,
            ident_override: None,
            verbosity: Verbosity::Coarse,
        }
    }

    /// Select the storage backend
    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Bypass hashing and storage entirely
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Treat every capture field as `EveryCall` unless excluded
    #[must_use]
    pub fn capture_all(mut self) -> Self {
        self.capture_all = true;
        self
    }

    /// Treat entries as expired when the predicate holds for their timestamp
    #[must_use]
    pub fn expire_when(
        mut self,
        predicate: impl Fn(DateTime<Utc>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.expiry = Some(Arc::new(predicate));
        self
    }

    /// Pin the identity hash, skipping dependency resolution
    #[must_use]
    pub fn override_identity(mut self, hash: HashValue) -> Self {
        self.ident_override = Some(hash);
        self
    }

    /// Set log verbosity
    #[must_use]
    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("backend", &self.backend)
            .field("enabled", &self.enabled)
            .field("capture_all", &self.capture_all)
            .field("expiry", &self.expiry.as_ref().map(|_| "Fn(..)"))
            .field("ident_override", &self.ident_override)
            .field("verbosity", &self.verbosity)
            .finish()
    }
}

/// Fully resolved address of one call
struct CallKey {
    fn_key: String,
    call_hash: HashValue,
}

/// Untyped engine core: hashing, lookup, store, and the maintenance surface.
///
/// [`Checkpoint`], [`AsyncCheckpoint`] and [`Stack`] layer typed computations
/// on top; everything here works on serialized payloads.
pub struct Engine {
    spec: CallableSpec,
    signature: Signature,
    policies: ArgPolicies,
    captures: CaptureSet,
    options: Options,
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    once_memo: Mutex<BTreeMap<String, HashValue>>,
}

impl Engine {
    /// Create an engine for a callable against the process-wide registry
    pub fn new(spec: CallableSpec, signature: Signature, options: Options) -> Result<Self> {
        let storage = options.backend.build()?;
        Ok(Self {
            spec,
            signature,
            policies: ArgPolicies::new(),
            captures: CaptureSet::new(),
            options,
            registry: Registry::global(),
            storage,
            once_memo: Mutex::new(BTreeMap::new()),
        })
    }

    /// Set per-parameter hashing policies
    #[must_use]
    pub fn with_policies(mut self, policies: ArgPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Set the capture context
    #[must_use]
    pub fn with_captures(mut self, captures: CaptureSet) -> Self {
        self.captures = captures;
        self
    }

    /// Use a dedicated registry instead of the process-wide one
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    /// The callable's memoized identity
    pub fn identity(&self) -> Result<Arc<CallableIdentity>> {
        // Keep this callable's declaration visible to dependents sharing the
        // registry; the spec is the source of truth for its own body
        if let DependencySource::Declared { body, depends } = &self.spec.source {
            self.registry
                .declare(self.spec.id.clone(), body.clone(), depends.clone());
        }
        self.registry
            .identity(&self.spec, self.options.ident_override.as_ref())
    }

    fn fn_key(&self) -> Result<String> {
        let identity = self.identity()?;
        Ok(format!("{}/{}", self.spec.id, identity.hash()))
    }

    /// Reconcile arguments against the signature
    pub fn bind(&self, args: &Args) -> Result<BoundArgs> {
        self.signature.bind(args)
    }

    fn prepare(&self, args: &Args) -> Result<(BoundArgs, CallKey)> {
        let bound = self.bind(args)?;
        let captures = {
            let mut memo = self
                .once_memo
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            self.captures.digests(self.options.capture_all, &mut memo)?
        };
        let call = call_hash(&bound, &self.policies, &captures)?;
        let key = CallKey {
            fn_key: self.fn_key()?,
            call_hash: call,
        };
        Ok((bound, key))
    }

    /// Exists and is not expired. Staleness is never an error: expired or
    /// missing is simply false.
    fn fresh(&self, key: &CallKey) -> Result<bool> {
        if !self.storage.exists(&key.fn_key, &key.call_hash)? {
            return Ok(false);
        }
        if let Some(predicate) = &self.options.expiry {
            let date = match self.storage.checkpoint_date(&key.fn_key, &key.call_hash) {
                Ok(date) => date,
                // Deleted between exists and date: a plain miss
                Err(e) if e.is_not_found() => return Ok(false),
                Err(memento_storage::Error::Serialization { message }) => {
                    self.discard_corrupt(key, &message)?;
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if predicate(date) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn discard_corrupt(&self, key: &CallKey, message: &str) -> Result<()> {
        tracing::warn!(
            callable = %self.spec.id,
            call = %key.call_hash,
            message,
            "removing corrupt checkpoint record"
        );
        Ok(self.storage.delete(&key.fn_key, &key.call_hash)?)
    }

    /// LOOKUP: the stored payload if present and fresh.
    ///
    /// A corrupt record is deleted and treated as a miss; hashing failures
    /// and backend I/O errors abort the call instead of silently recomputing.
    fn lookup_payload(&self, key: &CallKey) -> Result<Option<serde_json::Value>> {
        if !self.fresh(key)? {
            return Ok(None);
        }
        match self.storage.load(&key.fn_key, &key.call_hash) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(memento_storage::Error::Serialization { message }) => {
                self.discard_corrupt(key, &message)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn store_payload<T: Serialize>(&self, key: &CallKey, value: &T) -> Result<()> {
        let payload = serde_json::to_value(value).map_err(|e| {
            memento_storage::Error::serialization(format!("failed to serialize payload: {e}"))
        })?;
        self.storage
            .store(&key.fn_key, &key.call_hash, CheckpointRecord::new(payload))?;
        Ok(())
    }

    fn decode<T: DeserializeOwned>(&self, payload: serde_json::Value) -> Result<T> {
        serde_json::from_value(payload).map_err(|e| {
            memento_storage::Error::serialization(format!("failed to decode payload: {e}")).into()
        })
    }

    fn log(&self, outcome: &str, key: &CallKey) {
        match self.options.verbosity {
            Verbosity::Silent => {}
            Verbosity::Coarse => {
                tracing::info!(callable = %self.spec.id, outcome, "checkpoint");
            }
            Verbosity::PerCall => {
                tracing::info!(
                    callable = %self.spec.id,
                    call = %key.call_hash,
                    outcome,
                    "checkpoint"
                );
            }
        }
    }

    /// Existence plus freshness, no side effects
    pub fn exists(&self, args: &Args) -> Result<bool> {
        let (_, key) = self.prepare(args)?;
        let fresh = self.fresh(&key)?;
        if self.options.verbosity >= Verbosity::PerCall {
            tracing::debug!(callable = %self.spec.id, call = %key.call_hash, hit = fresh, "exists");
        }
        Ok(fresh)
    }

    /// Creation timestamp of the stored entry
    pub fn checkpoint_date(&self, args: &Args) -> Result<DateTime<Utc>> {
        let (_, key) = self.prepare(args)?;
        Ok(self.storage.checkpoint_date(&key.fn_key, &key.call_hash)?)
    }

    /// LOOKUP only; never executes. [`Error::CacheMiss`] if absent or expired.
    pub fn get<T: DeserializeOwned>(&self, args: &Args) -> Result<T> {
        let (_, key) = self.prepare(args)?;
        match self.lookup_payload(&key)? {
            Some(payload) => {
                if self.options.verbosity >= Verbosity::PerCall {
                    tracing::debug!(callable = %self.spec.id, call = %key.call_hash, "get hit");
                }
                self.decode(payload)
            }
            None => Err(Error::cache_miss(&key.fn_key, &key.call_hash)),
        }
    }

    /// Unconditional removal; a no-op if absent
    pub fn delete(&self, args: &Args) -> Result<()> {
        let (_, key) = self.prepare(args)?;
        Ok(self.storage.delete(&key.fn_key, &key.call_hash)?)
    }

    /// Bulk-invalidate every entry of this callable's current identity
    pub fn clear(&self) -> Result<()> {
        let fn_key = self.fn_key()?;
        Ok(self.storage.clear(&fn_key)?)
    }

    /// Force-recompute the identity hash and re-snapshot `OnceForProcess`
    /// captures. `recursive` cascades to every callable in the dependency set.
    pub fn reinit(&self, recursive: bool) -> Result<()> {
        self.registry.reinit(&self.spec.id, recursive);
        self.once_memo
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.identity()?;
        Ok(())
    }
}

/// Synchronous wrapped computation
pub type ComputeFn<T> = Arc<dyn Fn(&BoundArgs) -> Result<T> + Send + Sync>;

/// A memoized callable running on the caller's thread
pub struct Checkpoint<T> {
    engine: Engine,
    compute: ComputeFn<T>,
}

impl<T: Serialize + DeserializeOwned> Checkpoint<T> {
    /// Wrap a computation
    pub fn new(
        spec: CallableSpec,
        signature: Signature,
        options: Options,
        compute: impl Fn(&BoundArgs) -> Result<T> + Send + Sync + 'static,
    ) -> Result<Self> {
        Ok(Self {
            engine: Engine::new(spec, signature, options)?,
            compute: Arc::new(compute),
        })
    }

    /// Wrap a computation around a pre-built engine
    pub fn from_engine(
        engine: Engine,
        compute: impl Fn(&BoundArgs) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            engine,
            compute: Arc::new(compute),
        }
    }

    /// The underlying engine (maintenance surface)
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Set per-parameter hashing policies
    #[must_use]
    pub fn with_policies(mut self, policies: ArgPolicies) -> Self {
        self.engine = self.engine.with_policies(policies);
        self
    }

    /// Set the capture context
    #[must_use]
    pub fn with_captures(mut self, captures: CaptureSet) -> Self {
        self.engine = self.engine.with_captures(captures);
        self
    }

    /// Use a dedicated registry instead of the process-wide one
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.engine = self.engine.with_registry(registry);
        self
    }

    /// LOOKUP, then EXECUTE + STORE on a miss
    pub fn invoke(&self, args: &Args) -> Result<T> {
        if !self.engine.options.enabled {
            return (self.compute)(&self.engine.bind(args)?);
        }
        let (bound, key) = self.engine.prepare(args)?;
        if let Some(payload) = self.engine.lookup_payload(&key)? {
            self.engine.log("remembered", &key);
            return self.engine.decode(payload);
        }
        let value = (self.compute)(&bound)?;
        self.engine.store_payload(&key, &value)?;
        self.engine.log("computed", &key);
        Ok(value)
    }

    /// Skip LOOKUP: always EXECUTE and overwrite the stored entry
    pub fn rerun(&self, args: &Args) -> Result<T> {
        if !self.engine.options.enabled {
            return (self.compute)(&self.engine.bind(args)?);
        }
        let (bound, key) = self.engine.prepare(args)?;
        let value = (self.compute)(&bound)?;
        self.engine.store_payload(&key, &value)?;
        self.engine.log("computed", &key);
        Ok(value)
    }

    /// Bypass hashing and storage entirely and run the raw computation.
    /// Useful inside recursion so intermediate steps are not cached while the
    /// outer call still is.
    pub fn call_uncached(&self, args: &Args) -> Result<T> {
        (self.compute)(&self.engine.bind(args)?)
    }

    /// LOOKUP only; [`Error::CacheMiss`] if absent or expired
    pub fn get(&self, args: &Args) -> Result<T> {
        self.engine.get(args)
    }

    /// Existence plus freshness, no side effects
    pub fn exists(&self, args: &Args) -> Result<bool> {
        self.engine.exists(args)
    }

    /// Creation timestamp of the stored entry
    pub fn checkpoint_date(&self, args: &Args) -> Result<DateTime<Utc>> {
        self.engine.checkpoint_date(args)
    }

    /// Unconditional removal; a no-op if absent
    pub fn delete(&self, args: &Args) -> Result<()> {
        self.engine.delete(args)
    }

    /// Bulk-invalidate every entry of this callable's current identity
    pub fn clear(&self) -> Result<()> {
        self.engine.clear()
    }

    /// Force-recompute identity and capture snapshots
    pub fn reinit(&self, recursive: bool) -> Result<()> {
        self.engine.reinit(recursive)
    }
}

/// Future type produced by an asynchronous wrapped computation
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Asynchronous wrapped computation
pub type AsyncComputeFn<T> = Arc<dyn Fn(BoundArgs) -> BoxFuture<T> + Send + Sync>;

/// A memoized callable whose computation must be awaited.
///
/// The surface is symmetric with [`Checkpoint`]: every entry point is an
/// `async fn`, so call sites need no special-casing. The engine suspends only
/// while awaiting the wrapped computation; it brings no worker pool or
/// scheduler of its own. If the surrounding task is cancelled during the
/// await, STORE never runs and no partial result is persisted.
pub struct AsyncCheckpoint<T> {
    engine: Engine,
    compute: AsyncComputeFn<T>,
}

impl<T: Serialize + DeserializeOwned> AsyncCheckpoint<T> {
    /// Wrap an asynchronous computation
    pub fn new(
        spec: CallableSpec,
        signature: Signature,
        options: Options,
        compute: impl Fn(BoundArgs) -> BoxFuture<T> + Send + Sync + 'static,
    ) -> Result<Self> {
        Ok(Self {
            engine: Engine::new(spec, signature, options)?,
            compute: Arc::new(compute),
        })
    }

    /// The underlying engine (maintenance surface)
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Set per-parameter hashing policies
    #[must_use]
    pub fn with_policies(mut self, policies: ArgPolicies) -> Self {
        self.engine = self.engine.with_policies(policies);
        self
    }

    /// Set the capture context
    #[must_use]
    pub fn with_captures(mut self, captures: CaptureSet) -> Self {
        self.engine = self.engine.with_captures(captures);
        self
    }

    /// Use a dedicated registry instead of the process-wide one
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.engine = self.engine.with_registry(registry);
        self
    }

    /// LOOKUP, then EXECUTE + STORE on a miss
    pub async fn invoke(&self, args: &Args) -> Result<T> {
        if !self.engine.options.enabled {
            return (self.compute)(self.engine.bind(args)?).await;
        }
        let (bound, key) = self.engine.prepare(args)?;
        if let Some(payload) = self.engine.lookup_payload(&key)? {
            self.engine.log("remembered", &key);
            return self.engine.decode(payload);
        }
        let value = (self.compute)(bound).await?;
        self.engine.store_payload(&key, &value)?;
        self.engine.log("computed", &key);
        Ok(value)
    }

    /// Skip LOOKUP: always EXECUTE and overwrite the stored entry
    pub async fn rerun(&self, args: &Args) -> Result<T> {
        if !self.engine.options.enabled {
            return (self.compute)(self.engine.bind(args)?).await;
        }
        let (bound, key) = self.engine.prepare(args)?;
        let value = (self.compute)(bound).await?;
        self.engine.store_payload(&key, &value)?;
        self.engine.log("computed", &key);
        Ok(value)
    }

    /// Bypass hashing and storage entirely and run the raw computation
    pub async fn call_uncached(&self, args: &Args) -> Result<T> {
        (self.compute)(self.engine.bind(args)?).await
    }

    /// LOOKUP only; [`Error::CacheMiss`] if absent or expired
    pub async fn get(&self, args: &Args) -> Result<T> {
        self.engine.get(args)
    }

    /// Existence plus freshness, no side effects
    pub async fn exists(&self, args: &Args) -> Result<bool> {
        self.engine.exists(args)
    }

    /// Creation timestamp of the stored entry
    pub async fn checkpoint_date(&self, args: &Args) -> Result<DateTime<Utc>> {
        self.engine.checkpoint_date(args)
    }

    /// Unconditional removal; a no-op if absent
    pub async fn delete(&self, args: &Args) -> Result<()> {
        self.engine.delete(args)
    }

    /// Bulk-invalidate every entry of this callable's current identity
    pub async fn clear(&self) -> Result<()> {
        self.engine.clear()
    }

    /// Force-recompute identity and capture snapshots
    pub fn reinit(&self, recursive: bool) -> Result<()> {
        self.engine.reinit(recursive)
    }
}

/// Independent engines stacked around one computation, consulted outer to
/// inner. A hit at an outer layer short-circuits the inner ones; a miss falls
/// through and every missed layer stores the result on the way back out.
pub struct Stack<T> {
    layers: Vec<Engine>,
    compute: ComputeFn<T>,
}

impl<T: Serialize + DeserializeOwned> Stack<T> {
    /// Stack layers (outermost first) around a computation
    pub fn new(
        layers: Vec<Engine>,
        compute: impl Fn(&BoundArgs) -> Result<T> + Send + Sync + 'static,
    ) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::binding("a stack needs at least one layer"));
        }
        Ok(Self {
            layers,
            compute: Arc::new(compute),
        })
    }

    /// The engine at a given depth, outermost first
    #[must_use]
    pub fn layer(&self, idx: usize) -> &Engine {
        &self.layers[idx]
    }

    /// All layers, outermost first
    #[must_use]
    pub fn layers(&self) -> &[Engine] {
        &self.layers
    }

    /// Consult layers outer to inner, executing only below the deepest miss
    pub fn invoke(&self, args: &Args) -> Result<T> {
        self.invoke_from(0, args)
    }

    fn invoke_from(&self, idx: usize, args: &Args) -> Result<T> {
        let Some(engine) = self.layers.get(idx) else {
            // Below the innermost layer sits the raw callable
            let bound = self.layers[self.layers.len() - 1].bind(args)?;
            return (self.compute)(&bound);
        };
        if !engine.options.enabled {
            return self.invoke_from(idx + 1, args);
        }
        let (_, key) = engine.prepare(args)?;
        if let Some(payload) = engine.lookup_payload(&key)? {
            engine.log("remembered", &key);
            return engine.decode(payload);
        }
        let value = self.invoke_from(idx + 1, args)?;
        engine.store_payload(&key, &value)?;
        engine.log("computed", &key);
        Ok(value)
    }
}
