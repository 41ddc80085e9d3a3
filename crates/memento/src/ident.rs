//! Callable identity: stable behavior hashes over the dependency graph
//!
//! A callable's *identity hash* digests its normalized implementation plus
//! every implementation it transitively depends on. Identical code with
//! identical dependencies produces the identical hash on any machine; any
//! semantic token change anywhere in the graph produces a new one, which is
//! what retires stale cache entries without manual version bumps.
//!
//! Dependency information comes from outside the engine, as a tagged
//! [`DependencySource`]: either a developer-declared list (optionally
//! generated at build time) or the output of an external resolver.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock, RwLock};

use memento_hash::{HashValue, Value, hash_value};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable name/path of a callable, e.g. `"reports/quarterly_totals"`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallableId(String);

impl CallableId {
    /// Create an id from a stable path
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The path as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallableId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What the dependency source knows about one callable
#[derive(Debug, Clone)]
pub struct ResolvedCallable {
    /// Implementation text; normalized before hashing
    pub body: String,
    /// Ids of the callables this one directly references
    pub depends: Vec<CallableId>,
}

/// Failure reported by a [`DependencyResolver`]
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ResolveError {
    /// Resolver-reported reason
    pub message: String,
}

impl ResolveError {
    /// Create a resolve error
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// External collaborator that maps a callable id to its implementation text
/// and direct dependencies. The engine only consumes its output and never
/// inspects code itself.
pub trait DependencyResolver: Send + Sync {
    /// Resolve one callable
    fn resolve(&self, id: &CallableId) -> std::result::Result<ResolvedCallable, ResolveError>;
}

/// Where a callable's dependency information comes from
#[derive(Clone)]
pub enum DependencySource {
    /// Developer-declared implementation text and direct dependency ids.
    /// Dependencies are looked up among other declarations in the registry.
    Declared {
        /// Implementation text of the callable itself
        body: String,
        /// Direct dependency ids
        depends: Vec<CallableId>,
    },
    /// An external resolver supplies this callable and its transitive graph
    ResolvedExternally(Arc<dyn DependencyResolver>),
}

/// A callable handle: its stable id plus its dependency source
#[derive(Clone)]
pub struct CallableSpec {
    /// Stable name/path
    pub id: CallableId,
    /// Dependency information source
    pub source: DependencySource,
}

impl CallableSpec {
    /// Spec with a declared body and dependency list
    #[must_use]
    pub fn declared(
        id: impl Into<CallableId>,
        body: impl Into<String>,
        depends: impl IntoIterator<Item = CallableId>,
    ) -> Self {
        Self {
            id: id.into(),
            source: DependencySource::Declared {
                body: body.into(),
                depends: depends.into_iter().collect(),
            },
        }
    }

    /// Spec backed by an external resolver
    #[must_use]
    pub fn resolved(id: impl Into<CallableId>, resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            id: id.into(),
            source: DependencySource::ResolvedExternally(resolver),
        }
    }
}

impl From<String> for CallableId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A callable's computed identity, memoized for the process lifetime
#[derive(Debug, Clone)]
pub struct CallableIdentity {
    /// Stable name/path
    pub id: CallableId,
    hash: HashValue,
    /// Every callable in the transitive dependency set
    pub depends: BTreeSet<CallableId>,
    /// Whether part of the dependency graph could not be resolved; the hash
    /// is then best-effort rather than complete
    pub dependency_incomplete: bool,
    /// Whether an explicit override replaced the computed hash
    pub overridden: bool,
}

impl CallableIdentity {
    /// The identity hash
    #[must_use]
    pub fn hash(&self) -> &HashValue {
        &self.hash
    }
}

/// Normalize implementation text so purely cosmetic differences never perturb
/// the identity hash: comments (`//`, `/* */`, `#`) are dropped, whitespace
/// runs collapse, and the surviving semantic tokens are joined with `\0`
/// separators. Any semantic token change survives normalization.
#[must_use]
pub fn normalize_body(source: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '#' => {
                while let Some(&n) = chars.peek() {
                    chars.next();
                    if n == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&n) = chars.peek() {
                    chars.next();
                    if n == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for n in chars.by_ref() {
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
            }
            quote @ ('"' | '\'') => {
                // String literals are semantic; keep them verbatim
                let mut lit = String::from(quote);
                while let Some(n) = chars.next() {
                    lit.push(n);
                    if n == '\\' {
                        if let Some(escaped) = chars.next() {
                            lit.push(escaped);
                        }
                    } else if n == quote {
                        break;
                    }
                }
                tokens.push(lit);
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(word);
            }
            other => tokens.push(other.to_string()),
        }
    }

    tokens.join("\0")
}

fn body_hash(body: &str) -> Result<HashValue> {
    Ok(hash_value(&Value::Str(normalize_body(body)))?)
}

fn placeholder_hash(id: &CallableId) -> Result<HashValue> {
    Ok(hash_value(&Value::Str(format!("unresolved:{id}")))?)
}

/// Process-wide registry of callable identities.
///
/// Identity hashes are memoized here for the process lifetime and rewritten
/// only by explicit [`Registry::reinit`]. Concurrent `reinit` calls on the
/// same callable are the caller's responsibility to serialize.
#[derive(Default)]
pub struct Registry {
    declared: RwLock<HashMap<CallableId, ResolvedCallable>>,
    identities: RwLock<HashMap<CallableId, Arc<CallableIdentity>>>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    fn declared_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<CallableId, ResolvedCallable>> {
        self.declared
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn identities_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<CallableId, Arc<CallableIdentity>>> {
        self.identities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register (or replace) a declared callable body and dependency list.
    ///
    /// Replacing a declaration does not touch memoized identities; dependents
    /// pick the change up on their next `reinit`.
    pub fn declare(
        &self,
        id: impl Into<CallableId>,
        body: impl Into<String>,
        depends: impl IntoIterator<Item = CallableId>,
    ) {
        self.declared
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                id.into(),
                ResolvedCallable {
                    body: body.into(),
                    depends: depends.into_iter().collect(),
                },
            );
    }

    /// Memoized identity for the given spec.
    ///
    /// An explicit `override_hash` replaces the computed value outright and
    /// skips dependency resolution entirely.
    pub fn identity(
        &self,
        spec: &CallableSpec,
        override_hash: Option<&HashValue>,
    ) -> Result<Arc<CallableIdentity>> {
        if let Some(existing) = self
            .identities
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&spec.id)
        {
            if existing.overridden == override_hash.is_some() {
                return Ok(Arc::clone(existing));
            }
        }

        let identity = Arc::new(self.compute_identity(spec, override_hash)?);
        self.identities_write()
            .insert(spec.id.clone(), Arc::clone(&identity));
        Ok(identity)
    }

    /// Drop the memoized identity so the next access recomputes it.
    ///
    /// `recursive` also drops every callable in the dependency set, so an
    /// edited helper re-enters the hashes of all its dependents.
    pub fn reinit(&self, id: &CallableId, recursive: bool) {
        let removed = self.identities_write().remove(id);
        if recursive {
            if let Some(identity) = removed {
                let mut identities = self.identities_write();
                for dep in &identity.depends {
                    identities.remove(dep);
                }
            }
        }
    }

    fn node(
        &self,
        spec: &CallableSpec,
        id: &CallableId,
    ) -> std::result::Result<ResolvedCallable, ResolveError> {
        match &spec.source {
            DependencySource::ResolvedExternally(resolver) => resolver.resolve(id),
            DependencySource::Declared { body, depends } => {
                if *id == spec.id {
                    return Ok(ResolvedCallable {
                        body: body.clone(),
                        depends: depends.clone(),
                    });
                }
                self.declared_read()
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ResolveError::new(format!("no declaration for `{id}`")))
            }
        }
    }

    fn compute_identity(
        &self,
        spec: &CallableSpec,
        override_hash: Option<&HashValue>,
    ) -> Result<CallableIdentity> {
        if let Some(hash) = override_hash {
            return Ok(CallableIdentity {
                id: spec.id.clone(),
                hash: hash.clone(),
                depends: BTreeSet::new(),
                dependency_incomplete: false,
                overridden: true,
            });
        }

        let mut bodies: BTreeMap<CallableId, HashValue> = BTreeMap::new();
        let mut incomplete = false;
        self.visit(spec, &spec.id, &mut bodies, &mut incomplete)?;

        // Body hashes ordered by dependency identifier, never by discovery
        // order, so resolution order cannot perturb the result
        let map: BTreeMap<String, Value> = bodies
            .iter()
            .map(|(id, h)| (id.to_string(), Value::Str(h.as_hex().to_string())))
            .collect();
        let hash = hash_value(&Value::List(vec![
            Value::Str("identity".into()),
            Value::Str(spec.id.to_string()),
            Value::Map(map),
        ]))?;

        let mut depends: BTreeSet<CallableId> = bodies.into_keys().collect();
        depends.remove(&spec.id);

        Ok(CallableIdentity {
            id: spec.id.clone(),
            hash,
            depends,
            dependency_incomplete: incomplete,
            overridden: false,
        })
    }

    fn visit(
        &self,
        spec: &CallableSpec,
        id: &CallableId,
        bodies: &mut BTreeMap<CallableId, HashValue>,
        incomplete: &mut bool,
    ) -> Result<()> {
        // Each id contributes its body hash exactly once. A cycle re-reaches
        // an id whose hash was recorded before descending, so it stops here.
        if bodies.contains_key(id) {
            return Ok(());
        }

        let node = match self.node(spec, id) {
            Ok(node) => node,
            Err(e) if *id == spec.id => {
                // The callable's own body is non-negotiable
                return Err(Error::Resolver {
                    id: id.clone(),
                    message: e.message,
                });
            }
            Err(e) => {
                // Soft degradation: the graph is incomplete but the callable
                // stays hashable from everything that did resolve
                tracing::warn!(
                    callable = %spec.id,
                    dependency = %id,
                    reason = %e.message,
                    "dependency resolution incomplete; identity hash is best-effort"
                );
                bodies.insert(id.clone(), placeholder_hash(id)?);
                *incomplete = true;
                return Ok(());
            }
        };

        bodies.insert(id.clone(), body_hash(&node.body)?);
        for dep in &node.depends {
            self.visit(spec, dep, bodies, incomplete)?;
        }
        Ok(())
    }
}
