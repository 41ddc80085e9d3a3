//! Call hashing: bound arguments, per-parameter policies, and captures
//!
//! A *call hash* digests one invocation's effective inputs. Arguments are
//! reconciled against the declared parameters first, so passing a value
//! positionally or by name cannot change the hash. Per-parameter policies
//! then exclude or transform values before hashing, and captures contribute
//! named context values under an inclusion policy.

use std::collections::BTreeMap;
use std::sync::Arc;

use memento_hash::{ContentHasher, HashValue, Hashable, Value, hash_value};

use crate::error::{Error, Result};

/// One declared parameter
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    default: Option<Value>,
}

/// Declared parameter list of a callable
#[derive(Debug, Clone, Default)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    /// Signature with the given required parameters, in declaration order
    #[must_use]
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            params: names
                .into_iter()
                .map(|name| Param {
                    name: name.into(),
                    default: None,
                })
                .collect(),
        }
    }

    /// Append an optional parameter with a default value
    #[must_use]
    pub fn with_default(mut self, name: impl Into<String>, default: impl Hashable) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: Some(default.canonical()),
        });
        self
    }

    /// Reconcile positional and named arguments against this signature
    pub fn bind(&self, args: &Args) -> Result<BoundArgs> {
        if args.positional.len() > self.params.len() {
            return Err(Error::binding(format!(
                "expected at most {} positional arguments, got {}",
                self.params.len(),
                args.positional.len()
            )));
        }

        let mut values: Vec<(String, Value)> = Vec::with_capacity(self.params.len());
        for (idx, param) in self.params.iter().enumerate() {
            let positional = args.positional.get(idx);
            let named = args.named.get(&param.name);
            let value = match (positional, named) {
                (Some(_), Some(_)) => {
                    return Err(Error::binding(format!(
                        "parameter `{}` bound both positionally and by name",
                        param.name
                    )));
                }
                (Some(v), None) | (None, Some(v)) => v.clone(),
                (None, None) => param.default.clone().ok_or_else(|| {
                    Error::binding(format!("missing required parameter `{}`", param.name))
                })?,
            };
            values.push((param.name.clone(), value));
        }

        for name in args.named.keys() {
            if !self.params.iter().any(|p| p.name == *name) {
                return Err(Error::binding(format!("unknown parameter `{name}`")));
            }
        }

        Ok(BoundArgs { values })
    }
}

/// Arguments for one invocation, positional and/or by name
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl Args {
    /// No arguments
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    #[must_use]
    pub fn pos(mut self, value: impl Hashable) -> Self {
        self.positional.push(value.canonical());
        self
    }

    /// Bind an argument by parameter name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>, value: impl Hashable) -> Self {
        self.named.insert(name.into(), value.canonical());
        self
    }
}

/// Arguments after reconciliation with the signature: every parameter bound,
/// in declaration order
#[derive(Debug, Clone)]
pub struct BoundArgs {
    values: Vec<(String, Value)>,
}

impl BoundArgs {
    /// Canonical value of a bound parameter
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::binding(format!("no bound parameter `{name}`")))
    }

    /// Integer accessor
    pub fn i64(&self, name: &str) -> Result<i64> {
        self.get(name)?
            .as_i64()
            .ok_or_else(|| Error::binding(format!("parameter `{name}` is not an integer")))
    }

    /// String accessor
    pub fn str(&self, name: &str) -> Result<&str> {
        self.get(name)?
            .as_str()
            .ok_or_else(|| Error::binding(format!("parameter `{name}` is not a string")))
    }

    /// Boolean accessor
    pub fn bool(&self, name: &str) -> Result<bool> {
        self.get(name)?
            .as_bool()
            .ok_or_else(|| Error::binding(format!("parameter `{name}` is not a boolean")))
    }

    /// Iterate bound `(name, value)` pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// Transform hook: substitutes a derived representative value before hashing
pub type TransformFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// How one parameter participates in the call hash
#[derive(Clone, Default)]
pub enum ArgPolicy {
    /// Hash the raw canonical value
    #[default]
    Default,
    /// Omit the parameter from hashing entirely
    Excluded,
    /// Hash `f(value)` instead of `value`
    Transform(TransformFn),
}

impl std::fmt::Debug for ArgPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Excluded => f.write_str("Excluded"),
            Self::Transform(_) => f.write_str("Transform(..)"),
        }
    }
}

/// Per-parameter hashing policies, keyed by parameter name
#[derive(Debug, Clone, Default)]
pub struct ArgPolicies {
    by_name: BTreeMap<String, ArgPolicy>,
}

impl ArgPolicies {
    /// All parameters hashed raw
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude a parameter from hashing
    #[must_use]
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.by_name.insert(name.into(), ArgPolicy::Excluded);
        self
    }

    /// Hash a derived representative instead of the raw value
    #[must_use]
    pub fn transform(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.by_name
            .insert(name.into(), ArgPolicy::Transform(Arc::new(f)));
        self
    }

    fn policy(&self, name: &str) -> &ArgPolicy {
        self.by_name.get(name).unwrap_or(&ArgPolicy::Default)
    }
}

/// Reader producing a capture's current value
pub type CaptureReader = Arc<dyn Fn() -> Value + Send + Sync>;

/// When a capture is read and hashed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    /// Re-read and re-hash on every invocation
    EveryCall,
    /// Read and hash once per process; the sub-digest is reused for every
    /// later call even if the source value changes
    OnceForProcess,
}

struct CaptureField {
    policy: CapturePolicy,
    reader: CaptureReader,
    excluded: bool,
}

/// Named context values outside the parameter list that participate in the
/// call hash. This is the explicit context object that replaces implicit
/// scope capture: each field carries its own inclusion policy.
#[derive(Default)]
pub struct CaptureSet {
    fields: BTreeMap<String, CaptureField>,
}

impl CaptureSet {
    /// Empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capture with the given policy
    #[must_use]
    pub fn with(
        mut self,
        name: impl Into<String>,
        policy: CapturePolicy,
        reader: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        self.fields.insert(
            name.into(),
            CaptureField {
                policy,
                reader: Arc::new(reader),
                excluded: false,
            },
        );
        self
    }

    /// Exclude a field from hashing even in capture-all mode
    #[must_use]
    pub fn exclude(mut self, name: &str) -> Self {
        if let Some(field) = self.fields.get_mut(name) {
            field.excluded = true;
        }
        self
    }

    /// Sub-digest every participating capture, name-sorted.
    ///
    /// `capture_all` treats every field as [`CapturePolicy::EveryCall`] unless
    /// individually excluded. `once_memo` holds the per-process snapshots for
    /// `OnceForProcess` fields; `reinit` clears it to force a re-snapshot.
    pub(crate) fn digests(
        &self,
        capture_all: bool,
        once_memo: &mut BTreeMap<String, HashValue>,
    ) -> Result<BTreeMap<String, HashValue>> {
        let mut digests = BTreeMap::new();
        for (name, field) in &self.fields {
            if field.excluded {
                continue;
            }
            let policy = if capture_all {
                CapturePolicy::EveryCall
            } else {
                field.policy
            };
            let digest = match policy {
                CapturePolicy::EveryCall => hash_value(&(field.reader)())?,
                CapturePolicy::OnceForProcess => {
                    if let Some(snapshot) = once_memo.get(name) {
                        snapshot.clone()
                    } else {
                        let snapshot = hash_value(&(field.reader)())?;
                        once_memo.insert(name.clone(), snapshot.clone());
                        snapshot
                    }
                }
            };
            digests.insert(name.clone(), digest);
        }
        Ok(digests)
    }
}

/// Digest one invocation: processed bound parameters in declaration order,
/// then capture sub-digests sorted by name. Excluded parameters contribute
/// nothing at all.
pub fn call_hash(
    bound: &BoundArgs,
    policies: &ArgPolicies,
    captures: &BTreeMap<String, HashValue>,
) -> Result<HashValue> {
    let mut hasher = ContentHasher::new();
    hasher.update(&Value::Str("call".into()))?;

    for (name, value) in bound.iter() {
        match policies.policy(name) {
            ArgPolicy::Excluded => continue,
            ArgPolicy::Default => {
                hasher.update(&Value::List(vec![
                    Value::Str(name.to_string()),
                    value.clone(),
                ]))?;
            }
            ArgPolicy::Transform(f) => {
                hasher.update(&Value::List(vec![Value::Str(name.to_string()), f(value)]))?;
            }
        }
    }

    for (name, digest) in captures {
        hasher.update(&Value::List(vec![
            Value::Str(format!("capture:{name}")),
            Value::Str(digest.as_hex().to_string()),
        ]))?;
    }

    Ok(hasher.finish())
}
