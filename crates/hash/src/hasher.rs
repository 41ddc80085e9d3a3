//! Streaming content hasher and the digest type it produces

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::value::Value;

/// Binary buffers are fed to the digest in chunks of this size
const BYTES_CHUNK: usize = 64 * 1024;

/// An opaque fixed-length digest (SHA-256 as 64 lowercase hex characters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashValue(String);

impl HashValue {
    /// Create from a hex string, validating length and alphabet
    pub fn from_hex(hex: impl Into<String>) -> Result<Self> {
        let s = hex.into();
        if s.len() != 64 {
            return Err(Error::invalid_digest(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(Error::invalid_digest(
                "digest must contain only lowercase hex digits",
            ));
        }
        Ok(Self(s))
    }

    /// Get the hex representation
    #[must_use]
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HashValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl crate::Hashable for HashValue {
    fn canonical(&self) -> Value {
        Value::Str(self.0.clone())
    }
}

/// Streaming hasher over canonical [`Value`]s.
///
/// Every node is framed by a `kind:detail:len` header before its content, so
/// values of different kinds or lengths occupy disjoint digest streams. The
/// framing is part of the crate's stability contract: changing it invalidates
/// every existing cache entry.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    hash: Sha256,
}

impl ContentHasher {
    /// Create an empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self {
            hash: Sha256::new(),
        }
    }

    fn header(&mut self, kind: &str, detail: &str, len: usize) {
        self.hash.update(format!("\u{0}{kind}:{detail}:{len}").as_bytes());
    }

    /// Feed raw bytes, chunked so large buffers never get copied whole
    pub fn write_bytes(&mut self, data: &[u8]) {
        for chunk in data.chunks(BYTES_CHUNK) {
            self.hash.update(chunk);
        }
    }

    /// Feed one canonical value
    pub fn update(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.header("null", "", 0),
            Value::Bool(b) => self.header("bool", if *b { "1" } else { "0" }, 0),
            Value::Int(i) => self.header("int", &i.to_string(), 0),
            Value::UInt(u) => {
                // Unsigned values that fit hash identically to their signed twin
                match i64::try_from(*u) {
                    Ok(i) => self.header("int", &i.to_string(), 0),
                    Err(_) => self.header("uint", &u.to_string(), 0),
                }
            }
            Value::Float(f) => {
                if f.is_nan() {
                    return Err(Error::unhashable("f64 (NaN)"));
                }
                // -0.0 folds to 0.0 so the two canonical forms coincide
                let bits = if *f == 0.0 { 0u64 } else { f.to_bits() };
                self.header("float", format!("{bits:016x}").as_str(), 0);
            }
            Value::Str(s) => {
                self.header("str", "", s.len());
                self.write_bytes(s.as_bytes());
            }
            Value::Bytes(b) => {
                self.header("bytes", "", b.len());
                self.write_bytes(b);
            }
            Value::List(items) => {
                self.header("list", "", items.len());
                for item in items {
                    self.update(item)?;
                }
            }
            Value::Map(map) => {
                // BTreeMap iteration is already key-ordered
                self.header("map", "", map.len());
                for (key, val) in map {
                    self.header("key", "", key.len());
                    self.write_bytes(key.as_bytes());
                    self.update(val)?;
                }
            }
            Value::Set(items) => {
                // Hash each element into a nested digest, then feed the
                // sorted digests so element order never perturbs the result
                self.header("set", "", items.len());
                let mut digests = items
                    .iter()
                    .map(Self::nested)
                    .collect::<Result<Vec<_>>>()?;
                digests.sort();
                for digest in digests {
                    self.write_bytes(digest.as_hex().as_bytes());
                }
            }
            Value::Opaque { type_name } => {
                return Err(Error::unhashable(type_name.clone()));
            }
        }
        Ok(())
    }

    /// Digest a single value in a fresh hasher
    fn nested(value: &Value) -> Result<HashValue> {
        let mut hasher = Self::new();
        hasher.update(value)?;
        Ok(hasher.finish())
    }

    /// Consume the hasher and produce the digest
    #[must_use]
    pub fn finish(self) -> HashValue {
        HashValue(hex::encode(self.hash.finalize()))
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a single canonical value
pub fn hash_value(value: &Value) -> Result<HashValue> {
    let mut hasher = ContentHasher::new();
    hasher.update(value)?;
    Ok(hasher.finish())
}

/// Hash an ordered sequence of canonical values into one digest
pub fn hash_all<'a>(values: impl IntoIterator<Item = &'a Value>) -> Result<HashValue> {
    let mut hasher = ContentHasher::new();
    for value in values {
        hasher.update(value)?;
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hashable;
    use proptest::prelude::*;

    #[test]
    fn digest_is_stable_across_runs() {
        let v = Value::List(vec![Value::Int(1), Value::Str("two".into())]);
        let a = hash_value(&v).unwrap();
        let b = hash_value(&v).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_hex().len(), 64);
    }

    #[test]
    fn kind_framing_prevents_cross_type_collisions() {
        let s = hash_value(&Value::Str("3".into())).unwrap();
        let i = hash_value(&Value::Int(3)).unwrap();
        let b = hash_value(&Value::Bytes(b"3".to_vec())).unwrap();
        assert_ne!(s, i);
        assert_ne!(s, b);
        assert_ne!(i, b);
    }

    #[test]
    fn uint_and_int_twins_hash_equal() {
        let i = hash_value(&Value::Int(42)).unwrap();
        let u = hash_value(&Value::UInt(42)).unwrap();
        assert_eq!(i, u);
    }

    #[test]
    fn set_order_does_not_matter() {
        let a = Value::Set(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let b = Value::Set(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert_eq!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn list_order_matters() {
        let a = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::List(vec![Value::Int(2), Value::Int(1)]);
        assert_ne!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn adjacent_list_elements_do_not_smear() {
        // ["ab", "c"] must differ from ["a", "bc"]
        let a = vec!["ab".to_string(), "c".to_string()].canonical();
        let b = vec!["a".to_string(), "bc".to_string()].canonical();
        assert_ne!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn nan_is_unhashable() {
        let err = hash_value(&Value::Float(f64::NAN)).unwrap_err();
        assert!(matches!(err, Error::UnhashableValue { .. }));
    }

    #[test]
    fn negative_zero_folds_to_zero() {
        let a = hash_value(&Value::Float(0.0)).unwrap();
        let b = hash_value(&Value::Float(-0.0)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn opaque_is_unhashable() {
        let v = Value::Opaque {
            type_name: "std::fs::File".into(),
        };
        assert!(hash_value(&v).is_err());
    }

    #[test]
    fn large_buffer_hashes_without_textual_projection() {
        let big = vec![0xabu8; 3 * BYTES_CHUNK + 17];
        let digest = hash_value(&Value::Bytes(big.clone())).unwrap();
        let mut hasher = ContentHasher::new();
        hasher.update(&Value::Bytes(big)).unwrap();
        assert_eq!(digest, hasher.finish());
    }

    #[test]
    fn hash_value_from_hex_validates() {
        assert!(HashValue::from_hex("ab".repeat(32)).is_ok());
        assert!(HashValue::from_hex("xyz").is_err());
        assert!(HashValue::from_hex("AB".repeat(32)).is_err());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<u64>().prop_map(Value::UInt),
            "[a-z]{0,12}".prop_map(Value::Str),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::btree_map("[a-z]{1,6}", inner.clone(), 0..6)
                    .prop_map(Value::Map),
                proptest::collection::vec(inner, 0..6).prop_map(Value::Set),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_hashing_is_deterministic(v in arb_value()) {
            prop_assert_eq!(hash_value(&v).unwrap(), hash_value(&v).unwrap());
        }

        #[test]
        fn prop_set_permutation_invariant(mut items in proptest::collection::vec(any::<i64>(), 0..8)) {
            let a = Value::Set(items.iter().copied().map(Value::Int).collect());
            items.reverse();
            let b = Value::Set(items.into_iter().map(Value::Int).collect());
            prop_assert_eq!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
        }

        #[test]
        fn prop_distinct_ints_hash_distinct(a in any::<i64>(), b in any::<i64>()) {
            prop_assume!(a != b);
            prop_assert_ne!(
                hash_value(&Value::Int(a)).unwrap(),
                hash_value(&Value::Int(b)).unwrap()
            );
        }
    }
}
