//! Canonical value model and the `Hashable` capability trait

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

/// Canonical form of a structured value, as seen by the hasher.
///
/// Adapters project arbitrary types onto this enum via [`Hashable`]; the
/// hasher only ever consumes `Value`. Structurally equal values must map to
/// equal `Value`s regardless of the container that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absence of a value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer; hashes identically to `Int` when it fits in `i64`
    UInt(u64),
    /// Floating point number; `NaN` is unhashable
    Float(f64),
    /// Unicode text
    Str(String),
    /// Binary buffer, hashed raw in chunks
    Bytes(Vec<u8>),
    /// Ordered sequence
    List(Vec<Value>),
    /// Key/value mapping, hashed in key order
    Map(BTreeMap<String, Value>),
    /// Unordered collection, hashed order-insensitively
    Set(Vec<Value>),
    /// A value with no canonical representation. Hashing fails unless an
    /// upstream policy excludes or transforms it away first.
    Opaque {
        /// Name of the type that could not be canonicalized
        type_name: String,
    },
}

impl Value {
    /// Convenience accessor for integer values
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Convenience accessor for string values
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Convenience accessor for boolean values
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Capability trait: any type exposing a canonical projection is hashable.
///
/// Unsupported types are adapted by implementing this trait explicitly; there
/// is no structural reflection. A type that genuinely has no canonical form
/// may return [`Value::Opaque`], which surfaces as an unhashable-value error
/// at hashing time unless excluded or transformed.
pub trait Hashable {
    /// Project `self` onto the canonical value model
    fn canonical(&self) -> Value;
}

impl Hashable for Value {
    fn canonical(&self) -> Value {
        self.clone()
    }
}

impl<T: Hashable + ?Sized> Hashable for &T {
    fn canonical(&self) -> Value {
        (**self).canonical()
    }
}

impl Hashable for bool {
    fn canonical(&self) -> Value {
        Value::Bool(*self)
    }
}

macro_rules! impl_hashable_int {
    ($($t:ty),*) => {$(
        impl Hashable for $t {
            fn canonical(&self) -> Value {
                Value::Int(i64::from(*self))
            }
        }
    )*};
}

impl_hashable_int!(i8, i16, i32, i64);

macro_rules! impl_hashable_uint {
    ($($t:ty),*) => {$(
        impl Hashable for $t {
            fn canonical(&self) -> Value {
                Value::UInt(u64::from(*self))
            }
        }
    )*};
}

impl_hashable_uint!(u8, u16, u32, u64);

impl Hashable for usize {
    fn canonical(&self) -> Value {
        Value::UInt(*self as u64)
    }
}

impl Hashable for isize {
    fn canonical(&self) -> Value {
        Value::Int(*self as i64)
    }
}

impl Hashable for f64 {
    fn canonical(&self) -> Value {
        Value::Float(*self)
    }
}

impl Hashable for f32 {
    fn canonical(&self) -> Value {
        Value::Float(f64::from(*self))
    }
}

impl Hashable for char {
    fn canonical(&self) -> Value {
        Value::Str(self.to_string())
    }
}

impl Hashable for str {
    fn canonical(&self) -> Value {
        Value::Str(self.to_owned())
    }
}

impl Hashable for String {
    fn canonical(&self) -> Value {
        Value::Str(self.clone())
    }
}

impl<T: Hashable> Hashable for Option<T> {
    fn canonical(&self) -> Value {
        match self {
            None => Value::Null,
            Some(v) => v.canonical(),
        }
    }
}

impl<T: Hashable> Hashable for [T] {
    fn canonical(&self) -> Value {
        Value::List(self.iter().map(Hashable::canonical).collect())
    }
}

impl<T: Hashable> Hashable for Vec<T> {
    fn canonical(&self) -> Value {
        Value::List(self.iter().map(Hashable::canonical).collect())
    }
}

macro_rules! impl_hashable_tuple {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Hashable),+> Hashable for ($($name,)+) {
            fn canonical(&self) -> Value {
                Value::List(vec![$(self.$idx.canonical()),+])
            }
        }
    };
}

impl_hashable_tuple!(A: 0);
impl_hashable_tuple!(A: 0, B: 1);
impl_hashable_tuple!(A: 0, B: 1, C: 2);
impl_hashable_tuple!(A: 0, B: 1, C: 2, D: 3);

impl<T: Hashable> Hashable for BTreeMap<String, T> {
    fn canonical(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.clone(), v.canonical()))
                .collect(),
        )
    }
}

impl<T: Hashable> Hashable for HashMap<String, T> {
    fn canonical(&self) -> Value {
        Value::Map(
            self.iter()
                .map(|(k, v)| (k.clone(), v.canonical()))
                .collect(),
        )
    }
}

impl<T: Hashable> Hashable for BTreeSet<T> {
    fn canonical(&self) -> Value {
        Value::Set(self.iter().map(Hashable::canonical).collect())
    }
}

impl<T: Hashable> Hashable for HashSet<T> {
    fn canonical(&self) -> Value {
        Value::Set(self.iter().map(Hashable::canonical).collect())
    }
}

impl Hashable for serde_json::Value {
    fn canonical(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    // serde_json numbers are i64, u64 or finite f64
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Self::String(s) => Value::Str(s.clone()),
            Self::Array(items) => Value::List(items.iter().map(Hashable::canonical).collect()),
            Self::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.canonical()))
                    .collect(),
            ),
        }
    }
}

impl Hashable for DateTime<Utc> {
    fn canonical(&self) -> Value {
        Value::Str(self.to_rfc3339())
    }
}
