//! Key types for query identity.

use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::QueryError;

/// Structured identity of a query.
///
/// Any value serde can turn into JSON works as a key: a tag string, a tuple,
/// a struct. Object members are kept sorted by name, so two keys built from
/// maps with the same entries are equal regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey(Value);

impl QueryKey {
    /// Build a key from any serializable value.
    ///
    /// Fails only for values JSON cannot represent, such as maps with
    /// non-string keys.
    pub fn new<K: Serialize + ?Sized>(key: &K) -> Result<Self, QueryError> {
        serde_json::to_value(key)
            .map(Self)
            .map_err(QueryError::InvalidKey)
    }

    /// The structured value behind this key.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Canonical hash of this key.
    pub fn hash(&self) -> QueryHash {
        QueryHash::of(self)
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<&str> for QueryKey {
    fn from(tag: &str) -> Self {
        Self(Value::String(tag.to_owned()))
    }
}

impl From<String> for QueryKey {
    fn from(tag: String) -> Self {
        Self(Value::String(tag))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Canonical string form of a [`QueryKey`], used as the registry lookup key.
///
/// This is the compact JSON text of the key. Equal keys always produce the
/// same hash, and keys with distinct serializations never share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    /// Canonicalize a key.
    pub fn of(key: &QueryKey) -> Self {
        // Value's Display writes compact JSON and cannot fail.
        Self(key.0.to_string())
    }

    /// The canonical text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueryHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
