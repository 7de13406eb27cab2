//! Export records.
//!
//! An [`ExportRecord`] is a typed row: a [`RecordKind`] naming the target
//! table, a [`PrimaryKey`] tuple used for upsert conflict resolution, and a
//! JSON object payload holding the remaining columns.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Target table / record kind, e.g. `"blocks"` or `"transactions"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKind(String);

impl RecordKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One component of a primary-key tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPart {
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
}

impl KeyPart {
    fn size_bytes(&self) -> usize {
        match self {
            KeyPart::Int(_) | KeyPart::UInt(_) => 8,
            KeyPart::Text(s) => s.len(),
            KeyPart::Bytes(b) => b.len(),
        }
    }

    /// JSON rendering used when the key is stored alongside the payload.
    ///
    /// Bytes use the `\x`-prefixed hex form that Postgres `bytea` accepts.
    pub fn to_json(&self) -> Value {
        match self {
            KeyPart::Int(v) => Value::from(*v),
            KeyPart::UInt(v) => Value::from(*v),
            KeyPart::Text(s) => Value::String(s.clone()),
            KeyPart::Bytes(b) => Value::String(format!("\\x{}", hex::encode(b))),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(v) => write!(f, "{}", v),
            KeyPart::UInt(v) => write!(f, "{}", v),
            KeyPart::Text(s) => f.write_str(s),
            KeyPart::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

/// Primary-key tuple of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(Vec<KeyPart>);

impl PrimaryKey {
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    pub fn single(part: KeyPart) -> Self {
        Self(vec![part])
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn size_bytes(&self) -> usize {
        self.0.iter().map(KeyPart::size_bytes).sum()
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", part)?;
        }
        f.write_str(")")
    }
}

/// A typed record headed for the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    kind: RecordKind,
    key: PrimaryKey,
    payload: Map<String, Value>,
}

/// Fixed per-record bookkeeping overhead assumed by the size estimate.
const RECORD_OVERHEAD: usize = 64;

impl ExportRecord {
    /// Create a record. The key must have at least one part.
    pub fn new(
        kind: impl Into<RecordKind>,
        key: PrimaryKey,
        payload: Map<String, Value>,
    ) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::InvalidRecord("primary key must not be empty".to_string()));
        }
        Ok(Self {
            kind: kind.into(),
            key,
            payload,
        })
    }

    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn into_parts(self) -> (RecordKind, PrimaryKey, Map<String, Value>) {
        (self.kind, self.key, self.payload)
    }

    /// Rough in-memory footprint, used for memory-pressure flushing.
    pub fn estimated_size(&self) -> usize {
        let payload: usize = self
            .payload
            .iter()
            .map(|(k, v)| k.len() + value_size(v))
            .sum();
        RECORD_OVERHEAD + self.kind.0.len() + self.key.size_bytes() + payload
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_size).sum::<usize>() + 8,
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum::<usize>() + 8,
    }
}
