//! Upstream call model.
//!
//! A [`CallRequest`] is identified by its [`Fingerprint`], a SHA-256 digest of
//! the method name and a canonical encoding of the parameters. Two requests
//! with the same method and structurally equal parameters always share a
//! fingerprint, regardless of object key order, so the fingerprint serves as
//! both the cache key and the deduplication key inside a batch.
//!
//! Results are correlated by fingerprint, never by position: a batch may be
//! re-split internally and complete out of order.

use crate::error::{CallError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Deterministic identity of a call (method + parameters).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of `method` called with `params`.
    pub fn of(method: &str, params: &[Value]) -> Self {
        let mut hasher = Sha256::new();
        write_str(&mut hasher, method);
        hasher.update((params.len() as u64).to_be_bytes());
        for param in params {
            write_value(&mut hasher, param);
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight bytes, for cheap shard selection.
    pub fn prefix_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(buf)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &hex::encode(&self.0[..6]))
    }
}

// Every value is prefixed with a type tag and strings with their length so
// that distinct structures can never encode to the same byte stream.
fn write_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn write_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, *b as u8]),
        Value::Number(n) => {
            hasher.update([2u8]);
            write_str(hasher, &n.to_string());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            write_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                write_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([5u8]);
            hasher.update((map.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                write_str(hasher, key);
                write_value(hasher, &map[key]);
            }
        }
    }
}

/// One upstream call. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    method: String,
    params: Vec<Value>,
    fingerprint: Fingerprint,
}

impl CallRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        let method = method.into();
        let fingerprint = Fingerprint::of(&method, &params);
        Self {
            method,
            params,
            fingerprint,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

/// Resolution of one fingerprint.
///
/// `sequence` is assigned by the performance recorder and is only meant for
/// ordering diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    fingerprint: Fingerprint,
    outcome: std::result::Result<Value, CallError>,
    latency: Duration,
    sequence: u64,
    attempts: u32,
    from_cache: bool,
}

impl CallResult {
    pub fn success(
        fingerprint: Fingerprint,
        payload: Value,
        latency: Duration,
        sequence: u64,
        attempts: u32,
    ) -> Self {
        Self {
            fingerprint,
            outcome: Ok(payload),
            latency,
            sequence,
            attempts,
            from_cache: false,
        }
    }

    pub fn failure(
        fingerprint: Fingerprint,
        error: CallError,
        latency: Duration,
        sequence: u64,
        attempts: u32,
    ) -> Self {
        Self {
            fingerprint,
            outcome: Err(error),
            latency,
            sequence,
            attempts,
            from_cache: false,
        }
    }

    /// Copy of this result marked as served from the cache.
    pub fn cached(&self) -> Self {
        Self {
            from_cache: true,
            ..self.clone()
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&CallError> {
        self.outcome.as_ref().err()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error().map(|e| e.kind)
    }

    pub fn outcome(&self) -> &std::result::Result<Value, CallError> {
        &self.outcome
    }

    pub fn into_outcome(self) -> std::result::Result<Value, CallError> {
        self.outcome
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Upstream attempts made. Zero for cache hits and local rejections.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }
}
