//! # Sync Envelope
//!
//! The only shape ever written to the remote store.
//!
//! ## Wire Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  users/{uid}/{collection}[/{key}]                                       │
//! │                                                                         │
//! │  {                                                                      │
//! │    "data":      { ... } | null     ← null = tombstone (deleted)        │
//! │    "timestamp": 1718000000000      ← writer wall clock (ms)            │
//! │    "deviceId":  "device-…"         ← loop-prevention key               │
//! │    "hash":      "9f2c0d1e7a43b6e1" ← fingerprint of data              │
//! │  }                                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The hash is computed over a canonical rendering of `data` (object keys
//! sorted), so two devices holding equal values always agree on it.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Number of hex characters kept from the SHA-256 digest.
pub const HASH_LEN: usize = 16;

/// Envelope whose payload has not been deserialized into a domain type.
pub type RawEnvelope = SyncEnvelope<Value>;

// =============================================================================
// Envelope
// =============================================================================

/// Wrapper around every synchronized value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope<T = Value> {
    /// The value, or `None` for a tombstone.
    pub data: Option<T>,

    /// Writer wall-clock time in milliseconds.
    pub timestamp: i64,

    /// Installation that produced this write.
    pub device_id: String,

    /// Fingerprint of `data`.
    #[serde(default)]
    pub hash: String,
}

impl RawEnvelope {
    /// Builds an envelope stamped with the current time.
    pub fn new(data: Option<Value>, device_id: impl Into<String>) -> Self {
        Self::at(data, device_id, now_millis())
    }

    /// Builds an envelope with an explicit timestamp.
    pub fn at(data: Option<Value>, device_id: impl Into<String>, timestamp: i64) -> Self {
        let hash = data_hash(data.as_ref().unwrap_or(&Value::Null));
        SyncEnvelope {
            data,
            timestamp,
            device_id: device_id.into(),
            hash,
        }
    }

    /// Builds a tombstone envelope.
    pub fn tombstone(device_id: impl Into<String>) -> Self {
        Self::new(None, device_id)
    }

    /// Parses a remote node into an envelope.
    ///
    /// Envelopes written without a hash get one computed here, so
    /// comparisons never see an empty fingerprint.
    pub fn from_value(path: &str, value: Value) -> CoreResult<Self> {
        if !value.is_object() {
            return Err(CoreError::malformed(path, "expected an object"));
        }

        let mut envelope: RawEnvelope = serde_json::from_value(value)
            .map_err(|e| CoreError::malformed(path, e.to_string()))?;

        if envelope.hash.is_empty() {
            envelope.hash = data_hash(envelope.data.as_ref().unwrap_or(&Value::Null));
        }
        Ok(envelope)
    }

    /// Converts the envelope into a plain JSON value for writing.
    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserializes the payload into a domain type.
    ///
    /// Returns `Ok(None)` for tombstones.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<Option<T>> {
        match &self.data {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

impl<T> SyncEnvelope<T> {
    /// True when this envelope marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }

    /// True when both envelopes carry the same payload fingerprint.
    pub fn same_content<U>(&self, other: &SyncEnvelope<U>) -> bool {
        self.hash == other.hash
    }

    /// True when the envelope was written by `device_id`.
    pub fn is_from(&self, device_id: &str) -> bool {
        self.device_id == device_id
    }
}

// =============================================================================
// Fingerprints
// =============================================================================

/// Computes the short fingerprint of a payload.
///
/// ## Example
/// ```rust
/// use dayflow_core::envelope::data_hash;
/// use serde_json::json;
///
/// let a = data_hash(&json!({"text": "buy milk", "done": false}));
/// let b = data_hash(&json!({"done": false, "text": "buy milk"}));
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 16);
/// ```
pub fn data_hash(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_LEN);
    hash
}

/// Renders JSON with object keys in sorted order.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// =============================================================================
// Clock
// =============================================================================

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Wall-clock milliseconds, never lower than a previously returned value.
///
/// Backwards clock jumps are absorbed so that two writes from the same
/// process keep their submission order under LWW.
pub fn now_millis() -> i64 {
    let wall = chrono::Utc::now().timestamp_millis();
    let previous = LAST_TIMESTAMP.fetch_max(wall, Ordering::SeqCst);
    previous.max(wall)
}

// =============================================================================
// Unit Tests
// =============================================================================
