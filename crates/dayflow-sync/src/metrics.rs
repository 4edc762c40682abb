//! # Remote Metrics
//!
//! Per-path counters for remote traffic: listener attaches and detaches,
//! delivered events, estimated bytes read and written, errors.
//!
//! Instrumentation is off unless enabled (debug builds enable it by
//! default). When off, every `record_*` call returns immediately.
//!
//! Byte counts are estimates: the size of the compact JSON encoding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Counters for one remote path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMetrics {
    pub path: String,
    pub attaches: u64,
    pub detaches: u64,
    pub events: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub errors: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Per-path remote instrumentation.
#[derive(Debug, Default)]
pub struct RemoteMetrics {
    enabled: AtomicBool,
    paths: Mutex<HashMap<String, PathMetrics>>,
}

impl RemoteMetrics {
    /// Creates a metrics sink.
    pub fn new(enabled: bool) -> Self {
        RemoteMetrics {
            enabled: AtomicBool::new(enabled),
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// True when recording.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turns recording on or off. Existing counters are kept.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn record_attach(&self, path: &str) {
        self.update(path, |m| m.attaches += 1);
    }

    pub fn record_detach(&self, path: &str) {
        self.update(path, |m| m.detaches += 1);
    }

    /// A listener event carrying `bytes` of payload.
    pub fn record_event(&self, path: &str, bytes: u64) {
        self.update(path, |m| {
            m.events += 1;
            m.read_bytes += bytes;
        });
    }

    /// A one-shot read of `bytes`.
    pub fn record_read(&self, path: &str, bytes: u64) {
        self.update(path, |m| m.read_bytes += bytes);
    }

    pub fn record_write(&self, path: &str, bytes: u64) {
        self.update(path, |m| m.write_bytes += bytes);
    }

    pub fn record_error(&self, path: &str) {
        self.update(path, |m| m.errors += 1);
    }

    /// Copy of all counters, busiest path first.
    pub fn snapshot(&self) -> Vec<PathMetrics> {
        let mut all: Vec<PathMetrics> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| b.events.cmp(&a.events).then_with(|| a.path.cmp(&b.path)));
        all
    }

    /// Counters for one path.
    pub fn path(&self, path: &str) -> Option<PathMetrics> {
        self.lock().get(path).cloned()
    }

    /// Clears all counters.
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn update<F: FnOnce(&mut PathMetrics)>(&self, path: &str, f: F) {
        if !self.is_enabled() {
            return;
        }
        let mut paths = self.lock();
        let entry = paths.entry(path.to_string()).or_insert_with(|| PathMetrics {
            path: path.to_string(),
            ..Default::default()
        });
        f(entry);
        entry.last_event_at = Some(Utc::now());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PathMetrics>> {
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Estimated wire size of a JSON value.
pub fn estimate_json_bytes(value: &Value) -> u64 {
    if value.is_null() {
        return 0;
    }
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len() as u64)
}

/// [`estimate_json_bytes`] for an optional snapshot.
pub fn estimate_snapshot_bytes(value: Option<&Value>) -> u64 {
    value.map_or(0, estimate_json_bytes)
}
