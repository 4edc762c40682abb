//! # Remote Store Contract
//!
//! The shared real-time tree every device reads, writes and listens to.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          RemoteStore                                    │
//! │                                                                         │
//! │  write(path, Some(v))   set the node at `path`                         │
//! │  write(path, None)      remove the node                                │
//! │  read(path)             current value or None                          │
//! │  subscribe(path, query, handler) ──► Subscription                      │
//! │       │                                                                 │
//! │       ├── handler(Value(current)) immediately                           │
//! │       ├── handler(Value(new))     on every change at/under/above path  │
//! │       └── handler(Error(msg))     when the remote drops the listener   │
//! │                                                                         │
//! │  Subscription::cancel() or drop ──► no further handler calls           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Paths are `/`-separated, without leading or trailing slash.
//! A key-range query (`start_at`) only sees direct children whose key is
//! `>= start_at`.

pub mod memory;
pub mod ws;

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncResult;

pub use memory::MemoryRemote;
pub use ws::{WsRemote, WsRemoteConfig};

// =============================================================================
// Query & Events
// =============================================================================

/// Listener query options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RemoteQuery {
    /// Only children with key `>= start_at` (ordered by key).
    pub start_at: Option<String>,
}

impl RemoteQuery {
    /// Plain value query.
    pub fn value() -> Self {
        RemoteQuery::default()
    }

    /// Key-range query starting at `start_at`.
    pub fn start_at(key: impl Into<String>) -> Self {
        RemoteQuery {
            start_at: Some(key.into()),
        }
    }
}

/// What a listener receives.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Snapshot of the listened node (`None` when absent).
    Value(Option<Value>),
    /// The remote cancelled the listener.
    Error(String),
}

/// Listener callback.
pub type RemoteHandler = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

// =============================================================================
// Subscription
// =============================================================================

/// A live remote listener. Cancelled explicitly or on drop.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Wraps a cancel function.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// Stops the listener. Idempotent.
    pub fn cancel(&self) {
        let cancel = match self.cancel.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

// =============================================================================
// Remote Store Trait
// =============================================================================

/// Shared remote tree.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Sets (`Some`) or removes (`None`) the node at `path`.
    async fn write(&self, path: &str, value: Option<Value>) -> SyncResult<()>;

    /// Reads the node at `path`.
    async fn read(&self, path: &str) -> SyncResult<Option<Value>>;

    /// Starts listening on `path`.
    ///
    /// The handler must be called with the current value right away
    /// (possibly from another task) and then on every change.
    async fn subscribe(
        &self,
        path: &str,
        query: RemoteQuery,
        handler: RemoteHandler,
    ) -> SyncResult<Subscription>;
}

// =============================================================================
// Tree Helpers
// =============================================================================

/// Splits a path into its segments.
pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Applies a key-range filter to a snapshot.
///
/// Non-object values are not range-addressable and come back unchanged.
pub(crate) fn filter_start_at(value: Option<Value>, start_at: Option<&str>) -> Option<Value> {
    let Some(start) = start_at else {
        return value;
    };
    match value {
        Some(Value::Object(map)) => {
            let filtered: serde_json::Map<String, Value> = map
                .into_iter()
                .filter(|(key, _)| key.as_str() >= start)
                .collect();
            if filtered.is_empty() {
                None
            } else {
                Some(Value::Object(filtered))
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_cancels_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.cancel();
        sub.cancel();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_start_at() {
        let snapshot = json!({"2024-05-30": 1, "2024-06-01": 2, "2024-06-02": 3});

        let filtered = filter_start_at(Some(snapshot.clone()), Some("2024-06-01"));
        assert_eq!(filtered, Some(json!({"2024-06-01": 2, "2024-06-02": 3})));

        assert_eq!(filter_start_at(Some(snapshot.clone()), None), Some(snapshot));
        assert_eq!(filter_start_at(Some(json!({"a": 1})), Some("b")), None);
        assert_eq!(filter_start_at(None, Some("b")), None);
    }

    #[test]
    fn test_segments() {
        assert_eq!(segments("users/u1/dailyData"), vec!["users", "u1", "dailyData"]);
        assert!(segments("").is_empty());
    }
}
