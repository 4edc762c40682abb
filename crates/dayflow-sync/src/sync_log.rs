//! # Persisted Sync Log
//!
//! A bounded, newest-first ring of sync events, shown to the user as the
//! sync history panel and kept across restarts.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  record(type, action, message, data?, error?)                          │
//! │       │                                                                 │
//! │       ├──► tracing event (warn for errors, debug otherwise)             │
//! │       ├──► ring: push front, keep `capacity` newest                    │
//! │       ├──► watch channel: subscribers see the new list                 │
//! │       └──► spawn: put(systemState, syncLogs, ring)   (fire-and-forget)  │
//! │                                                                         │
//! │  load() at startup merges the stored ring behind anything recorded     │
//! │  since the process started.                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dayflow_core::{SYNC_LOG_KEY, SYSTEM_COLLECTION};
use dayflow_db::LocalStore;

use crate::error::SyncResult;

/// Stored `data` is cut to this many characters.
pub const MAX_DATA_CHARS: usize = 200;

/// Default ring size.
pub const DEFAULT_CAPACITY: usize = 100;

// =============================================================================
// Entry Types
// =============================================================================

/// Which side of the sync the event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Local,
    Remote,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogAction {
    Save,
    Load,
    Sync,
    Error,
    Retry,
    Info,
}

/// One sync log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub source: LogSource,
    pub action: LogAction,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Filter for [`SyncLog::filter`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub source: Option<LogSource>,
    pub action: Option<LogAction>,
    pub since: Option<DateTime<Utc>>,
}

impl LogFilter {
    fn matches(&self, entry: &SyncLogEntry) -> bool {
        self.source.map_or(true, |s| s == entry.source)
            && self.action.map_or(true, |a| a == entry.action)
            && self.since.map_or(true, |t| entry.timestamp >= t)
    }
}

// =============================================================================
// Sync Log
// =============================================================================

/// Bounded sync history.
pub struct SyncLog {
    entries: watch::Sender<Vec<SyncLogEntry>>,
    capacity: usize,
    store: Option<Arc<dyn LocalStore>>,
    generation: AtomicU64,
    persisted: Arc<Mutex<u64>>,
}

impl SyncLog {
    /// In-memory log with no persistence.
    pub fn new(capacity: usize) -> Self {
        let (entries, _) = watch::channel(Vec::new());
        SyncLog {
            entries,
            capacity: capacity.max(1),
            store: None,
            generation: AtomicU64::new(0),
            persisted: Arc::new(Mutex::new(0)),
        }
    }

    /// Log persisted under `systemState/syncLogs` in `store`.
    pub fn persistent(capacity: usize, store: Arc<dyn LocalStore>) -> Self {
        SyncLog {
            store: Some(store),
            ..Self::new(capacity)
        }
    }

    /// Restores the stored ring. Entries recorded before `load` stay in front.
    pub async fn load(&self) -> SyncResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let stored: Vec<SyncLogEntry> = match store.get(SYSTEM_COLLECTION, SYNC_LOG_KEY).await? {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(error = %e, "Stored sync log is unreadable, starting empty");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let restored = stored.len();

        let capacity = self.capacity;
        self.entries.send_modify(|entries| {
            let mut seen: HashSet<String> = entries.iter().map(|e| e.id.clone()).collect();
            entries.extend(stored.into_iter().filter(|e| seen.insert(e.id.clone())));
            entries.truncate(capacity);
        });

        info!(restored, "Sync log loaded");
        self.persist();
        Ok(restored)
    }

    /// Appends an entry.
    pub fn record(
        &self,
        source: LogSource,
        action: LogAction,
        message: impl Into<String>,
        data: Option<&Value>,
        error: Option<&str>,
    ) {
        let entry = SyncLogEntry {
            id: format!("log-{}", Uuid::new_v4()),
            timestamp: Utc::now(),
            source,
            action,
            message: message.into(),
            data: data.map(truncate_data),
            error: error.map(str::to_string),
        };

        match action {
            LogAction::Error => {
                warn!(source = ?source, message = %entry.message, error = ?entry.error, "sync log")
            }
            LogAction::Retry => info!(source = ?source, message = %entry.message, "sync log"),
            _ => debug!(source = ?source, action = ?action, message = %entry.message, "sync log"),
        }

        let capacity = self.capacity;
        self.entries.send_modify(|entries| {
            entries.insert(0, entry);
            entries.truncate(capacity);
        });
        self.persist();
    }

    /// Records a successful sync.
    pub fn sync(&self, source: LogSource, message: impl Into<String>) {
        self.record(source, LogAction::Sync, message, None, None);
    }

    /// Records a failure.
    pub fn error(&self, source: LogSource, message: impl Into<String>, error: &str) {
        self.record(source, LogAction::Error, message, None, Some(error));
    }

    /// Records a retry attempt or outcome.
    pub fn retry(&self, message: impl Into<String>) {
        self.record(LogSource::Remote, LogAction::Retry, message, None, None);
    }

    /// Records an informational event.
    pub fn info(&self, source: LogSource, message: impl Into<String>) {
        self.record(source, LogAction::Info, message, None, None);
    }

    /// Newest-first copy of the ring.
    pub fn entries(&self) -> Vec<SyncLogEntry> {
        self.entries.borrow().clone()
    }

    /// Entries matching `filter`, newest first.
    pub fn filter(&self, filter: &LogFilter) -> Vec<SyncLogEntry> {
        self.entries
            .borrow()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the ring (and the stored copy).
    pub fn clear(&self) {
        self.entries.send_modify(Vec::clear);
        self.persist();
    }

    /// Live view of the ring. The receiver holds the current list immediately.
    pub fn subscribe(&self) -> watch::Receiver<Vec<SyncLogEntry>> {
        self.entries.subscribe()
    }

    /// Writes the ring to the store in the background.
    ///
    /// Each write carries a generation; a write that finds a newer one
    /// already stored is skipped.
    fn persist(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, sync log not persisted");
            return;
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = match serde_json::to_value(&*self.entries.borrow()) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to serialize sync log");
                return;
            }
        };
        let persisted = self.persisted.clone();

        runtime.spawn(async move {
            let mut last = persisted.lock().await;
            if generation <= *last {
                return;
            }
            match store.put(SYSTEM_COLLECTION, SYNC_LOG_KEY, snapshot).await {
                Ok(()) => *last = generation,
                Err(e) => warn!(error = %e, "Failed to persist sync log"),
            }
        });
    }
}

fn truncate_data(value: &Value) -> String {
    let json = value.to_string();
    if json.chars().count() <= MAX_DATA_CHARS {
        json
    } else {
        json.chars().take(MAX_DATA_CHARS).collect()
    }
}
