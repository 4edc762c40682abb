//! # Sync Events
//!
//! Status and failure notifications for the embedding application.
//!
//! ```text
//!   RetryQueue ──┐
//!                ├──► EmitterSlot ──► Arc<dyn SyncEventEmitter>
//!   Engine ──────┘        ▲
//!                         └── set_error_callback(|failure| ...)
//! ```
//!
//! The slot is shared, so swapping the emitter (or installing an error
//! callback) takes effect for every component at once.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

// =============================================================================
// Payloads
// =============================================================================

/// A push that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    /// Retry queue entry id, when the failure is queued.
    pub entry_id: Option<String>,

    /// Collection the failed write belongs to.
    pub collection: String,

    /// Human readable reason.
    pub message: String,

    /// True when a manual retry may still succeed.
    pub can_retry: bool,
}

/// Snapshot of engine state for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// `initialize` has run.
    pub initialized: bool,

    /// Remote listeners are attached.
    pub listening: bool,

    /// Retry entries still being retried automatically.
    pub pending_retries: usize,

    /// Retry entries that ran out of attempts.
    pub parked_retries: usize,

    /// Last successful remote write or apply.
    pub last_sync: Option<DateTime<Utc>>,

    /// Last failure message.
    pub last_error: Option<String>,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives sync notifications (UI bindings, tests).
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a status change.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits a failed push.
    fn emit_error(&self, failure: &SyncFailure);
}

/// Emitter that drops everything.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_error(&self, _failure: &SyncFailure) {}
}

type ErrorCallback = Box<dyn Fn(&SyncFailure) + Send + Sync>;

/// Routes errors to a closure and status to the wrapped emitter.
pub struct CallbackEmitter {
    on_error: ErrorCallback,
    inner: Arc<dyn SyncEventEmitter>,
}

impl CallbackEmitter {
    pub fn new<F>(on_error: F, inner: Arc<dyn SyncEventEmitter>) -> Self
    where
        F: Fn(&SyncFailure) + Send + Sync + 'static,
    {
        CallbackEmitter {
            on_error: Box::new(on_error),
            inner,
        }
    }
}

impl SyncEventEmitter for CallbackEmitter {
    fn emit_status(&self, status: &SyncStatus) {
        self.inner.emit_status(status);
    }

    fn emit_error(&self, failure: &SyncFailure) {
        (self.on_error)(failure);
    }
}

// =============================================================================
// Shared Slot
// =============================================================================

/// Replaceable emitter shared between components.
pub struct EmitterSlot {
    current: RwLock<Arc<dyn SyncEventEmitter>>,
}

impl EmitterSlot {
    pub fn new(emitter: Arc<dyn SyncEventEmitter>) -> Self {
        EmitterSlot {
            current: RwLock::new(emitter),
        }
    }

    /// The emitter currently installed.
    pub fn get(&self) -> Arc<dyn SyncEventEmitter> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Installs a new emitter.
    pub fn set(&self, emitter: Arc<dyn SyncEventEmitter>) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = emitter;
    }

    /// Sends errors to `callback`, keeping status on the current emitter.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&SyncFailure) + Send + Sync + 'static,
    {
        let inner = self.get();
        self.set(Arc::new(CallbackEmitter::new(callback, inner)));
    }

    pub fn emit_error(&self, failure: &SyncFailure) {
        self.get().emit_error(failure);
    }

    pub fn emit_status(&self, status: &SyncStatus) {
        self.get().emit_status(status);
    }
}

impl Default for EmitterSlot {
    fn default() -> Self {
        EmitterSlot::new(Arc::new(NoOpEmitter))
    }
}

impl fmt::Debug for EmitterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmitterSlot").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        statuses: Mutex<Vec<SyncStatus>>,
        errors: Mutex<Vec<SyncFailure>>,
    }

    impl SyncEventEmitter for Recorder {
        fn emit_status(&self, status: &SyncStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }
        fn emit_error(&self, failure: &SyncFailure) {
            self.errors.lock().unwrap().push(failure.clone());
        }
    }

    fn failure() -> SyncFailure {
        SyncFailure {
            entry_id: Some("templates-t1-1".into()),
            collection: "templates".into(),
            message: "offline".into(),
            can_retry: true,
        }
    }

    #[test]
    fn test_error_callback_keeps_status_routing() {
        let recorder = Arc::new(Recorder::default());
        let slot = EmitterSlot::new(recorder.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        slot.set_error_callback(move |f| sink.lock().unwrap().push(f.entry_id.clone()));

        slot.emit_error(&failure());
        slot.emit_status(&SyncStatus::default());

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(recorder.errors.lock().unwrap().is_empty());
        assert_eq!(recorder.statuses.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failure_wire_shape() {
        let value = serde_json::to_value(failure()).unwrap();
        assert_eq!(value["entryId"], "templates-t1-1");
        assert_eq!(value["canRetry"], true);
    }
}
