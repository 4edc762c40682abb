//! # Sync Context
//!
//! State shared by the strategy core, item sync and the retry queue.
//!
//! ```text
//!                    ┌──────────────────────────────────────────┐
//!   SyncCore ───────►│ SyncContext                              │
//!   ItemSync ───────►│   remote         Arc<dyn RemoteStore>    │
//!   RetryQueue ─────►│   device         stamped on envelopes    │
//!                    │   known          path ──► last envelope  │
//!                    │   intended       path ──► latest hash    │
//!                    │   write_lock     one remote write at once│
//!                    │   log, metrics, emitter                  │
//!                    └──────────────────────────────────────────┘
//! ```
//!
//! `known` holds the last envelope this device wrote or observed for a
//! path. `intended` holds the hash of the newest envelope this device
//! wanted at a path; a queued retry with any other hash is stale.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use dayflow_core::RawEnvelope;

use crate::device::DeviceIdentity;
use crate::error::SyncResult;
use crate::events::EmitterSlot;
use crate::metrics::{estimate_json_bytes, RemoteMetrics};
use crate::remote::RemoteStore;
use crate::sync_log::SyncLog;

/// Shared sync state. Cheap to clone behind an `Arc`.
pub struct SyncContext {
    remote: Arc<dyn RemoteStore>,
    device: DeviceIdentity,
    default_user: String,
    known: Mutex<HashMap<String, RawEnvelope>>,
    intended: Mutex<HashMap<String, String>>,
    write_lock: AsyncMutex<()>,
    log: Arc<SyncLog>,
    metrics: Arc<RemoteMetrics>,
    emitter: EmitterSlot,
}

impl SyncContext {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        device: DeviceIdentity,
        default_user: impl Into<String>,
        log: Arc<SyncLog>,
        metrics: Arc<RemoteMetrics>,
    ) -> Self {
        SyncContext {
            remote,
            device,
            default_user: default_user.into(),
            known: Mutex::new(HashMap::new()),
            intended: Mutex::new(HashMap::new()),
            write_lock: AsyncMutex::new(()),
            log,
            metrics,
            emitter: EmitterSlot::default(),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn device_id(&self) -> &str {
        self.device.id()
    }

    /// Strategy override, or the configured user.
    pub fn user_id<'a>(&'a self, preferred: Option<&'a str>) -> &'a str {
        preferred.unwrap_or(&self.default_user)
    }

    pub fn log(&self) -> &Arc<SyncLog> {
        &self.log
    }

    pub fn metrics(&self) -> &Arc<RemoteMetrics> {
        &self.metrics
    }

    pub fn emitter(&self) -> &EmitterSlot {
        &self.emitter
    }

    // =========================================================================
    // Envelope Cache
    // =========================================================================

    /// Last envelope written or observed at `path`.
    pub fn known(&self, path: &str) -> Option<RawEnvelope> {
        self.known_map().get(path).cloned()
    }

    pub fn remember(&self, path: &str, envelope: RawEnvelope) {
        self.known_map().insert(path.to_string(), envelope);
    }

    /// Drops every cached envelope, e.g. after switching remote identity.
    pub fn forget_all(&self) {
        self.known_map().clear();
        self.intended_map().clear();
    }

    /// Marks `hash` as the newest envelope this device wants at `path`.
    pub fn set_intended(&self, path: &str, hash: &str) {
        self.intended_map().insert(path.to_string(), hash.to_string());
    }

    /// False when a newer envelope superseded `hash` at `path`.
    pub fn is_intended(&self, path: &str, hash: &str) -> bool {
        self.intended_map()
            .get(path)
            .map_or(true, |latest| latest == hash)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Serializes remote writes from this process.
    pub async fn lock_writes(&self) -> AsyncMutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Writes an envelope and records it as known on success.
    ///
    /// Callers hold [`lock_writes`](Self::lock_writes).
    pub async fn write_envelope(&self, path: &str, envelope: &RawEnvelope) -> SyncResult<()> {
        let value = envelope.to_value()?;
        let bytes = estimate_json_bytes(&value);

        match self.remote.write(path, Some(value)).await {
            Ok(()) => {
                self.metrics.record_write(path, bytes);
                self.remember(path, envelope.clone());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error(path);
                Err(e)
            }
        }
    }

    fn known_map(&self) -> MutexGuard<'_, HashMap<String, RawEnvelope>> {
        self.known.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn intended_map(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.intended.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::sync_log::DEFAULT_CAPACITY;

    /// Context over a fresh in-memory remote for device `device`.
    pub fn context(remote: &MemoryRemote, device: &str) -> Arc<SyncContext> {
        Arc::new(SyncContext::new(
            Arc::new(remote.clone()),
            DeviceIdentity::fixed(device).unwrap(),
            "u",
            Arc::new(SyncLog::new(DEFAULT_CAPACITY)),
            Arc::new(RemoteMetrics::new(true)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::remote::MemoryRemote;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_envelope_records_known_and_metrics() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote, "laptop");
        let envelope = RawEnvelope::new(Some(json!({"xp": 1})), ctx.device_id());

        let _guard = ctx.lock_writes().await;
        ctx.write_envelope("users/u/gameState", &envelope).await.unwrap();

        assert_eq!(ctx.known("users/u/gameState"), Some(envelope));
        assert!(ctx.metrics().path("users/u/gameState").unwrap().write_bytes > 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_known() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);
        let ctx = context(&remote, "laptop");
        let envelope = RawEnvelope::new(Some(json!(1)), ctx.device_id());

        assert!(ctx.write_envelope("users/u/x", &envelope).await.is_err());
        assert!(ctx.known("users/u/x").is_none());
        assert_eq!(ctx.metrics().path("users/u/x").unwrap().errors, 1);
    }

    #[test]
    fn test_intended_tracking() {
        let remote = MemoryRemote::new();
        let ctx = context(&remote, "laptop");
        assert!(ctx.is_intended("p", "aaaa"));
        ctx.set_intended("p", "bbbb");
        assert!(!ctx.is_intended("p", "aaaa"));
        assert!(ctx.is_intended("p", "bbbb"));
        assert_eq!(ctx.user_id(None), "u");
        assert_eq!(ctx.user_id(Some("other")), "other");
    }
}
