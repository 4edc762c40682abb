//! # Sync Strategy Core
//!
//! Generic push, pull and subscribe over any [`SyncStrategy`].
//!
//! ## Push
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  push(strategy, data?, key?)                                           │
//! │       │                                                                 │
//! │       ├─ serialize ── Err(SerializationFailed)                         │
//! │       ├─ path_for  ── Err(InvalidPath)                                 │
//! │       ▼                                                                 │
//! │  envelope { data, timestamp, deviceId, hash }                          │
//! │       │                                                                 │
//! │       ├─ same hash as last known ──────────► Skipped   (no write)      │
//! │       ├─ write ok ─────────────────────────► Written                   │
//! │       └─ write fails (transient) ──► retry ► Queued { entry_id }       │
//! │                                                                         │
//! │  Pushes from one core are serialized, so submission order holds.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Subscribe
//! ```text
//!   registry event ──► envelope ──► own device? ──► skip
//!                                   same as known? ─► skip
//!                                   resolve_conflict(known, remote)
//!                                   on_change(resolved)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::{debug, warn};

use dayflow_core::RawEnvelope;

use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::metrics::estimate_snapshot_bytes;
use crate::registry::{Consumer, ListenerHandle, ListenerRegistry};
use crate::retry::RetryQueue;
use crate::strategy::SyncStrategy;
use crate::sync_log::{LogAction, LogSource};

type SharedRead = Shared<BoxFuture<'static, SyncResult<Option<Value>>>>;

/// What a push did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The envelope is on the remote.
    Written,
    /// Content matched the last known envelope; nothing was written.
    Skipped,
    /// The write failed transiently and waits in the retry queue.
    Queued { entry_id: String },
}

/// Strategy-driven push/pull/subscribe.
pub struct SyncCore {
    ctx: Arc<SyncContext>,
    registry: Arc<ListenerRegistry>,
    retry: Arc<RetryQueue>,
    backfills: Mutex<HashMap<String, (u64, SharedRead)>>,
    backfill_seq: AtomicU64,
}

impl SyncCore {
    pub fn new(
        ctx: Arc<SyncContext>,
        registry: Arc<ListenerRegistry>,
        retry: Arc<RetryQueue>,
    ) -> Self {
        SyncCore {
            ctx,
            registry,
            retry,
            backfills: Mutex::new(HashMap::new()),
            backfill_seq: AtomicU64::new(0),
        }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Pushes `data` (or a tombstone for `None`) to the strategy path.
    pub async fn push<S: SyncStrategy>(
        &self,
        strategy: &S,
        data: Option<&S::Value>,
        key: Option<&str>,
    ) -> SyncResult<PushOutcome> {
        let path = strategy.path_for(self.ctx.user_id(strategy.user_id()), key)?;
        let payload = data.map(|value| strategy.serialize(value)).transpose()?;
        let envelope = RawEnvelope::new(payload, self.ctx.device_id());

        let outcome = self
            .push_envelope(strategy.collection(), key, &path, envelope)
            .await?;
        if outcome == PushOutcome::Written {
            self.ctx
                .log()
                .sync(LogSource::Remote, strategy.success_message(data, key));
        }
        Ok(outcome)
    }

    /// Writes a prepared envelope with hash elision and retry enqueueing.
    pub(crate) async fn push_envelope(
        &self,
        collection: &str,
        key: Option<&str>,
        path: &str,
        envelope: RawEnvelope,
    ) -> SyncResult<PushOutcome> {
        let _writes = self.ctx.lock_writes().await;
        self.ctx.set_intended(path, &envelope.hash);

        if self
            .ctx
            .known(path)
            .is_some_and(|known| known.same_content(&envelope))
        {
            self.retry.discard_path(path);
            debug!(path = %path, "Push skipped, content unchanged");
            return Ok(PushOutcome::Skipped);
        }

        match self.ctx.write_envelope(path, &envelope).await {
            Ok(()) => {
                self.retry.discard_path(path);
                debug!(path = %path, hash = %envelope.hash, "Pushed envelope");
                Ok(PushOutcome::Written)
            }
            Err(e) if e.is_retryable() => {
                self.ctx.log().error(
                    LogSource::Remote,
                    format!("Failed to sync {}", collection),
                    &e.to_string(),
                );
                let entry_id = self.retry.enqueue(collection, key, path, envelope, &e);
                Ok(PushOutcome::Queued { entry_id })
            }
            Err(e) => {
                self.ctx.log().error(
                    LogSource::Remote,
                    format!("Failed to sync {}", collection),
                    &e.to_string(),
                );
                Err(e)
            }
        }
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Reads the current value. Absent, tombstoned and malformed all give `None`.
    pub async fn pull<S: SyncStrategy>(
        &self,
        strategy: &S,
        key: Option<&str>,
    ) -> SyncResult<Option<S::Value>> {
        let path = strategy.path_for(self.ctx.user_id(strategy.user_id()), key)?;
        let raw = read_node(&self.ctx, &path).await?;
        Ok(self.decode_pulled(strategy, &path, key, raw))
    }

    /// [`pull`](Self::pull), but concurrent calls for one path share a
    /// single remote read.
    pub async fn backfill<S: SyncStrategy>(
        &self,
        strategy: &S,
        key: Option<&str>,
    ) -> SyncResult<Option<S::Value>> {
        let path = strategy.path_for(self.ctx.user_id(strategy.user_id()), key)?;

        let (generation, read) = {
            let mut backfills = self.backfills();
            backfills
                .entry(path.clone())
                .or_insert_with(|| {
                    let ctx = self.ctx.clone();
                    let read_path = path.clone();
                    let generation = self.backfill_seq.fetch_add(1, Ordering::Relaxed);
                    let read = async move { read_node(&ctx, &read_path).await }
                        .boxed()
                        .shared();
                    (generation, read)
                })
                .clone()
        };

        let raw = read.await;
        {
            let mut backfills = self.backfills();
            if backfills.get(&path).is_some_and(|(g, _)| *g == generation) {
                backfills.remove(&path);
            }
        }

        Ok(self.decode_pulled(strategy, &path, key, raw?))
    }

    fn decode_pulled<S: SyncStrategy>(
        &self,
        strategy: &S,
        path: &str,
        key: Option<&str>,
        raw: Option<Value>,
    ) -> Option<S::Value> {
        let raw = raw?;
        let envelope = match RawEnvelope::from_value(path, raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(path = %path, error = %e, "Skipping malformed remote value");
                self.ctx.log().error(
                    LogSource::Remote,
                    format!("Malformed {} payload", strategy.collection()),
                    &e.to_string(),
                );
                return None;
            }
        };

        let data = envelope.data.clone();
        self.ctx.remember(path, envelope);
        let value = match strategy.deserialize(data?) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path, error = %e, "Remote value does not decode");
                self.ctx.log().error(
                    LogSource::Remote,
                    format!("Malformed {} payload", strategy.collection()),
                    &e.to_string(),
                );
                return None;
            }
        };

        let message = match key {
            Some(key) => format!("{} fetched ({})", strategy.collection(), key),
            None => format!("{} fetched", strategy.collection()),
        };
        self.ctx
            .log()
            .record(LogSource::Remote, LogAction::Load, message, None, None);
        Some(value)
    }

    // =========================================================================
    // Subscribe
    // =========================================================================

    /// Listens to the strategy path. `on_change` receives each resolved
    /// remote value from other devices (`None` for a deletion).
    pub async fn subscribe<S, F>(
        &self,
        strategy: Arc<S>,
        on_change: F,
        key: Option<&str>,
    ) -> SyncResult<ListenerHandle>
    where
        S: SyncStrategy + 'static,
        F: Fn(Option<S::Value>) + Send + Sync + 'static,
    {
        let path = strategy.path_for(self.ctx.user_id(strategy.user_id()), key)?;
        let ctx = self.ctx.clone();
        let listen_path = path.clone();

        let consumer: Consumer = Arc::new(move |snapshot: Option<&Value>| {
            let Some(snapshot) = snapshot else {
                return Ok(());
            };
            let remote = RawEnvelope::from_value(&listen_path, snapshot.clone())?;
            if remote.is_from(ctx.device_id()) {
                return Ok(());
            }

            let local = ctx.known(&listen_path);
            if local.as_ref().is_some_and(|l| l.same_content(&remote)) {
                return Ok(());
            }

            let resolved = strategy.resolve_conflict(local.as_ref(), &remote)?;
            if resolved == remote.data {
                ctx.remember(&listen_path, remote);
            }

            ctx.log().sync(
                LogSource::Remote,
                format!("Received {} update", strategy.collection()),
            );
            let value = resolved.map(|v| strategy.deserialize(v)).transpose()?;
            on_change(value);
            Ok(())
        });

        self.registry.attach(&path, consumer).await
    }

    fn backfills(&self) -> MutexGuard<'_, HashMap<String, (u64, SharedRead)>> {
        self.backfills.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One remote read with metrics.
pub(crate) async fn read_node(ctx: &SyncContext, path: &str) -> SyncResult<Option<Value>> {
    match ctx.remote().read(path).await {
        Ok(value) => {
            ctx.metrics()
                .record_read(path, estimate_snapshot_bytes(value.as_ref()));
            Ok(value)
        }
        Err(e) => {
            ctx.metrics().record_error(path);
            ctx.log().error(
                LogSource::Remote,
                format!("Failed to fetch {}", path),
                &e.to_string(),
            );
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::RetrySettings;
    use crate::context::test_support::context;
    use crate::remote::{MemoryRemote, RemoteStore};

    /// A core for `device` over `remote`.
    pub fn core(remote: &MemoryRemote, device: &str) -> Arc<SyncCore> {
        core_with(context(remote, device), remote.clone())
    }

    pub fn core_with(ctx: Arc<SyncContext>, remote: impl RemoteStore + 'static) -> Arc<SyncCore> {
        let registry = Arc::new(ListenerRegistry::new(
            Arc::new(remote),
            ctx.metrics().clone(),
        ));
        let retry = Arc::new(RetryQueue::new(ctx.clone(), RetrySettings::default()));
        Arc::new(SyncCore::new(ctx, registry, retry))
    }
}
