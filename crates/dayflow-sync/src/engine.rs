//! # Auto-Sync Engine
//!
//! Wires the local store to the remote tree: local writes are pushed,
//! remote changes are applied, and neither direction echoes back.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         AutoSyncEngine                                  │
//! │                                                                         │
//! │  LocalStore.put/delete                                                 │
//! │      │ before_* hook (skipped while applying_remote is set)            │
//! │      ▼                                                                  │
//! │  EngineObserver ──post-commit──► OutboundWorker                        │
//! │                                    │ FIFO, trailing debounce per key    │
//! │                                    ▼                                    │
//! │                                  SyncCore.push / ItemSync              │
//! │                                    │ hash elision, retry queue          │
//! │                                    ▼                                    │
//! │                                  RemoteStore                           │
//! │                                    │ listener snapshot                  │
//! │                                    ▼                                    │
//! │  ListenerRegistry ──consumer──► InboundWorker                          │
//! │    skip own device,               │ coalesce per entity, resolve       │
//! │    skip known content             ▼                                    │
//! │                                  apply_remote_update(store.put)        │
//! │                                    │ flag set ──► no outbound change    │
//! │                                    └──► merged / repaired data pushed   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//! ```text
//! build() ──► initialize() ──► start_listening() ──► ... ──► shutdown()
//!               idempotent       idempotent                  final
//! ```
//!
//! The engine cannot be restarted after [`AutoSyncEngine::shutdown`]; build
//! a new one instead.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use dayflow_core::{remote_path, ConflictPolicy, RawEnvelope, Resolution};
use dayflow_db::{LocalStore, PostCommit, StoreObserver};

use crate::config::{CollectionSpec, Granularity, SyncConfig, SINGLETON_KEY};
use crate::context::SyncContext;
use crate::device::DeviceIdentity;
use crate::error::{SyncError, SyncResult};
use crate::events::{SyncEventEmitter, SyncFailure, SyncStatus};
use crate::item_sync::ItemSync;
use crate::metrics::RemoteMetrics;
use crate::registry::{Consumer, ListenerHandle, ListenerRegistry};
use crate::remote::RemoteStore;
use crate::retry::{RetryQueue, RetryWorkerHandle};
use crate::strategy::{JsonStrategy, SerdeItemStrategy};
use crate::sync_core::{PushOutcome, SyncCore};
use crate::sync_log::{LogSource, SyncLog};

/// First key of a lookback window: `today - days`, as `YYYY-MM-DD`.
pub fn range_start(today: NaiveDate, lookback_days: u32) -> String {
    today
        .checked_sub_days(Days::new(u64::from(lookback_days)))
        .unwrap_or(today)
        .format("%Y-%m-%d")
        .to_string()
}

// =============================================================================
// Messages
// =============================================================================

/// A committed local change.
#[derive(Debug, Clone)]
struct OutboundChange {
    collection: String,
    key: String,
    /// `None` for a delete.
    value: Option<Value>,
}

enum OutboundMessage {
    Change(OutboundChange),
    Flush(oneshot::Sender<()>),
}

/// A remote envelope that differs from what this device knows.
#[derive(Debug, Clone)]
struct InboundChange {
    collection: String,
    key: String,
    path: String,
    envelope: RawEnvelope,
}

enum InboundMessage {
    Change(InboundChange),
    Flush(oneshot::Sender<()>),
}

// =============================================================================
// Strategies
// =============================================================================

enum CollectionStrategy {
    Keyed(JsonStrategy),
    Singleton(JsonStrategy),
    Items(SerdeItemStrategy<Value>),
}

impl CollectionStrategy {
    fn for_spec(spec: &CollectionSpec) -> Self {
        match spec.granularity {
            Granularity::Keyed { .. } => CollectionStrategy::Keyed(
                JsonStrategy::new(spec.name.clone()).with_policy(spec.policy.clone()),
            ),
            Granularity::Singleton => CollectionStrategy::Singleton(
                JsonStrategy::new(spec.name.clone()).with_policy(spec.policy.clone()),
            ),
            Granularity::Items => CollectionStrategy::Items(SerdeItemStrategy::json(spec.name.clone())),
        }
    }
}

// =============================================================================
// Store Observer
// =============================================================================

/// Turns committed local writes into outbound changes.
struct EngineObserver {
    collection: String,
    applying_remote: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl EngineObserver {
    fn capture(&self, key: &str, value: Option<Value>) -> Option<PostCommit> {
        if self.applying_remote.load(Ordering::SeqCst) {
            return None;
        }
        let change = OutboundChange {
            collection: self.collection.clone(),
            key: key.to_string(),
            value,
        };
        let tx = self.tx.clone();
        Some(Box::new(move || {
            if tx.send(OutboundMessage::Change(change)).is_err() {
                debug!("Outbound worker gone, local change not pushed");
            }
        }))
    }
}

impl StoreObserver for EngineObserver {
    fn before_create(&self, _collection: &str, key: &str, value: &Value) -> Option<PostCommit> {
        self.capture(key, Some(value.clone()))
    }

    fn before_update(&self, _collection: &str, key: &str, merged: &Value) -> Option<PostCommit> {
        self.capture(key, Some(merged.clone()))
    }

    fn before_delete(&self, _collection: &str, key: &str) -> Option<PostCommit> {
        self.capture(key, None)
    }
}

/// Sets the apply flag and restores the previous value on drop.
struct ApplyingRemoteGuard<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl<'a> ApplyingRemoteGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        let previous = flag.swap(true, Ordering::SeqCst);
        ApplyingRemoteGuard { flag, previous }
    }
}

impl Drop for ApplyingRemoteGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}

// =============================================================================
// Engine State
// =============================================================================

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    shut_down: bool,
    outbound_tx: Option<mpsc::UnboundedSender<OutboundMessage>>,
    inbound_tx: Option<mpsc::UnboundedSender<InboundMessage>>,
    worker_shutdown: Vec<mpsc::Sender<()>>,
    retry_worker: Option<RetryWorkerHandle>,
    listeners: Vec<ListenerHandle>,
}

#[derive(Default)]
struct Progress {
    last_sync: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct EngineInner {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    core: Arc<SyncCore>,
    items: ItemSync,
    strategies: HashMap<String, CollectionStrategy>,
    applying_remote: Arc<AtomicBool>,
    lifecycle: AsyncMutex<Lifecycle>,
    initialized: AtomicBool,
    listening: AtomicBool,
    progress: Mutex<Progress>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`AutoSyncEngine`].
pub struct AutoSyncEngineBuilder {
    config: SyncConfig,
    store: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteStore>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    device: Option<DeviceIdentity>,
}

impl AutoSyncEngineBuilder {
    pub fn new(config: SyncConfig) -> Self {
        AutoSyncEngineBuilder {
            config,
            store: None,
            remote: None,
            emitter: None,
            device: None,
        }
    }

    pub fn with_local_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Uses an explicit device identity instead of the configured or
    /// persisted one.
    pub fn with_device(mut self, device: DeviceIdentity) -> Self {
        self.device = Some(device);
        self
    }

    /// Validates the config, loads the device identity and the sync log,
    /// and wires every component. Nothing runs until
    /// [`AutoSyncEngine::initialize`].
    pub async fn build(self) -> SyncResult<AutoSyncEngine> {
        let AutoSyncEngineBuilder {
            config,
            store,
            remote,
            emitter,
            device,
        } = self;

        config.validate()?;
        let store = store.ok_or_else(|| SyncError::InvalidConfig("Local store is required".into()))?;
        let remote = remote.ok_or_else(|| SyncError::InvalidConfig("Remote store is required".into()))?;

        let device = match (device, &config.device.id) {
            (Some(device), _) => device,
            (None, Some(id)) => DeviceIdentity::fixed(id.clone())?,
            (None, None) => DeviceIdentity::load_or_create(store.as_ref()).await?,
        };

        let instrumentation = &config.instrumentation;
        let log = if instrumentation.persist_log {
            let log = SyncLog::persistent(instrumentation.log_capacity, store.clone());
            if let Err(e) = log.load().await {
                warn!(error = %e, "Failed to restore sync log");
            }
            log
        } else {
            SyncLog::new(instrumentation.log_capacity)
        };
        let metrics = Arc::new(RemoteMetrics::new(instrumentation.metrics_enabled));

        let ctx = Arc::new(SyncContext::new(
            remote.clone(),
            device,
            config.user_id(),
            Arc::new(log),
            metrics.clone(),
        ));
        if let Some(emitter) = emitter {
            ctx.emitter().set(emitter);
        }

        let registry = Arc::new(ListenerRegistry::new(remote, metrics));
        let retry = Arc::new(RetryQueue::new(ctx.clone(), config.retry.clone()));
        let core = Arc::new(SyncCore::new(ctx, registry, retry));
        let items = ItemSync::new(core.clone());

        let strategies = config
            .collections
            .iter()
            .map(|spec| (spec.name.clone(), CollectionStrategy::for_spec(spec)))
            .collect();

        info!(
            device_id = %core.context().device_id(),
            user_id = %config.user_id(),
            collections = config.collections.len(),
            "Auto-sync engine built"
        );

        Ok(AutoSyncEngine {
            inner: Arc::new(EngineInner {
                config,
                store,
                core,
                items,
                strategies,
                applying_remote: Arc::new(AtomicBool::new(false)),
                lifecycle: AsyncMutex::new(Lifecycle::default()),
                initialized: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                progress: Mutex::new(Progress::default()),
            }),
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Automatic two-way sync between a [`LocalStore`] and a [`RemoteStore`].
#[derive(Clone)]
pub struct AutoSyncEngine {
    inner: Arc<EngineInner>,
}

impl AutoSyncEngine {
    pub fn builder(config: SyncConfig) -> AutoSyncEngineBuilder {
        AutoSyncEngineBuilder::new(config)
    }

    /// Registers store observers and starts the outbound, inbound and
    /// retry workers. Calling it again is a no-op.
    pub async fn initialize(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let mut life = inner.lifecycle.lock().await;
        if life.shut_down {
            return Err(SyncError::ShuttingDown);
        }
        if life.initialized {
            debug!("Auto-sync already initialized");
            return Ok(());
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        for spec in &inner.config.collections {
            let observer = EngineObserver {
                collection: spec.name.clone(),
                applying_remote: inner.applying_remote.clone(),
                tx: outbound_tx.clone(),
            };
            inner.store.add_observer(&spec.name, Arc::new(observer))?;
        }

        let (outbound_stop_tx, outbound_stop_rx) = mpsc::channel(1);
        let outbound = OutboundWorker {
            engine: inner.clone(),
            rx: outbound_rx,
            shutdown_rx: outbound_stop_rx,
            pending: HashMap::new(),
        };
        tokio::spawn(outbound.run());

        let (inbound_stop_tx, inbound_stop_rx) = mpsc::channel(1);
        let inbound = InboundWorker {
            engine: inner.clone(),
            rx: inbound_rx,
            shutdown_rx: inbound_stop_rx,
            window: inner.config.listener.coalesce_window(),
            batch: Vec::new(),
            deadline: None,
        };
        tokio::spawn(inbound.run());

        life.outbound_tx = Some(outbound_tx);
        life.inbound_tx = Some(inbound_tx);
        life.worker_shutdown = vec![outbound_stop_tx, inbound_stop_tx];
        life.retry_worker = Some(inner.core.retry_queue().spawn_worker());
        life.initialized = true;
        inner.initialized.store(true, Ordering::SeqCst);
        drop(life);

        info!(
            collections = inner.config.collections.len(),
            "Auto-sync initialized"
        );
        inner
            .log()
            .info(LogSource::Local, "Auto-sync initialized");
        inner.emit_status();
        Ok(())
    }

    /// Attaches one listener per collection. Calling it again while
    /// listening is a no-op. On failure nothing stays attached.
    pub async fn start_listening(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let mut life = inner.lifecycle.lock().await;
        if life.shut_down {
            return Err(SyncError::ShuttingDown);
        }
        if !life.initialized {
            return Err(SyncError::Internal(
                "initialize must run before start_listening".into(),
            ));
        }
        if !life.listeners.is_empty() {
            debug!("Already listening");
            return Ok(());
        }
        let tx = life
            .inbound_tx
            .clone()
            .ok_or_else(|| SyncError::Internal("inbound worker not running".into()))?;

        let user_id = inner.config.user_id();
        let registry = inner.core.registry();
        let mut handles = Vec::with_capacity(inner.config.collections.len());
        for spec in &inner.config.collections {
            let base = remote_path(user_id, &spec.name, None)?;
            let consumer = snapshot_consumer(inner.core.context().clone(), spec, base.clone(), tx.clone());
            let handle = match spec.lookback_days() {
                Some(days) => {
                    let start = range_start(Local::now().date_naive(), days);
                    registry.attach_range(&base, &start, consumer).await
                }
                None => registry.attach(&base, consumer).await,
            };
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(collection = %spec.name, error = %e, "Failed to attach listener");
                    inner.record_error(&e);
                    return Err(e);
                }
            }
        }

        let count = handles.len();
        life.listeners = handles;
        inner.listening.store(true, Ordering::SeqCst);
        drop(life);

        info!(collections = count, "Listening for remote changes");
        inner
            .log()
            .info(LogSource::Remote, format!("Listening to {} collections", count));
        inner.emit_status();
        Ok(())
    }

    /// Detaches this engine's listeners.
    pub async fn stop_listening(&self) {
        let handles = std::mem::take(&mut self.inner.lifecycle.lock().await.listeners);
        let count = handles.len();
        drop(handles);
        if self.inner.listening.swap(false, Ordering::SeqCst) {
            info!(collections = count, "Stopped listening");
            self.inner.emit_status();
        }
    }

    /// Tears down every listener and forgets cached envelopes, e.g. after
    /// the signed-in user changed. [`start_listening`](Self::start_listening)
    /// may be called again afterwards.
    pub async fn reset_remote_identity(&self) {
        let inner = &self.inner;
        let mut life = inner.lifecycle.lock().await;
        inner.core.registry().stop_all();
        life.listeners.clear();
        inner.core.context().forget_all();
        inner.listening.store(false, Ordering::SeqCst);
        drop(life);

        info!("Remote identity reset");
        inner
            .log()
            .info(LogSource::Remote, "Remote identity reset, listeners stopped");
        inner.emit_status();
    }

    /// Waits until every change handed to the workers so far is processed:
    /// pending debounced pushes go out, coalesced remote changes are applied.
    pub async fn flush(&self) {
        let (outbound, inbound) = {
            let life = self.inner.lifecycle.lock().await;
            (life.outbound_tx.clone(), life.inbound_tx.clone())
        };

        if let Some(tx) = outbound {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(OutboundMessage::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
        if let Some(tx) = inbound {
            let (done_tx, done_rx) = oneshot::channel();
            if tx.send(InboundMessage::Flush(done_tx)).is_ok() {
                let _ = done_rx.await;
            }
        }
    }

    /// Stops listening, pushes pending changes and stops every worker.
    pub async fn shutdown(&self) -> SyncResult<()> {
        if self.inner.lifecycle.lock().await.shut_down {
            return Ok(());
        }
        info!("Auto-sync shutting down");

        self.stop_listening().await;
        self.flush().await;

        let mut life = self.inner.lifecycle.lock().await;
        for tx in life.worker_shutdown.drain(..) {
            let _ = tx.send(()).await;
        }
        if let Some(worker) = life.retry_worker.take() {
            if let Err(e) = worker.shutdown().await {
                debug!(error = %e, "Retry worker already stopped");
            }
        }
        life.outbound_tx = None;
        life.inbound_tx = None;
        life.shut_down = true;
        self.inner.initialized.store(false, Ordering::SeqCst);
        drop(life);

        self.inner.emit_status();
        Ok(())
    }

    /// Runs `fut` with the apply flag set, so local writes it makes are not
    /// pushed back. The previous flag value is restored even if `fut`
    /// panics or is dropped.
    pub async fn apply_remote_update<F: Future>(&self, fut: F) -> F::Output {
        self.inner.apply_remote_update(fut).await
    }

    /// True while a remote update is being applied.
    pub fn is_applying_remote(&self) -> bool {
        self.inner.applying_remote.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status()
    }

    /// Installs a callback for sync failures, keeping the current emitter
    /// for status events.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&SyncFailure) + Send + Sync + 'static,
    {
        self.inner.core.context().emitter().set_error_callback(callback);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn core(&self) -> &Arc<SyncCore> {
        &self.inner.core
    }

    pub fn items(&self) -> &ItemSync {
        &self.inner.items
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        self.inner.core.registry()
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        self.inner.core.retry_queue()
    }

    pub fn sync_log(&self) -> &Arc<SyncLog> {
        self.inner.log()
    }

    pub fn metrics(&self) -> &Arc<RemoteMetrics> {
        self.inner.core.context().metrics()
    }

    pub fn device_id(&self) -> &str {
        self.inner.core.context().device_id()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.inner.store
    }
}

impl EngineInner {
    fn log(&self) -> &Arc<SyncLog> {
        self.core.context().log()
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn apply_remote_update<F: Future>(&self, fut: F) -> F::Output {
        let _guard = ApplyingRemoteGuard::set(&self.applying_remote);
        fut.await
    }

    fn status(&self) -> SyncStatus {
        let queue = self.core.retry_queue();
        let parked = queue.parked_count();
        let progress = self.progress();
        SyncStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            listening: self.listening.load(Ordering::SeqCst),
            pending_retries: queue.len().saturating_sub(parked),
            parked_retries: parked,
            last_sync: progress.last_sync,
            last_error: progress.last_error.clone(),
        }
    }

    fn emit_status(&self) {
        let status = self.status();
        self.core.context().emitter().emit_status(&status);
    }

    fn record_synced(&self) {
        self.progress().last_sync = Some(Utc::now());
    }

    fn record_error(&self, error: &SyncError) {
        self.progress().last_error = Some(error.to_string());
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Pushes one committed local change.
    async fn push_change(&self, change: OutboundChange) {
        let Some(strategy) = self.strategies.get(&change.collection) else {
            debug!(collection = %change.collection, "Change for unsynced collection ignored");
            return;
        };

        let result = match strategy {
            CollectionStrategy::Keyed(strategy) => {
                self.core
                    .push(strategy, change.value.as_ref(), Some(&change.key))
                    .await
            }
            CollectionStrategy::Singleton(strategy) => {
                if change.key != SINGLETON_KEY {
                    debug!(
                        collection = %change.collection,
                        key = %change.key,
                        "Singleton collection only syncs its root key"
                    );
                    return;
                }
                self.core.push(strategy, change.value.as_ref(), None).await
            }
            CollectionStrategy::Items(strategy) => match &change.value {
                Some(item) => self.items.push_item_with_id(strategy, &change.key, item).await,
                None => self.items.delete_item(strategy, &change.key).await,
            },
        };

        match result {
            Ok(PushOutcome::Written) => self.record_synced(),
            Ok(PushOutcome::Skipped) => {}
            Ok(PushOutcome::Queued { entry_id }) => {
                debug!(entry_id = %entry_id, "Local change queued for retry");
            }
            Err(e) => {
                warn!(
                    collection = %change.collection,
                    key = %change.key,
                    error = %e,
                    "Failed to push local change"
                );
                self.record_error(&e);
                self.core.context().emitter().emit_error(&SyncFailure {
                    entry_id: None,
                    collection: change.collection.clone(),
                    message: e.to_string(),
                    can_retry: false,
                });
            }
        }
        self.emit_status();
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Reconciles one remote envelope with the local store.
    async fn apply_inbound(&self, change: InboundChange) {
        let Some(spec) = self.config.collection(&change.collection) else {
            return;
        };
        let ctx = self.core.context();
        let retry = self.core.retry_queue();
        let known = ctx.known(&change.path);
        if known
            .as_ref()
            .is_some_and(|known| known.same_content(&change.envelope))
        {
            return;
        }
        // A queued push is this device's newest value for the path, even
        // though the remote never saw it.
        let local = retry.pending_payload(&change.path).or(known);

        let resolution = spec
            .policy
            .resolve(local.as_ref(), &change.envelope)
            .unwrap_or_else(|e| {
                warn!(path = %change.path, error = %e, "Conflict policy failed, using last-write-wins");
                ConflictPolicy::Lww
                    .resolve(local.as_ref(), &change.envelope)
                    .unwrap_or(Resolution::TakeRemote)
            });

        match resolution {
            // A change that fails to apply is not remembered, so the next
            // snapshot retries it.
            Resolution::TakeRemote => {
                if self
                    .apply_local(&change.collection, &change.key, change.envelope.data.clone())
                    .await
                {
                    retry.discard_path(&change.path);
                    ctx.remember(&change.path, change.envelope);
                }
            }
            Resolution::Merged(merged) => {
                if self
                    .apply_local(&change.collection, &change.key, Some(merged.clone()))
                    .await
                {
                    retry.discard_path(&change.path);
                    ctx.remember(&change.path, change.envelope);
                    self.push_change(OutboundChange {
                        collection: change.collection,
                        key: change.key,
                        value: Some(merged),
                    })
                    .await;
                }
            }
            Resolution::KeepLocal => {
                let Some(local) = local else {
                    return;
                };
                if local.data == change.envelope.data {
                    return;
                }
                // The remote now holds an older value than ours; write ours again.
                ctx.remember(&change.path, change.envelope);
                debug!(path = %change.path, "Remote holds stale value, repairing");
                self.push_change(OutboundChange {
                    collection: change.collection,
                    key: change.key,
                    value: local.data,
                })
                .await;
            }
        }
    }

    /// Writes remote data locally with the apply flag set.
    /// Returns false when the local store refused the write.
    async fn apply_local(&self, collection: &str, key: &str, data: Option<Value>) -> bool {
        let result = self
            .apply_remote_update(async {
                match data {
                    Some(value) => self.store.put(collection, key, value).await,
                    None => self.store.delete(collection, key).await.map(|_| ()),
                }
            })
            .await;

        match result {
            Ok(()) => {
                self.log()
                    .sync(LogSource::Remote, format!("Applied remote {}/{}", collection, key));
                self.record_synced();
                true
            }
            Err(e) => {
                let error = SyncError::ApplyFailed {
                    collection: collection.to_string(),
                    key: key.to_string(),
                    reason: e.to_string(),
                };
                warn!(error = %error, "Skipping remote change");
                self.log()
                    .error(LogSource::Local, "Failed to apply remote change", &error.to_string());
                self.record_error(&error);
                false
            }
        }
    }
}

/// Listener consumer that splits a snapshot into per-entity envelopes and
/// forwards the ones this device has not seen.
fn snapshot_consumer(
    ctx: Arc<SyncContext>,
    spec: &CollectionSpec,
    base: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
) -> Consumer {
    let collection = spec.name.clone();
    let singleton = spec.granularity == Granularity::Singleton;

    Arc::new(move |snapshot: Option<&Value>| {
        let nodes: Vec<(String, String, &Value)> = match snapshot {
            None => Vec::new(),
            Some(value) if singleton => vec![(SINGLETON_KEY.to_string(), base.clone(), value)],
            Some(Value::Object(children)) => children
                .iter()
                .map(|(key, node)| (key.clone(), format!("{}/{}", base, key), node))
                .collect(),
            Some(_) => {
                warn!(path = %base, "Collection snapshot is not an object");
                return Ok(());
            }
        };

        for (key, path, node) in nodes {
            let envelope = match RawEnvelope::from_value(&path, node.clone()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping malformed remote node");
                    ctx.log()
                        .error(LogSource::Remote, "Malformed remote node", &e.to_string());
                    continue;
                }
            };
            if envelope.is_from(ctx.device_id()) {
                continue;
            }
            if ctx
                .known(&path)
                .is_some_and(|known| known.same_content(&envelope))
            {
                continue;
            }

            let change = InboundChange {
                collection: collection.clone(),
                key,
                path,
                envelope,
            };
            if tx.send(InboundMessage::Change(change)).is_err() {
                return Err(SyncError::ChannelError("inbound worker gone".into()));
            }
        }
        Ok(())
    })
}

/// Sleeps until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Outbound Worker
// =============================================================================

struct OutboundWorker {
    engine: Arc<EngineInner>,
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
    shutdown_rx: mpsc::Receiver<()>,
    /// Debounced changes by `{collection}:{key}`, with their deadline.
    pending: HashMap<String, (Instant, OutboundChange)>,
}

impl OutboundWorker {
    async fn run(mut self) {
        info!("Outbound worker starting");

        loop {
            let deadline = self.pending.values().map(|(at, _)| *at).min();

            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(OutboundMessage::Change(change)) => self.accept(change).await,
                    Some(OutboundMessage::Flush(done)) => {
                        self.push_pending(None).await;
                        let _ = done.send(());
                    }
                    None => {
                        self.push_pending(None).await;
                        break;
                    }
                },

                _ = sleep_until_opt(deadline) => {
                    self.push_pending(Some(Instant::now())).await;
                }

                _ = self.shutdown_rx.recv() => {
                    self.push_pending(None).await;
                    break;
                }
            }
        }

        info!("Outbound worker stopped");
    }

    async fn accept(&mut self, change: OutboundChange) {
        let debounce: Option<Duration> = self
            .engine
            .config
            .collection(&change.collection)
            .and_then(CollectionSpec::debounce);

        match debounce {
            Some(window) => {
                let op = format!("{}:{}", change.collection, change.key);
                self.pending.insert(op, (Instant::now() + window, change));
            }
            None => self.engine.push_change(change).await,
        }
    }

    /// Pushes debounced changes due at `now` (all of them for `None`),
    /// oldest deadline first.
    async fn push_pending(&mut self, now: Option<Instant>) {
        let mut due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, (at, _))| now.map_or(true, |now| *at <= now))
            .map(|(op, _)| op.clone())
            .collect();
        due.sort_by_key(|op| self.pending.get(op).map(|(at, _)| *at));

        for op in due {
            if let Some((_, change)) = self.pending.remove(&op) {
                self.engine.push_change(change).await;
            }
        }
    }
}

// =============================================================================
// Inbound Worker
// =============================================================================

struct InboundWorker {
    engine: Arc<EngineInner>,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    shutdown_rx: mpsc::Receiver<()>,
    window: Duration,
    /// Coalesced changes by `{collection}:{key}`, in arrival order.
    batch: Vec<(String, InboundChange)>,
    deadline: Option<Instant>,
}

impl InboundWorker {
    async fn run(mut self) {
        info!("Inbound worker starting");

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(InboundMessage::Change(change)) => {
                        self.coalesce(change);
                        if self.window.is_zero() {
                            self.apply_batch().await;
                        }
                    }
                    Some(InboundMessage::Flush(done)) => {
                        self.apply_batch().await;
                        let _ = done.send(());
                    }
                    None => {
                        self.apply_batch().await;
                        break;
                    }
                },

                _ = sleep_until_opt(self.deadline) => {
                    self.apply_batch().await;
                }

                _ = self.shutdown_rx.recv() => {
                    self.apply_batch().await;
                    break;
                }
            }
        }

        info!("Inbound worker stopped");
    }

    fn coalesce(&mut self, change: InboundChange) {
        let op = format!("{}:{}", change.collection, change.key);
        match self.batch.iter_mut().find(|(existing, _)| *existing == op) {
            Some(slot) => slot.1 = change,
            None => self.batch.push((op, change)),
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.window);
        }
    }

    async fn apply_batch(&mut self) {
        self.deadline = None;
        let batch = std::mem::take(&mut self.batch);
        if batch.is_empty() {
            return;
        }
        debug!(changes = batch.len(), "Applying remote changes");
        for (_, change) in batch {
            self.engine.apply_inbound(change).await;
        }
        self.engine.emit_status();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use crate::retry::DrainSummary;
    use crate::sync_log::LogAction;
    use dayflow_db::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn engine(
        remote: &MemoryRemote,
        device: &str,
        collections: Vec<CollectionSpec>,
    ) -> (AutoSyncEngine, Arc<MemoryStore>) {
        let mut config = SyncConfig::default();
        config.collections = collections;
        config.instrumentation.persist_log = false;
        config.instrumentation.metrics_enabled = true;

        let store = Arc::new(MemoryStore::new());
        let engine = AutoSyncEngine::builder(config)
            .with_local_store(store.clone())
            .with_remote(Arc::new(remote.clone()))
            .with_device(DeviceIdentity::fixed(device).unwrap())
            .build()
            .await
            .unwrap();
        engine.initialize().await.unwrap();
        (engine, store)
    }

    fn applied_count(engine: &AutoSyncEngine) -> usize {
        engine
            .sync_log()
            .entries()
            .iter()
            .filter(|e| e.action == LogAction::Sync && e.message.starts_with("Applied remote"))
            .count()
    }

    #[test]
    fn test_range_start() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        assert_eq!(range_start(today, 7), "2024-02-24");
        assert_eq!(range_start(today, 0), "2024-03-02");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let remote = MemoryRemote::new();
        let (engine, store) = engine(&remote, "laptop", vec![CollectionSpec::items("templates")]).await;

        engine.initialize().await.unwrap();
        assert_eq!(store.observer_count("templates"), 1);
        assert!(engine.status().initialized);
    }

    #[tokio::test]
    async fn test_start_listening_is_idempotent() {
        let remote = MemoryRemote::new();
        let (engine, _store) = engine(
            &remote,
            "laptop",
            vec![
                CollectionSpec::items("templates"),
                CollectionSpec::keyed("energyLevels").with_lookback(7),
            ],
        )
        .await;

        engine.start_listening().await.unwrap();
        engine.start_listening().await.unwrap();
        assert_eq!(engine.registry().active_count(), 2);
        assert_eq!(remote.listener_count(), 2);
        assert!(engine.status().listening);
    }

    #[tokio::test]
    async fn test_listening_requires_initialize() {
        let remote = MemoryRemote::new();
        let mut config = SyncConfig::default();
        config.instrumentation.persist_log = false;
        let engine = AutoSyncEngine::builder(config)
            .with_local_store(Arc::new(MemoryStore::new()))
            .with_remote(Arc::new(remote.clone()))
            .build()
            .await
            .unwrap();

        assert!(engine.start_listening().await.is_err());
        assert!(engine.device_id().starts_with("device-"));
    }

    #[tokio::test]
    async fn test_local_write_is_pushed() {
        let remote = MemoryRemote::new();
        let (engine, store) = engine(&remote, "laptop", vec![CollectionSpec::singleton("gameState")]).await;

        store
            .put("gameState", SINGLETON_KEY, json!({"totalXp": 40}))
            .await
            .unwrap();
        engine.flush().await;

        let node = remote.peek("users/user/gameState").unwrap();
        assert_eq!(node["data"]["totalXp"], 40);
        assert_eq!(node["deviceId"], "laptop");
        assert!(engine.status().last_sync.is_some());
    }

    #[tokio::test]
    async fn test_apply_remote_update_does_not_push() {
        let remote = MemoryRemote::new();
        let (engine, store) = engine(&remote, "laptop", vec![CollectionSpec::items("globalInbox")]).await;

        assert!(!engine.is_applying_remote());
        engine
            .apply_remote_update(async {
                assert!(engine.is_applying_remote());
                store.put("globalInbox", "t1", json!({"id": "t1"})).await
            })
            .await
            .unwrap();
        assert!(!engine.is_applying_remote());

        engine.flush().await;
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_flag_restored_when_nested_or_failing() {
        let remote = MemoryRemote::new();
        let (engine, _store) = engine(&remote, "laptop", vec![]).await;

        engine
            .apply_remote_update(async {
                engine.apply_remote_update(async {}).await;
                assert!(engine.is_applying_remote());
            })
            .await;
        assert!(!engine.is_applying_remote());

        let result: Result<(), &str> = engine.apply_remote_update(async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(!engine.is_applying_remote());
    }

    #[tokio::test]
    async fn test_own_writes_are_not_applied_back() {
        let remote = MemoryRemote::new();
        let (engine, store) = engine(&remote, "laptop", vec![CollectionSpec::items("globalInbox")]).await;
        engine.start_listening().await.unwrap();

        store
            .put("globalInbox", "t1", json!({"id": "t1", "text": "walk"}))
            .await
            .unwrap();
        engine.flush().await;

        assert_eq!(remote.write_count(), 1);
        assert_eq!(applied_count(&engine), 0);
    }

    #[tokio::test]
    async fn test_remote_item_reaches_other_device() {
        let remote = MemoryRemote::new();
        let inbox = || vec![CollectionSpec::items("globalInbox")];
        let (laptop, laptop_store) = engine(&remote, "laptop", inbox()).await;
        let (phone, phone_store) = engine(&remote, "phone", inbox()).await;

        phone_store
            .put("globalInbox", "bread", json!({"id": "bread", "text": "buy bread"}))
            .await
            .unwrap();
        phone.flush().await;
        phone.start_listening().await.unwrap();
        laptop.start_listening().await.unwrap();
        laptop.flush().await;
        assert_eq!(
            laptop_store.get("globalInbox", "bread").await.unwrap(),
            Some(json!({"id": "bread", "text": "buy bread"}))
        );

        laptop_store
            .put("globalInbox", "milk", json!({"id": "milk", "text": "buy milk"}))
            .await
            .unwrap();
        laptop.flush().await;
        phone.flush().await;

        assert_eq!(
            phone_store.get("globalInbox", "milk").await.unwrap(),
            Some(json!({"id": "milk", "text": "buy milk"}))
        );
        assert_eq!(remote.peek("users/user/globalInbox/milk").unwrap()["deviceId"], "laptop");
        // bread from the phone, milk from the laptop, nothing echoed
        assert_eq!(remote.write_count(), 2);
        assert_eq!(applied_count(&phone), 1);
    }

    #[tokio::test]
    async fn test_older_offline_edit_is_not_pushed_after_reconnect() {
        let remote = MemoryRemote::new();
        let inbox = || vec![CollectionSpec::items("globalInbox")];
        let (laptop, laptop_store) = engine(&remote, "laptop", inbox()).await;
        let (phone, phone_store) = engine(&remote, "phone", inbox()).await;
        let path = "users/user/globalInbox/t1";

        remote.set_offline(true);
        phone_store
            .put("globalInbox", "t1", json!({"id": "t1", "text": "old"}))
            .await
            .unwrap();
        phone.flush().await;
        assert_eq!(phone.retry_queue().len(), 1);
        remote.set_offline(false);
        tokio::time::sleep(Duration::from_millis(5)).await;

        laptop_store
            .put("globalInbox", "t1", json!({"id": "t1", "text": "buy milk"}))
            .await
            .unwrap();
        laptop.flush().await;
        assert_eq!(remote.write_count(), 1);

        phone.start_listening().await.unwrap();
        phone.flush().await;
        assert_eq!(
            phone_store.get("globalInbox", "t1").await.unwrap(),
            Some(json!({"id": "t1", "text": "buy milk"}))
        );
        assert!(phone.retry_queue().is_empty());

        assert_eq!(phone.retry_queue().drain().await, DrainSummary::default());
        assert_eq!(remote.peek(path).unwrap()["data"]["text"], "buy milk");
        assert_eq!(remote.peek(path).unwrap()["deviceId"], "laptop");
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test]
    async fn test_newer_offline_edit_wins_after_reconnect() {
        let remote = MemoryRemote::new();
        let inbox = || vec![CollectionSpec::items("globalInbox")];
        let (laptop, laptop_store) = engine(&remote, "laptop", inbox()).await;
        let (phone, phone_store) = engine(&remote, "phone", inbox()).await;
        let path = "users/user/globalInbox/t1";

        laptop_store
            .put("globalInbox", "t1", json!({"id": "t1", "text": "buy bread"}))
            .await
            .unwrap();
        laptop.flush().await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        remote.set_offline(true);
        phone_store
            .put("globalInbox", "t1", json!({"id": "t1", "text": "buy milk"}))
            .await
            .unwrap();
        phone.flush().await;
        remote.set_offline(false);

        // The older remote value must not replace the queued local edit
        phone.start_listening().await.unwrap();
        phone.flush().await;
        assert_eq!(
            phone_store.get("globalInbox", "t1").await.unwrap(),
            Some(json!({"id": "t1", "text": "buy milk"}))
        );
        assert!(phone.retry_queue().is_empty());
        assert_eq!(remote.peek(path).unwrap()["data"]["text"], "buy milk");
        assert_eq!(remote.peek(path).unwrap()["deviceId"], "phone");
        assert_eq!(remote.write_count(), 2);

        laptop.start_listening().await.unwrap();
        laptop.flush().await;
        assert_eq!(
            laptop_store.get("globalInbox", "t1").await.unwrap(),
            Some(json!({"id": "t1", "text": "buy milk"}))
        );
    }

    #[tokio::test]
    async fn test_remote_delete_removes_local_row() {
        let remote = MemoryRemote::new();
        let inbox = || vec![CollectionSpec::items("globalInbox")];
        let (laptop, laptop_store) = engine(&remote, "laptop", inbox()).await;
        let (phone, phone_store) = engine(&remote, "phone", inbox()).await;
        phone.start_listening().await.unwrap();

        laptop_store
            .put("globalInbox", "t1", json!({"id": "t1"}))
            .await
            .unwrap();
        laptop.flush().await;
        phone.flush().await;
        assert!(phone_store.get("globalInbox", "t1").await.unwrap().is_some());

        laptop_store.delete("globalInbox", "t1").await.unwrap();
        laptop.flush().await;
        phone.flush().await;

        assert!(remote.peek("users/user/globalInbox/t1").unwrap()["data"].is_null());
        assert!(phone_store.get("globalInbox", "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_rows_are_merged_and_pushed_back() {
        let remote = MemoryRemote::new();
        let daily = || {
            vec![CollectionSpec::keyed("dailyData").with_policy(ConflictPolicy::MergeRows {
                field: Some("tasks".into()),
            })]
        };
        let (laptop, laptop_store) = engine(&remote, "laptop", daily()).await;
        let (phone, phone_store) = engine(&remote, "phone", daily()).await;
        phone.start_listening().await.unwrap();

        phone_store
            .put(
                "dailyData",
                "2024-06-01",
                json!({"tasks": [{"id": "p1", "createdAt": 1}]}),
            )
            .await
            .unwrap();
        phone.flush().await;

        // The laptop never saw the phone's row and overwrites the node.
        laptop_store
            .put(
                "dailyData",
                "2024-06-01",
                json!({"tasks": [{"id": "l1", "createdAt": 2}]}),
            )
            .await
            .unwrap();
        laptop.flush().await;
        phone.flush().await;

        let local = phone_store.get("dailyData", "2024-06-01").await.unwrap().unwrap();
        assert_eq!(local["tasks"].as_array().unwrap().len(), 2);

        let node = remote.peek("users/user/dailyData/2024-06-01").unwrap();
        assert_eq!(node["data"]["tasks"].as_array().unwrap().len(), 2);
        assert_eq!(node["deviceId"], "phone");
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_collection_pushes_last_change() {
        let remote = MemoryRemote::new();
        let (_engine, store) = engine(
            &remote,
            "laptop",
            vec![CollectionSpec::keyed("tokenUsage").with_debounce(2000)],
        )
        .await;

        for tokens in [10, 20, 30] {
            store
                .put("tokenUsage", "2024-06-01", json!({"tokens": tokens}))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(remote.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(remote.write_count(), 1);
        let node = remote.peek("users/user/tokenUsage/2024-06-01").unwrap();
        assert_eq!(node["data"]["tokens"], 30);
    }

    #[tokio::test]
    async fn test_apply_failure_is_logged_and_skipped() {
        let remote = MemoryRemote::new();
        let specs = || {
            vec![
                CollectionSpec::items("templates"),
                CollectionSpec::items("shopItems"),
            ]
        };
        let (laptop, laptop_store) = engine(&remote, "laptop", specs()).await;
        let (phone, phone_store) = engine(&remote, "phone", specs()).await;
        phone.start_listening().await.unwrap();
        phone_store.fail_writes("templates");

        laptop_store
            .put("templates", "t1", json!({"id": "t1"}))
            .await
            .unwrap();
        laptop_store
            .put("shopItems", "s1", json!({"id": "s1"}))
            .await
            .unwrap();
        laptop.flush().await;
        phone.flush().await;

        assert!(phone_store.get("shopItems", "s1").await.unwrap().is_some());
        assert!(phone_store.get("templates", "t1").await.unwrap().is_none());
        assert!(phone.status().last_error.unwrap().contains("templates/t1"));
    }

    #[tokio::test]
    async fn test_push_failure_reaches_error_callback() {
        let remote = MemoryRemote::new();
        let (engine, store) = engine(&remote, "laptop", vec![CollectionSpec::items("templates")]).await;
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        engine.set_error_callback(move |failure| {
            assert!(!failure.can_retry);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Not a valid path segment, so the push fails outright.
        store
            .put("templates", "bad.id", json!({"id": "bad.id"}))
            .await
            .unwrap();
        engine.flush().await;

        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_remote_identity_stops_listeners() {
        let remote = MemoryRemote::new();
        let (engine, _store) = engine(&remote, "laptop", vec![CollectionSpec::items("templates")]).await;
        engine.start_listening().await.unwrap();

        engine.reset_remote_identity().await;
        assert_eq!(engine.registry().active_count(), 0);
        assert!(!engine.status().listening);

        engine.start_listening().await.unwrap();
        assert_eq!(engine.registry().active_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_is_final() {
        let remote = MemoryRemote::new();
        let (engine, store) = engine(
            &remote,
            "laptop",
            vec![CollectionSpec::keyed("chatHistory").with_debounce(60_000)],
        )
        .await;
        engine.start_listening().await.unwrap();

        store
            .put("chatHistory", "2024-06-01", json!({"messages": []}))
            .await
            .unwrap();
        engine.shutdown().await.unwrap();

        assert_eq!(remote.write_count(), 1);
        assert_eq!(remote.listener_count(), 0);
        assert!(matches!(engine.initialize().await, Err(SyncError::ShuttingDown)));
        assert!(!engine.status().initialized);
    }
}
