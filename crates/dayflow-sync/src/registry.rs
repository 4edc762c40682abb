//! # Listener Registry
//!
//! Shares one remote subscription per listener key between any number of
//! consumers.
//!
//! ## Arena Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        ListenerRegistry                                 │
//! │                                                                         │
//! │  ListenerKey { path, start_at }          Entry                         │
//! │  ──────────────────────────────          ─────                         │
//! │  (users/u/templates, None)        ──►    consumers: [c1, c4, c9]       │
//! │                                          subscription: Some(..)  ◄── 1 │
//! │                                          last_value: {...}             │
//! │                                                                         │
//! │  (users/u/dailyData, "2024-06-01") ──►   consumers: [c2]               │
//! │                                          subscription: Some(..)        │
//! │                                                                         │
//! │  attach       first consumer opens the subscription                    │
//! │               later consumers get the cached snapshot immediately      │
//! │  event        fan-out to every consumer; a failing consumer is logged  │
//! │               and skipped, the others still run                        │
//! │  detach       last consumer out closes the subscription                │
//! │  stop_all     closes everything; outstanding handles become no-ops    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Consumer ids are unique for the life of the process, so a handle that
//! outlives its entry (after `stop_all`) can never detach someone else.
//!
//! The arena lock is never held while awaiting the remote or while calling
//! a consumer.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use dayflow_core::paths::key_range_identity;

use crate::error::{SyncError, SyncResult};
use crate::metrics::{estimate_snapshot_bytes, RemoteMetrics};
use crate::remote::{RemoteEvent, RemoteHandler, RemoteQuery, RemoteStore, Subscription};

/// Consumer callback. Receives the latest snapshot (`None` when absent).
pub type Consumer = Arc<dyn Fn(Option<&Value>) -> SyncResult<()> + Send + Sync>;

/// Process-unique consumer identifier.
pub type ConsumerId = u64;

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Listener Key
// =============================================================================

/// Identity of a shared listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    pub path: String,
    pub start_at: Option<String>,
}

impl ListenerKey {
    /// Plain value listener on `path`.
    pub fn value(path: impl Into<String>) -> Self {
        ListenerKey {
            path: path.into(),
            start_at: None,
        }
    }

    /// Key-range listener on `path` starting at `start_at`.
    pub fn range(path: impl Into<String>, start_at: impl Into<String>) -> Self {
        ListenerKey {
            path: path.into(),
            start_at: Some(start_at.into()),
        }
    }

    fn query(&self) -> RemoteQuery {
        RemoteQuery {
            start_at: self.start_at.clone(),
        }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start_at {
            Some(start) => f.write_str(&key_range_identity(&self.path, start)),
            None => f.write_str(&self.path),
        }
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Progress of an entry's remote subscription.
#[derive(Debug, Clone)]
enum OpenState {
    Opening,
    Open,
    Failed(SyncError),
}

struct Entry {
    consumers: Vec<(ConsumerId, Consumer)>,
    subscription: Option<Subscription>,
    /// Consumers that join while the subscription is opening wait on this.
    opened: watch::Sender<OpenState>,
    /// `None` until the first snapshot arrives.
    last_value: Option<Option<Value>>,
    /// Distinguishes this entry from a later one under the same key.
    generation: u64,
}

impl Entry {
    fn ref_count(&self) -> usize {
        self.consumers.len()
    }
}

struct Shared {
    entries: Mutex<HashMap<ListenerKey, Entry>>,
    metrics: Arc<RemoteMetrics>,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<ListenerKey, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn detach(&self, key: &ListenerKey, consumer: ConsumerId) {
        let closed = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };

            let before = entry.consumers.len();
            entry.consumers.retain(|(id, _)| *id != consumer);
            if entry.consumers.len() == before {
                return;
            }
            self.metrics.record_detach(&key.path);

            if entry.consumers.is_empty() {
                entries.remove(key).and_then(|entry| entry.subscription)
            } else {
                debug!(key = %key, ref_count = entry.ref_count(), "Listener consumer detached");
                return;
            }
        };

        // Cancel outside the arena lock
        if let Some(subscription) = closed {
            subscription.cancel();
        }
        debug!(key = %key, "Last consumer detached, remote listener closed");
    }

    fn fan_out(&self, key: &ListenerKey, generation: u64, event: RemoteEvent) {
        let value = match event {
            RemoteEvent::Value(value) => value,
            RemoteEvent::Error(message) => {
                warn!(key = %key, error = %message, "Remote listener cancelled by remote");
                self.metrics.record_error(&key.path);
                return;
            }
        };

        let consumers: Vec<(ConsumerId, Consumer)> = {
            let mut entries = self.entries();
            match entries.get_mut(key) {
                Some(entry) if entry.generation == generation => {
                    entry.last_value = Some(value.clone());
                    entry.consumers.clone()
                }
                _ => return,
            }
        };

        self.metrics
            .record_event(&key.path, estimate_snapshot_bytes(value.as_ref()));

        for (id, consumer) in consumers {
            call_consumer(&self.metrics, key, id, &consumer, value.as_ref());
        }
    }
}

/// Runs one consumer, containing errors and panics.
fn call_consumer(
    metrics: &RemoteMetrics,
    key: &ListenerKey,
    id: ConsumerId,
    consumer: &Consumer,
    value: Option<&Value>,
) {
    match catch_unwind(AssertUnwindSafe(|| consumer(value))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(key = %key, consumer = id, error = %e, "Listener consumer failed");
            metrics.record_error(&key.path);
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            error!(key = %key, consumer = id, reason = %reason, "Listener consumer panicked");
            metrics.record_error(&key.path);
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Refcounted remote listener registry.
pub struct ListenerRegistry {
    remote: Arc<dyn RemoteStore>,
    shared: Arc<Shared>,
}

impl ListenerRegistry {
    /// Creates a registry over `remote`.
    pub fn new(remote: Arc<dyn RemoteStore>, metrics: Arc<RemoteMetrics>) -> Self {
        ListenerRegistry {
            remote,
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                metrics,
            }),
        }
    }

    /// Attaches a consumer to the value listener on `path`.
    pub async fn attach(&self, path: &str, consumer: Consumer) -> SyncResult<ListenerHandle> {
        self.attach_key(ListenerKey::value(path), consumer).await
    }

    /// Attaches a consumer to the key-range listener `(path, start_at)`.
    pub async fn attach_range(
        &self,
        path: &str,
        start_at: &str,
        consumer: Consumer,
    ) -> SyncResult<ListenerHandle> {
        self.attach_key(ListenerKey::range(path, start_at), consumer)
            .await
    }

    /// Attaches a consumer to an arbitrary listener key.
    pub async fn attach_key(
        &self,
        key: ListenerKey,
        consumer: Consumer,
    ) -> SyncResult<ListenerHandle> {
        let id = NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed);
        self.shared.metrics.record_attach(&key.path);

        // Join an existing entry, or reserve a new one
        let joined = {
            let mut entries = self.shared.entries();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.consumers.push((id, consumer.clone()));
                    debug!(key = %key, ref_count = entry.ref_count(), "Joined existing listener");
                    Some((entry.last_value.clone(), entry.opened.subscribe()))
                }
                None => {
                    let (opened, _) = watch::channel(OpenState::Opening);
                    entries.insert(
                        key.clone(),
                        Entry {
                            consumers: vec![(id, consumer.clone())],
                            subscription: None,
                            opened,
                            last_value: None,
                            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
                        },
                    );
                    None
                }
            }
        };

        let handle = ListenerHandle {
            shared: Arc::downgrade(&self.shared),
            key: key.clone(),
            consumer: id,
            detached: AtomicBool::new(false),
        };

        if let Some((cached, mut opened)) = joined {
            // Share the first consumer's open result. A closed channel means
            // the entry was stopped, which leaves this handle stale.
            let state = opened
                .wait_for(|state| !matches!(state, OpenState::Opening))
                .await
                .map(|state| (*state).clone());
            if let Ok(OpenState::Failed(e)) = state {
                debug!(key = %key, consumer = id, "Listener failed to open before join completed");
                return Err(e);
            }
            if let Some(value) = cached {
                call_consumer(&self.shared.metrics, &key, id, &consumer, value.as_ref());
            }
            return Ok(handle);
        }

        self.open(&key).await?;
        Ok(handle)
    }

    /// Opens the remote subscription for a freshly reserved entry.
    async fn open(&self, key: &ListenerKey) -> SyncResult<()> {
        let generation = match self.shared.entries().get(key) {
            Some(entry) => entry.generation,
            None => return Ok(()),
        };

        let weak = Arc::downgrade(&self.shared);
        let handler_key = key.clone();
        let handler: RemoteHandler = Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.fan_out(&handler_key, generation, event);
            }
        });

        match self.remote.subscribe(&key.path, key.query(), handler).await {
            Ok(subscription) => {
                let mut entries = self.shared.entries();
                match entries.get_mut(key) {
                    Some(entry) if entry.generation == generation => {
                        entry.subscription = Some(subscription);
                        entry.opened.send_replace(OpenState::Open);
                        info!(key = %key, "Remote listener opened");
                    }
                    _ => {
                        // Every consumer left while the subscription was opening
                        drop(entries);
                        subscription.cancel();
                        debug!(key = %key, "Listener abandoned before it opened");
                    }
                }
                Ok(())
            }
            Err(e) => {
                {
                    let mut entries = self.shared.entries();
                    if entries.get(key).map(|entry| entry.generation) == Some(generation) {
                        if let Some(entry) = entries.remove(key) {
                            entry.opened.send_replace(OpenState::Failed(e.clone()));
                        }
                    }
                }
                self.shared.metrics.record_error(&key.path);
                warn!(key = %key, error = %e, "Failed to open remote listener");
                Err(e)
            }
        }
    }

    /// Closes every listener. Outstanding handles become no-ops.
    pub fn stop_all(&self) {
        let drained: Vec<(ListenerKey, Entry)> = self.shared.entries().drain().collect();
        let count = drained.len();

        for (key, entry) in drained {
            for _ in 0..entry.ref_count() {
                self.shared.metrics.record_detach(&key.path);
            }
            if let Some(subscription) = entry.subscription {
                subscription.cancel();
            }
        }

        info!(count, "All remote listeners stopped");
    }

    /// Number of live listener entries.
    pub fn active_count(&self) -> usize {
        self.shared.entries().len()
    }

    /// Number of consumers on one key.
    pub fn consumer_count(&self, key: &ListenerKey) -> usize {
        self.shared.entries().get(key).map_or(0, Entry::ref_count)
    }

    /// Keys of all live entries.
    pub fn keys(&self) -> Vec<ListenerKey> {
        self.shared.entries().keys().cloned().collect()
    }

    /// The metrics sink this registry records into.
    pub fn metrics(&self) -> &Arc<RemoteMetrics> {
        &self.shared.metrics
    }
}

// =============================================================================
// Handle
// =============================================================================

/// A consumer's attachment. Detaches on [`unsubscribe`](Self::unsubscribe)
/// or on drop.
pub struct ListenerHandle {
    shared: Weak<Shared>,
    key: ListenerKey,
    consumer: ConsumerId,
    detached: AtomicBool,
}

impl ListenerHandle {
    /// Detaches this consumer. Idempotent.
    pub fn unsubscribe(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.detach(&self.key, self.consumer);
        }
    }

    /// The listener this handle is attached to.
    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("key", &self.key)
            .field("consumer", &self.consumer)
            .finish()
    }
}

/// Wraps an infallible closure as a [`Consumer`].
pub fn consumer<F>(f: F) -> Consumer
where
    F: Fn(Option<&Value>) + Send + Sync + 'static,
{
    Arc::new(move |value| {
        f(value);
        Ok(())
    })
}

/// Error used by consumers that reject a snapshot.
pub fn consumer_error(reason: impl Into<String>) -> SyncError {
    SyncError::ConsumerFailed(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn setup() -> (MemoryRemote, ListenerRegistry) {
        let remote = MemoryRemote::new();
        let registry =
            ListenerRegistry::new(Arc::new(remote.clone()), Arc::new(RemoteMetrics::new(true)));
        (remote, registry)
    }

    fn counter() -> (Consumer, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (
            consumer(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
            hits,
        )
    }

    #[tokio::test]
    async fn test_refcount_three_consumers_one_subscription() {
        let (remote, registry) = setup();
        let key = ListenerKey::value("users/u/templates");

        let (c1, _) = counter();
        let (c2, _) = counter();
        let (c3, hits3) = counter();
        let h1 = registry.attach("users/u/templates", c1).await.unwrap();
        let h2 = registry.attach("users/u/templates", c2).await.unwrap();
        let h3 = registry.attach("users/u/templates", c3).await.unwrap();

        assert_eq!(remote.listener_count(), 1);
        assert_eq!(registry.consumer_count(&key), 3);

        h1.unsubscribe();
        h2.unsubscribe();
        assert_eq!(remote.listener_count(), 1);
        assert_eq!(registry.consumer_count(&key), 1);

        remote
            .write("users/u/templates/t1", Some(json!({"name": "A"})))
            .await
            .unwrap();
        // initial snapshot (cached on join) + one change
        assert_eq!(hits3.load(Ordering::SeqCst), 2);

        drop(h3);
        assert_eq!(remote.listener_count(), 0);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_late_joiner_receives_cached_value() {
        let (remote, registry) = setup();
        remote.write("users/u/gameState", Some(json!({"xp": 5}))).await.unwrap();

        let (c1, _) = counter();
        let _h1 = registry.attach("users/u/gameState", c1).await.unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let _h2 = registry
            .attach(
                "users/u/gameState",
                consumer(move |v| *sink.lock().unwrap() = v.cloned()),
            )
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(json!({"xp": 5})));
        assert_eq!(remote.read_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_consumers_are_isolated() {
        let (remote, registry) = setup();
        let failing: Consumer = Arc::new(|_| Err(consumer_error("bad shape")));
        let panicking: Consumer = Arc::new(|v| {
            if v.is_some() {
                panic!("consumer bug");
            }
            Ok(())
        });
        let (healthy, hits) = counter();

        let _a = registry.attach("p", failing).await.unwrap();
        let _b = registry.attach("p", panicking).await.unwrap();
        let _c = registry.attach("p", healthy).await.unwrap();

        remote.write("p", Some(json!(1))).await.unwrap();
        remote.write("p", Some(json!(2))).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(registry.metrics().path("p").unwrap().errors >= 3);
    }

    #[tokio::test]
    async fn test_range_keys_are_distinct() {
        let (remote, registry) = setup();
        let (c1, _) = counter();
        let (c2, _) = counter();
        let _a = registry.attach_range("users/u/dailyData", "2024-06-01", c1).await.unwrap();
        let _b = registry.attach_range("users/u/dailyData", "2024-06-08", c2).await.unwrap();

        assert_eq!(registry.active_count(), 2);
        assert_eq!(remote.listener_count(), 2);
        assert!(registry
            .keys()
            .iter()
            .any(|k| k.to_string() == "users/u/dailyData?orderByKey&startAt=2024-06-01"));
    }

    #[tokio::test]
    async fn test_stop_all_makes_handles_stale() {
        let (remote, registry) = setup();
        let (c1, _) = counter();
        let (c2, _) = counter();
        let stale = registry.attach("a", c1).await.unwrap();
        let _b = registry.attach("b", c2).await.unwrap();

        registry.stop_all();
        assert_eq!(registry.active_count(), 0);
        assert_eq!(remote.listener_count(), 0);

        // A fresh attach on the same key is not affected by the stale handle
        let (c3, _) = counter();
        let _fresh = registry.attach("a", c3).await.unwrap();
        drop(stale);
        assert_eq!(registry.consumer_count(&ListenerKey::value("a")), 1);
        assert_eq!(remote.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_removes_entry() {
        let (remote, registry) = setup();
        remote.set_offline(true);
        let (c1, _) = counter();
        assert!(registry.attach("a", c1).await.is_err());
        assert_eq!(registry.active_count(), 0);
    }

    /// Remote whose subscribe takes a while and then optionally fails.
    struct SlowRemote {
        inner: MemoryRemote,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl RemoteStore for SlowRemote {
        async fn write(&self, path: &str, value: Option<Value>) -> SyncResult<()> {
            self.inner.write(path, value).await
        }

        async fn read(&self, path: &str) -> SyncResult<Option<Value>> {
            self.inner.read(path).await
        }

        async fn subscribe(
            &self,
            path: &str,
            query: RemoteQuery,
            handler: RemoteHandler,
        ) -> SyncResult<Subscription> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(SyncError::Disconnected);
            }
            self.inner.subscribe(path, query, handler).await
        }
    }

    fn slow_setup(fail: bool) -> (MemoryRemote, Arc<ListenerRegistry>) {
        let inner = MemoryRemote::new();
        let remote = SlowRemote {
            inner: inner.clone(),
            delay: Duration::from_millis(50),
            fail,
        };
        let registry = ListenerRegistry::new(Arc::new(remote), Arc::new(RemoteMetrics::new(true)));
        (inner, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_joiner_sees_failed_open() {
        let (_inner, registry) = slow_setup(true);
        let (c1, _) = counter();
        let (c2, hits2) = counter();

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.attach("a", c1).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.consumer_count(&ListenerKey::value("a")), 1);

        let second = registry.attach("a", c2).await;
        assert!(matches!(second, Err(SyncError::Disconnected)));
        assert!(first.await.unwrap().is_err());
        assert_eq!(registry.active_count(), 0);
        assert_eq!(hits2.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_joiner_waits_for_open() {
        let (inner, registry) = slow_setup(false);
        inner.write("g", Some(json!({"xp": 1}))).await.unwrap();
        let (c1, hits1) = counter();
        let (c2, hits2) = counter();

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.attach("g", c1).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = registry.attach("g", c2).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(inner.listener_count(), 1);
        assert_eq!(registry.consumer_count(second.key()), 2);
        // Both got the initial snapshot exactly once
        assert_eq!(hits1.load(Ordering::SeqCst), 1);
        assert_eq!(hits2.load(Ordering::SeqCst), 1);

        drop(first);
        drop(second);
        assert_eq!(inner.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let (remote, registry) = setup();
        let (c1, _) = counter();
        let handle = registry.attach("m", c1).await.unwrap();
        remote.write("m", Some(json!({"k": "v"}))).await.unwrap();
        handle.unsubscribe();

        let m = registry.metrics().path("m").unwrap();
        assert_eq!(m.attaches, 1);
        assert_eq!(m.detaches, 1);
        assert_eq!(m.events, 2);
        assert!(m.read_bytes > 0);
    }
}
