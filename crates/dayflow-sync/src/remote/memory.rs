//! # In-Memory Remote
//!
//! A JSON tree implementing [`RemoteStore`] in-process. Used by tests, by
//! single-process setups, and as the tree the relay server hosts.
//!
//! ## Notification Rules
//! ```text
//! write("users/u/dailyData/2024-06-01", v)
//!
//!   listener "users/u"                          ✓ (ancestor)
//!   listener "users/u/dailyData"                ✓ (ancestor)
//!   listener "users/u/dailyData/2024-06-01"     ✓ (same node)
//!   listener "users/u/dailyData/2024-06-01/x"   ✓ (descendant)
//!   listener "users/u/templates"                ✗ (unrelated)
//! ```
//!
//! A listener is only called when its own snapshot actually changed.
//! Handlers run outside the state lock, in write order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use super::{filter_start_at, segments, RemoteEvent, RemoteHandler, RemoteQuery, RemoteStore, Subscription};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// State
// =============================================================================

struct Listener {
    path: Vec<String>,
    start_at: Option<String>,
    handler: RemoteHandler,
    last: Option<Value>,
    active: Arc<AtomicBool>,
}

impl Listener {
    fn snapshot(&self, root: &Map<String, Value>) -> Option<Value> {
        let segs: Vec<&str> = self.path.iter().map(String::as_str).collect();
        filter_start_at(get_at(root, &segs).cloned(), self.start_at.as_deref())
    }
}

#[derive(Default)]
struct State {
    root: Map<String, Value>,
    listeners: HashMap<u64, Listener>,
    next_id: u64,
    fail_writes: u32,
    offline: bool,
    writes: u64,
    reads: u64,
}

type Delivery = (RemoteHandler, Arc<AtomicBool>, RemoteEvent);

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    /// Serializes handler delivery so listeners see changes in write order.
    delivery: Mutex<()>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for (handler, active, event) in deliveries {
        if active.load(Ordering::SeqCst) {
            handler(event);
        }
    }
}

// =============================================================================
// Memory Remote
// =============================================================================

/// In-process remote tree.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
}

impl MemoryRemote {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` writes with [`SyncError::RemoteUnavailable`].
    pub fn fail_next_writes(&self, n: u32) {
        self.shared.state().fail_writes = n;
    }

    /// Simulates losing (or regaining) connectivity. While offline every
    /// operation fails with [`SyncError::Disconnected`].
    pub fn set_offline(&self, offline: bool) {
        self.shared.state().offline = offline;
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.shared.state().writes
    }

    /// Number of successful reads.
    pub fn read_count(&self) -> u64 {
        self.shared.state().reads
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.state().listeners.len()
    }

    /// Copy of the node at `path` without counting a read.
    pub fn peek(&self, path: &str) -> Option<Value> {
        get_at(&self.shared.state().root, &segments(path)).cloned()
    }

    /// Cancels every listener at or under `path_prefix`, sending each an
    /// [`RemoteEvent::Error`] first.
    pub fn revoke_listeners(&self, path_prefix: &str, reason: &str) {
        let _order = self.shared.delivery();
        let prefix = segments(path_prefix);

        let deliveries: Vec<Delivery> = {
            let mut state = self.shared.state();
            let revoked: Vec<u64> = state
                .listeners
                .iter()
                .filter(|(_, l)| l.path.iter().map(String::as_str).collect::<Vec<_>>().starts_with(&prefix))
                .map(|(id, _)| *id)
                .collect();

            revoked
                .into_iter()
                .filter_map(|id| state.listeners.remove(&id))
                .map(|l| {
                    let active = l.active.clone();
                    (l.handler, active, RemoteEvent::Error(reason.to_string()))
                })
                .collect()
        };

        debug!(path = %path_prefix, count = deliveries.len(), "Revoking remote listeners");
        deliver(deliveries);
    }

    fn check_online(state: &State) -> SyncResult<()> {
        if state.offline {
            return Err(SyncError::Disconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn write(&self, path: &str, value: Option<Value>) -> SyncResult<()> {
        let segs = segments(path);
        if segs.is_empty() {
            return Err(SyncError::InvalidPath("cannot write the tree root".into()));
        }

        let _order = self.shared.delivery();
        let deliveries: Vec<Delivery> = {
            let mut state = self.shared.state();
            Self::check_online(&state)?;
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(SyncError::RemoteUnavailable("injected write failure".into()));
            }

            match value {
                Some(Value::Null) | None => remove_at(&mut state.root, &segs),
                Some(value) => set_at(&mut state.root, &segs, value),
            }
            state.writes += 1;

            let State {
                root, listeners, ..
            } = &mut *state;

            listeners
                .values_mut()
                .filter(|l| related(&l.path, &segs))
                .filter_map(|l| {
                    let snapshot = l.snapshot(root);
                    if snapshot == l.last {
                        return None;
                    }
                    l.last = snapshot.clone();
                    Some((l.handler.clone(), l.active.clone(), RemoteEvent::Value(snapshot)))
                })
                .collect()
        };

        trace!(path = %path, notified = deliveries.len(), "Remote write applied");
        deliver(deliveries);
        Ok(())
    }

    async fn read(&self, path: &str) -> SyncResult<Option<Value>> {
        let mut state = self.shared.state();
        Self::check_online(&state)?;
        state.reads += 1;
        Ok(get_at(&state.root, &segments(path)).cloned())
    }

    async fn subscribe(
        &self,
        path: &str,
        query: RemoteQuery,
        handler: RemoteHandler,
    ) -> SyncResult<Subscription> {
        let _order = self.shared.delivery();
        let active = Arc::new(AtomicBool::new(true));

        let (id, initial) = {
            let mut state = self.shared.state();
            Self::check_online(&state)?;

            let id = state.next_id;
            state.next_id += 1;

            let mut listener = Listener {
                path: segments(path).into_iter().map(str::to_string).collect(),
                start_at: query.start_at,
                handler: handler.clone(),
                last: None,
                active: active.clone(),
            };
            listener.last = listener.snapshot(&state.root);
            let initial = listener.last.clone();
            state.listeners.insert(id, listener);
            (id, initial)
        };

        debug!(path = %path, id, "Remote listener added");
        deliver(vec![(handler, active.clone(), RemoteEvent::Value(initial))]);

        let shared = self.shared.clone();
        Ok(Subscription::new(move || {
            active.store(false, Ordering::SeqCst);
            shared.state().listeners.remove(&id);
        }))
    }
}

// =============================================================================
// Tree Operations
// =============================================================================

fn related(listener: &[String], written: &[&str]) -> bool {
    listener
        .iter()
        .zip(written.iter())
        .all(|(a, b)| a.as_str() == *b)
}

fn get_at<'a>(root: &'a Map<String, Value>, segs: &[&str]) -> Option<&'a Value> {
    let (first, rest) = segs.split_first()?;
    rest.iter()
        .try_fold(root.get(*first)?, |node, seg| node.get(*seg))
}

fn set_at(map: &mut Map<String, Value>, segs: &[&str], value: Value) {
    let Some((first, rest)) = segs.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert(first.to_string(), value);
        return;
    }

    let child = map
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(child) = child {
        set_at(child, rest, value);
    }
}

/// Removes a node and prunes parents left empty.
fn remove_at(map: &mut Map<String, Value>, segs: &[&str]) {
    let Some((first, rest)) = segs.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.remove(*first);
        return;
    }

    let now_empty = match map.get_mut(*first) {
        Some(Value::Object(child)) => {
            remove_at(child, rest);
            child.is_empty()
        }
        _ => false,
    };
    if now_empty {
        map.remove(*first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (RemoteHandler, Arc<Mutex<Vec<RemoteEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handler: RemoteHandler = Arc::new(move |event| sink.lock().unwrap().push(event));
        (handler, events)
    }

    #[tokio::test]
    async fn test_write_read_remove_prunes() {
        let remote = MemoryRemote::new();
        remote
            .write("users/u/dailyData/d1", Some(json!({"n": 1})))
            .await
            .unwrap();
        assert_eq!(
            remote.read("users/u/dailyData").await.unwrap(),
            Some(json!({"d1": {"n": 1}}))
        );

        remote.write("users/u/dailyData/d1", None).await.unwrap();
        assert_eq!(remote.read("users/u/dailyData").await.unwrap(), None);
        assert_eq!(remote.peek("users"), None);
        assert_eq!(remote.write_count(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_value_first() {
        let remote = MemoryRemote::new();
        remote.write("users/u/gameState", Some(json!(1))).await.unwrap();

        let (handler, events) = recorder();
        let _sub = remote
            .subscribe("users/u/gameState", RemoteQuery::value(), handler)
            .await
            .unwrap();

        assert_eq!(*events.lock().unwrap(), vec![RemoteEvent::Value(Some(json!(1)))]);
    }

    #[tokio::test]
    async fn test_ancestor_and_descendant_notification() {
        let remote = MemoryRemote::new();
        let (parent, parent_events) = recorder();
        let (child, child_events) = recorder();
        let (other, other_events) = recorder();

        let _a = remote.subscribe("users/u/templates", RemoteQuery::value(), parent).await.unwrap();
        let _b = remote.subscribe("users/u/templates/t1/name", RemoteQuery::value(), child).await.unwrap();
        let _c = remote.subscribe("users/u/inbox", RemoteQuery::value(), other).await.unwrap();

        remote
            .write("users/u/templates/t1", Some(json!({"name": "Morning"})))
            .await
            .unwrap();

        assert_eq!(parent_events.lock().unwrap().len(), 2);
        assert_eq!(
            child_events.lock().unwrap().last(),
            Some(&RemoteEvent::Value(Some(json!("Morning"))))
        );
        // Unrelated listener only saw its initial snapshot
        assert_eq!(other_events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_not_redelivered() {
        let remote = MemoryRemote::new();
        let (handler, events) = recorder();
        let _sub = remote.subscribe("a/b", RemoteQuery::value(), handler).await.unwrap();

        remote.write("a/b", Some(json!(5))).await.unwrap();
        remote.write("a/b", Some(json!(5))).await.unwrap();
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_key_range_listener() {
        let remote = MemoryRemote::new();
        let (handler, events) = recorder();
        let _sub = remote
            .subscribe("users/u/dailyData", RemoteQuery::start_at("2024-06-01"), handler)
            .await
            .unwrap();

        remote.write("users/u/dailyData/2024-05-01", Some(json!(1))).await.unwrap();
        assert_eq!(events.lock().unwrap().len(), 1);

        remote.write("users/u/dailyData/2024-06-02", Some(json!(2))).await.unwrap();
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&RemoteEvent::Value(Some(json!({"2024-06-02": 2}))))
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery() {
        let remote = MemoryRemote::new();
        let (handler, events) = recorder();
        let sub = remote.subscribe("a", RemoteQuery::value(), handler).await.unwrap();
        assert_eq!(remote.listener_count(), 1);

        drop(sub);
        assert_eq!(remote.listener_count(), 0);
        remote.write("a/x", Some(json!(1))).await.unwrap();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let remote = MemoryRemote::new();
        remote.fail_next_writes(2);
        assert!(remote.write("a", Some(json!(1))).await.unwrap_err().is_retryable());
        assert!(remote.write("a", Some(json!(1))).await.is_err());
        assert!(remote.write("a", Some(json!(1))).await.is_ok());

        remote.set_offline(true);
        assert!(matches!(remote.read("a").await, Err(SyncError::Disconnected)));
        remote.set_offline(false);
        assert_eq!(remote.read("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_revoke_sends_error() {
        let remote = MemoryRemote::new();
        let (handler, events) = recorder();
        let _sub = remote.subscribe("users/u/x", RemoteQuery::value(), handler).await.unwrap();

        remote.revoke_listeners("users/u", "permission denied");
        assert_eq!(remote.listener_count(), 0);
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&RemoteEvent::Error("permission denied".into()))
        );
    }
}
