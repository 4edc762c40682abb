//! # In-Memory Store
//!
//! A [`LocalStore`] kept entirely in process memory.
//!
//! Used by tests and by hosts that persist elsewhere. Observer semantics are
//! identical to the SQLite store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::error::{DbError, DbResult};
use crate::store::{run_post_commit, LocalStore, ObserverSet, StoreObserver};

type Collections = HashMap<String, BTreeMap<String, Value>>;

/// In-memory local store.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Collections>,
    observers: ObserverSet,
    /// Collections whose writes fail, for exercising error paths.
    failing: Mutex<Vec<String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write to `collection` fail until cleared.
    pub fn fail_writes(&self, collection: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(collection.to_string());
        }
    }

    /// Clears injected write failures.
    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    /// Number of observers attached to a collection.
    pub fn observer_count(&self, collection: &str) -> usize {
        self.observers.count(collection)
    }

    fn check_writable(&self, collection: &str) -> DbResult<()> {
        let failing = self
            .failing
            .lock()
            .map_err(|_| DbError::Internal("failure list poisoned".into()))?;
        if failing.iter().any(|c| c == collection) {
            return Err(DbError::QueryFailed(format!(
                "injected write failure on {}",
                collection
            )));
        }
        Ok(())
    }

    fn lock(&self) -> DbResult<std::sync::MutexGuard<'_, Collections>> {
        self.data
            .lock()
            .map_err(|_| DbError::Internal("store lock poisoned".into()))
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> DbResult<Option<Value>> {
        let data = self.lock()?;
        Ok(data.get(collection).and_then(|records| records.get(key)).cloned())
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> DbResult<()> {
        let existed = self.get(collection, key).await?.is_some();
        let callbacks = self.observers.before_put(collection, key, existed, &value);

        self.check_writable(collection)?;
        {
            let mut data = self.lock()?;
            data.entry(collection.to_string())
                .or_default()
                .insert(key.to_string(), value);
        }
        trace!(collection, key, existed, "Record stored");

        run_post_commit(callbacks);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> DbResult<bool> {
        if self.get(collection, key).await?.is_none() {
            return Ok(false);
        }
        let callbacks = self.observers.before_delete(collection, key);

        self.check_writable(collection)?;
        {
            let mut data = self.lock()?;
            if let Some(records) = data.get_mut(collection) {
                records.remove(key);
            }
        }
        trace!(collection, key, "Record deleted");

        run_post_commit(callbacks);
        Ok(true)
    }

    async fn list(&self, collection: &str) -> DbResult<Vec<(String, Value)>> {
        let data = self.lock()?;
        Ok(data
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn add_observer(&self, collection: &str, observer: Arc<dyn StoreObserver>) -> DbResult<()> {
        self.observers.add(collection, observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PostCommit;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        committed: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn hook(&self, event: String) -> Option<PostCommit> {
            self.events.lock().unwrap().push(event);
            let committed = self.committed.clone();
            Some(Box::new(move || {
                committed.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    impl StoreObserver for Recorder {
        fn before_create(&self, _: &str, key: &str, _: &Value) -> Option<PostCommit> {
            self.hook(format!("create:{}", key))
        }

        fn before_update(&self, _: &str, key: &str, merged: &Value) -> Option<PostCommit> {
            self.hook(format!("update:{}:{}", key, merged["v"]))
        }

        fn before_delete(&self, _: &str, key: &str) -> Option<PostCommit> {
            self.hook(format!("delete:{}", key))
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put("settings", "main", json!({"theme": "dark"})).await.unwrap();

        assert_eq!(
            store.get("settings", "main").await.unwrap(),
            Some(json!({"theme": "dark"}))
        );
        assert!(store.delete("settings", "main").await.unwrap());
        assert!(!store.delete("settings", "main").await.unwrap());
        assert_eq!(store.get("settings", "main").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_key() {
        let store = MemoryStore::new();
        store.put("dailyData", "2024-06-02", json!(2)).await.unwrap();
        store.put("dailyData", "2024-06-01", json!(1)).await.unwrap();

        let keys: Vec<String> = store
            .list("dailyData")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["2024-06-01", "2024-06-02"]);
    }

    #[tokio::test]
    async fn test_observers_fire_create_update_delete() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        store.add_observer("templates", recorder.clone()).unwrap();

        store.put("templates", "a", json!({"v": 1})).await.unwrap();
        store.put("templates", "a", json!({"v": 2})).await.unwrap();
        store.delete("templates", "a").await.unwrap();
        // deleting a missing record fires nothing
        store.delete("templates", "a").await.unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["create:a", "update:a:2", "delete:a"]);
        assert_eq!(recorder.committed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_post_commit_skipped_when_write_fails() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        store.add_observer("templates", recorder.clone()).unwrap();
        store.fail_writes("templates");

        assert!(store.put("templates", "a", json!({"v": 1})).await.is_err());
        assert_eq!(recorder.events.lock().unwrap().len(), 1);
        assert_eq!(recorder.committed.load(Ordering::SeqCst), 0);

        store.clear_failures();
        store.put("templates", "a", json!({"v": 1})).await.unwrap();
        assert_eq!(recorder.committed.load(Ordering::SeqCst), 1);
    }
}
