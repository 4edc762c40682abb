//! # SQLite Store
//!
//! [`LocalStore`] backed by the SQLite [`Database`].
//!
//! The reserved `systemState` collection is routed to the `system_state`
//! table; every other collection lives in `records`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use dayflow_core::SYSTEM_COLLECTION;

use crate::error::DbResult;
use crate::pool::{Database, DbConfig};
use crate::store::{run_post_commit, LocalStore, ObserverSet, StoreObserver};

/// SQLite-backed local store.
pub struct SqliteStore {
    db: Database,
    observers: ObserverSet,
}

impl SqliteStore {
    /// Wraps an open database.
    pub fn new(db: Database) -> Self {
        SqliteStore {
            db,
            observers: ObserverSet::new(),
        }
    }

    /// Opens (and migrates) the database, then wraps it.
    pub async fn open(config: DbConfig) -> DbResult<Self> {
        Ok(Self::new(Database::new(config).await?))
    }

    /// The underlying database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get(&self, collection: &str, key: &str) -> DbResult<Option<Value>> {
        if collection == SYSTEM_COLLECTION {
            return self.db.system_state().get(key).await;
        }
        self.db.records().get(collection, key).await
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> DbResult<()> {
        if collection == SYSTEM_COLLECTION {
            return self.db.system_state().set(key, &value).await;
        }

        let records = self.db.records();
        let existed = records.get(collection, key).await?.is_some();
        let callbacks = self.observers.before_put(collection, key, existed, &value);

        records.upsert(collection, key, &value).await?;

        run_post_commit(callbacks);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> DbResult<bool> {
        if collection == SYSTEM_COLLECTION {
            return self.db.system_state().remove(key).await;
        }

        let records = self.db.records();
        if records.get(collection, key).await?.is_none() {
            return Ok(false);
        }
        let callbacks = self.observers.before_delete(collection, key);

        let removed = records.delete(collection, key).await?;
        debug!(collection, key, removed, "Record delete committed");

        run_post_commit(callbacks);
        Ok(removed)
    }

    async fn list(&self, collection: &str) -> DbResult<Vec<(String, Value)>> {
        if collection == SYSTEM_COLLECTION {
            return self.db.system_state().list().await;
        }
        self.db.records().list(collection).await
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

    struct CountCommits(Arc<AtomicUsize>);

    impl StoreObserver for CountCommits {
        fn before_create(&self, _: &str, _: &str, _: &Value) -> Option<PostCommit> {
            let counter = self.0.clone();
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        }

        fn before_delete(&self, _: &str, _: &str) -> Option<PostCommit> {
            let counter = self.0.clone();
            Some(Box::new(move || {
                counter.fetch_add(10, Ordering::SeqCst);
            }))
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::open(DbConfig::new(dir.path().join("store.db")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_and_observers() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let commits = Arc::new(AtomicUsize::new(0));
        store
            .add_observer("templates", Arc::new(CountCommits(commits.clone())))
            .unwrap();

        store
            .put("templates", "tpl-1", json!({"name": "Morning"}))
            .await
            .unwrap();
        assert_eq!(
            store.get("templates", "tpl-1").await.unwrap(),
            Some(json!({"name": "Morning"}))
        );
        assert_eq!(commits.load(Ordering::SeqCst), 1);

        assert!(store.delete("templates", "tpl-1").await.unwrap());
        assert_eq!(commits.load(Ordering::SeqCst), 11);
        assert!(store.list("templates").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_system_state_is_separate_and_persistent() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir).await;
            store
                .put(SYSTEM_COLLECTION, "deviceId", json!("device-1"))
                .await
                .unwrap();
            assert!(store.list("records").await.unwrap().is_empty());
            store.database().close().await;
        }

        let store = open_store(&dir).await;
        assert_eq!(
            store.get(SYSTEM_COLLECTION, "deviceId").await.unwrap(),
            Some(json!("device-1"))
        );
    }
}
