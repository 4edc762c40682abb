//! # Local Store Contract
//!
//! Keyed put/get/delete per collection, plus before-commit observers.
//!
//! ## Write Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    put(collection, key, value)                          │
//! │                                                                         │
//! │  1. Look up existing value                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  2. Fire observers (before commit)                                     │
//! │       ├── absent  → before_create(value)                               │
//! │       └── present → before_update(merged result)                       │
//! │       │                                                                 │
//! │       │  each observer may hand back a PostCommit callback             │
//! │       ▼                                                                 │
//! │  3. Commit the write                                                   │
//! │       │                                                                 │
//! │       ├── Err → callbacks dropped, error returned                      │
//! │       ▼                                                                 │
//! │  4. Run PostCommit callbacks in registration order                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store knows nothing about sync. The sync engine is just one observer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use dayflow_core::SYSTEM_COLLECTION;

use crate::error::{DbError, DbResult};

/// Callback that runs only after a successful commit.
pub type PostCommit = Box<dyn FnOnce() + Send + 'static>;

// =============================================================================
// Observer
// =============================================================================

/// Lifecycle hooks fired before a write commits.
///
/// Hooks are synchronous; anything slow belongs in the returned
/// [`PostCommit`] callback.
pub trait StoreObserver: Send + Sync {
    /// A record is about to be created.
    fn before_create(&self, _collection: &str, _key: &str, _value: &Value) -> Option<PostCommit> {
        None
    }

    /// A record is about to be replaced by `merged`.
    fn before_update(&self, _collection: &str, _key: &str, _merged: &Value) -> Option<PostCommit> {
        None
    }

    /// A record is about to be deleted.
    fn before_delete(&self, _collection: &str, _key: &str) -> Option<PostCommit> {
        None
    }
}

/// Observers registered per collection.
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<HashMap<String, Vec<Arc<dyn StoreObserver>>>>,
}

impl ObserverSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for one collection.
    pub fn add(&self, collection: &str, observer: Arc<dyn StoreObserver>) -> DbResult<()> {
        if collection == SYSTEM_COLLECTION {
            return Err(DbError::ReservedCollection(collection.to_string()));
        }

        let mut observers = self
            .observers
            .write()
            .map_err(|_| DbError::Internal("observer lock poisoned".into()))?;
        observers
            .entry(collection.to_string())
            .or_default()
            .push(observer);
        Ok(())
    }

    /// Number of observers on a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.observers
            .read()
            .map(|observers| observers.get(collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Fires create/update hooks for a pending put.
    pub fn before_put(
        &self,
        collection: &str,
        key: &str,
        existed: bool,
        value: &Value,
    ) -> Vec<PostCommit> {
        self.fire(collection, |observer| {
            if existed {
                observer.before_update(collection, key, value)
            } else {
                observer.before_create(collection, key, value)
            }
        })
    }

    /// Fires delete hooks for a pending delete.
    pub fn before_delete(&self, collection: &str, key: &str) -> Vec<PostCommit> {
        self.fire(collection, |observer| observer.before_delete(collection, key))
    }

    fn fire<F>(&self, collection: &str, hook: F) -> Vec<PostCommit>
    where
        F: Fn(&dyn StoreObserver) -> Option<PostCommit>,
    {
        // Clone the list so hooks run without holding the lock
        let observers: Vec<Arc<dyn StoreObserver>> = match self.observers.read() {
            Ok(observers) => observers.get(collection).cloned().unwrap_or_default(),
            Err(_) => return Vec::new(),
        };

        observers
            .iter()
            .filter_map(|observer| hook(observer.as_ref()))
            .collect()
    }
}

/// Runs post-commit callbacks in order.
pub fn run_post_commit(callbacks: Vec<PostCommit>) {
    for callback in callbacks {
        callback();
    }
}

// =============================================================================
// Store Trait
// =============================================================================

/// Keyed local persistence with lifecycle observers.
///
/// `systemState` is a reserved collection: it is readable and writable
/// but never observed.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Reads one record.
    async fn get(&self, collection: &str, key: &str) -> DbResult<Option<Value>>;

    /// Creates or replaces one record.
    async fn put(&self, collection: &str, key: &str, value: Value) -> DbResult<()>;

    /// Deletes one record. Returns false when it did not exist.
    async fn delete(&self, collection: &str, key: &str) -> DbResult<bool>;

    /// Lists every record of a collection, ordered by key.
    async fn list(&self, collection: &str) -> DbResult<Vec<(String, Value)>>;

    /// Registers an observer on a collection.
    fn add_observer(&self, collection: &str, observer: Arc<dyn StoreObserver>) -> DbResult<()>;
}
