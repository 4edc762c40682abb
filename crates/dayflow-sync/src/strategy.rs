//! # Sync Strategies
//!
//! Per-collection behaviour plugged into [`SyncCore`](crate::sync_core::SyncCore)
//! and [`ItemSync`](crate::item_sync::ItemSync).
//!
//! ```text
//!   SyncStrategy                         ItemSyncStrategy
//!   ────────────                         ────────────────
//!   collection()   "dailyData"           collection()    "templates"
//!   path_for(u,k)  users/u/dailyData/k   base_path(u)    users/u/templates
//!   serialize      T ──► Value           item_id(&T)     "t1"  ──► base/t1
//!   deserialize    Value ──► T           serialize_item / deserialize_item
//!   resolve_conflict(local?, remote)
//! ```
//!
//! [`SerdeStrategy`] and [`SerdeItemStrategy`] cover every collection whose
//! domain type round-trips through serde, which is all of them.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use dayflow_core::conflict::resolve_conflict_lww;
use dayflow_core::{remote_path, ConflictPolicy, RawEnvelope};

use crate::error::SyncResult;

// =============================================================================
// Whole-Value Strategy
// =============================================================================

/// How one collection is pushed, pulled and reconciled.
pub trait SyncStrategy: Send + Sync {
    /// Domain value type.
    type Value: Send + Sync;

    /// Collection name, also the remote path segment.
    fn collection(&self) -> &str;

    /// User override. `None` falls back to the configured user.
    fn user_id(&self) -> Option<&str> {
        None
    }

    /// Remote path of one value (`key == None` is the collection root).
    fn path_for(&self, user_id: &str, key: Option<&str>) -> SyncResult<String> {
        Ok(remote_path(user_id, self.collection(), key)?)
    }

    fn serialize(&self, value: &Self::Value) -> SyncResult<Value>;

    fn deserialize(&self, value: Value) -> SyncResult<Self::Value>;

    /// Data a subscriber should observe when `remote` arrives while
    /// `local` is the last known envelope. Defaults to last-write-wins.
    fn resolve_conflict(
        &self,
        local: Option<&RawEnvelope>,
        remote: &RawEnvelope,
    ) -> SyncResult<Option<Value>> {
        Ok(resolve_conflict_lww(local, Some(remote)).and_then(|winner| winner.data.clone()))
    }

    /// Sync log line for a successful push.
    fn success_message(&self, _value: Option<&Self::Value>, key: Option<&str>) -> String {
        format!("{} synced: {}", self.collection(), key.unwrap_or("root"))
    }
}

/// Strategy for any serde type, with a selectable conflict policy.
pub struct SerdeStrategy<T> {
    collection: String,
    policy: ConflictPolicy,
    user_id: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

/// Strategy over raw JSON values.
pub type JsonStrategy = SerdeStrategy<Value>;

impl<T> SerdeStrategy<T> {
    pub fn new(collection: impl Into<String>) -> Self {
        SerdeStrategy {
            collection: collection.into(),
            policy: ConflictPolicy::Lww,
            user_id: None,
            _marker: PhantomData,
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }
}

impl<T> fmt::Debug for SerdeStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerdeStrategy")
            .field("collection", &self.collection)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T> SyncStrategy for SerdeStrategy<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    type Value = T;

    fn collection(&self) -> &str {
        &self.collection
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn serialize(&self, value: &T) -> SyncResult<Value> {
        Ok(serde_json::to_value(value)?)
    }

    fn deserialize(&self, value: Value) -> SyncResult<T> {
        Ok(serde_json::from_value(value)?)
    }

    fn resolve_conflict(
        &self,
        local: Option<&RawEnvelope>,
        remote: &RawEnvelope,
    ) -> SyncResult<Option<Value>> {
        let resolution = self.policy.resolve(local, remote)?;
        Ok(resolution.resolved_data(local, remote))
    }
}

// =============================================================================
// Item Strategy
// =============================================================================

/// How rows of an item collection map to individual remote nodes.
pub trait ItemSyncStrategy: Send + Sync {
    type Item: Send + Sync;

    fn collection(&self) -> &str;

    fn user_id(&self) -> Option<&str> {
        None
    }

    /// Stable id of an item; its node lives at `base_path/{id}`.
    fn item_id(&self, item: &Self::Item) -> String;

    /// Parent path of all items.
    fn base_path(&self, user_id: &str) -> SyncResult<String> {
        Ok(remote_path(user_id, self.collection(), None)?)
    }

    fn serialize_item(&self, item: &Self::Item) -> SyncResult<Value>;

    fn deserialize_item(&self, value: Value) -> SyncResult<Self::Item>;
}

/// Item strategy for serde rows with an id accessor.
pub struct SerdeItemStrategy<T> {
    collection: String,
    id_of: fn(&T) -> String,
    user_id: Option<String>,
}

impl<T> SerdeItemStrategy<T> {
    pub fn new(collection: impl Into<String>, id_of: fn(&T) -> String) -> Self {
        SerdeItemStrategy {
            collection: collection.into(),
            id_of,
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl SerdeItemStrategy<Value> {
    /// JSON rows identified by their `id` field.
    pub fn json(collection: impl Into<String>) -> Self {
        SerdeItemStrategy::new(collection, json_item_id)
    }
}

fn json_item_id(item: &Value) -> String {
    match item.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl<T> ItemSyncStrategy for SerdeItemStrategy<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    type Item = T;

    fn collection(&self) -> &str {
        &self.collection
    }

    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn item_id(&self, item: &T) -> String {
        (self.id_of)(item)
    }

    fn serialize_item(&self, item: &T) -> SyncResult<Value> {
        Ok(serde_json::to_value(item)?)
    }

    fn deserialize_item(&self, value: Value) -> SyncResult<T> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dayflow_core::Template;
    use serde_json::json;

    #[test]
    fn test_default_path() {
        let strategy = JsonStrategy::new("dailyData");
        assert_eq!(
            strategy.path_for("u1", Some("2024-06-01")).unwrap(),
            "users/u1/dailyData/2024-06-01"
        );
        assert!(strategy.path_for("u1", Some("bad.key")).is_err());
    }

    #[test]
    fn test_lww_resolution_is_symmetric() {
        let strategy = JsonStrategy::new("gameState");
        let newer = RawEnvelope::at(Some(json!({"xp": 2})), "a", 200);
        let older = RawEnvelope::at(Some(json!({"xp": 1})), "b", 100);

        assert_eq!(
            strategy.resolve_conflict(Some(&older), &newer).unwrap(),
            Some(json!({"xp": 2}))
        );
        assert_eq!(
            strategy.resolve_conflict(Some(&newer), &older).unwrap(),
            Some(json!({"xp": 2}))
        );
    }

    #[test]
    fn test_merge_policy_resolution() {
        let strategy =
            JsonStrategy::new("dailyData").with_policy(ConflictPolicy::MergeRows { field: Some("tasks".into()) });
        let local = RawEnvelope::at(
            Some(json!({"tasks": [{"id": "a", "createdAt": 1}]})),
            "laptop",
            100,
        );
        let remote = RawEnvelope::at(
            Some(json!({"tasks": [{"id": "b", "createdAt": 2}]})),
            "phone",
            200,
        );

        let merged = strategy.resolve_conflict(Some(&local), &remote).unwrap().unwrap();
        assert_eq!(merged["tasks"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_item_strategy_ids() {
        let json = SerdeItemStrategy::json("globalInbox");
        assert_eq!(json.item_id(&json!({"id": "t1"})), "t1");
        assert_eq!(json.item_id(&json!({"id": 7})), "7");

        let templates = SerdeItemStrategy::<Template>::new("templates", |t| t.id.clone());
        assert_eq!(templates.base_path("u").unwrap(), "users/u/templates");
    }
}
