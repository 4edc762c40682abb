//! # Item Sync
//!
//! Row-level sync: each item of a collection is its own remote node, so
//! two devices editing different rows never conflict.
//!
//! ```text
//!   users/{u}/templates            (never written or deleted as a whole)
//!     ├── tpl-1   { data, timestamp, deviceId, hash }
//!     ├── tpl-2   { data: null, ... }          ◄── delete_item = tombstone
//!     └── tpl-3   { data, ... }
//! ```
//!
//! Pushes go through the same hash elision and retry queue as whole-value
//! pushes.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use dayflow_core::paths::child_path;
use dayflow_core::RawEnvelope;

use crate::error::{SyncError, SyncResult};
use crate::strategy::ItemSyncStrategy;
use crate::sync_core::{read_node, PushOutcome, SyncCore};
use crate::sync_log::{LogAction, LogSource};

/// Per-item result of a batch push.
#[derive(Debug, Clone)]
pub struct ItemSyncResult {
    pub item_id: String,
    /// Item path, when it could be built.
    pub path: Option<String>,
    pub result: Result<PushOutcome, SyncError>,
}

impl ItemSyncResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Results of [`ItemSync::push_items`], in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchSyncResult {
    pub results: Vec<ItemSyncResult>,
}

impl BatchSyncResult {
    /// True when no item failed outright (queued items count as accepted).
    pub fn success(&self) -> bool {
        self.results.iter().all(ItemSyncResult::is_ok)
    }

    pub fn count(&self, outcome: &PushOutcome) -> usize {
        self.results
            .iter()
            .filter(|r| match (&r.result, outcome) {
                (Ok(PushOutcome::Queued { .. }), PushOutcome::Queued { .. }) => true,
                (Ok(actual), expected) => actual == expected,
                _ => false,
            })
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.is_ok()).count()
    }
}

/// Row-level push, delete and pull.
pub struct ItemSync {
    core: Arc<SyncCore>,
}

impl ItemSync {
    pub fn new(core: Arc<SyncCore>) -> Self {
        ItemSync { core }
    }

    /// Writes one item at `base/{item_id}`.
    pub async fn push_item<S: ItemSyncStrategy>(
        &self,
        strategy: &S,
        item: &S::Item,
    ) -> SyncResult<PushOutcome> {
        let item_id = strategy.item_id(item);
        self.push_item_with_id(strategy, &item_id, item).await
    }

    /// [`push_item`](Self::push_item) with an explicit id (the local key).
    pub async fn push_item_with_id<S: ItemSyncStrategy>(
        &self,
        strategy: &S,
        item_id: &str,
        item: &S::Item,
    ) -> SyncResult<PushOutcome> {
        let path = self.item_path(strategy, item_id)?;
        let data = strategy.serialize_item(item)?;
        let envelope = RawEnvelope::new(Some(data), self.core.context().device_id());

        let outcome = self
            .core
            .push_envelope(strategy.collection(), Some(item_id), &path, envelope)
            .await?;
        if outcome == PushOutcome::Written {
            self.core.context().log().sync(
                LogSource::Remote,
                format!("Item synced: {}/{}", strategy.collection(), item_id),
            );
        }
        Ok(outcome)
    }

    /// Writes a tombstone for one item. The parent path is left alone.
    pub async fn delete_item<S: ItemSyncStrategy>(
        &self,
        strategy: &S,
        item_id: &str,
    ) -> SyncResult<PushOutcome> {
        let path = self.item_path(strategy, item_id)?;
        let envelope = RawEnvelope::tombstone(self.core.context().device_id());

        let outcome = self
            .core
            .push_envelope(strategy.collection(), Some(item_id), &path, envelope)
            .await?;
        if outcome == PushOutcome::Written {
            self.core.context().log().sync(
                LogSource::Remote,
                format!("Item deleted: {}/{}", strategy.collection(), item_id),
            );
        }
        Ok(outcome)
    }

    /// Pushes items one after another, collecting per-item results.
    pub async fn push_items<S: ItemSyncStrategy>(
        &self,
        strategy: &S,
        items: &[S::Item],
    ) -> BatchSyncResult {
        let mut batch = BatchSyncResult::default();
        for item in items {
            let item_id = strategy.item_id(item);
            let path = self.item_path(strategy, &item_id).ok();
            let result = self.push_item_with_id(strategy, &item_id, item).await;
            if let Err(e) = &result {
                warn!(collection = %strategy.collection(), item_id = %item_id, error = %e, "Item push failed");
            }
            batch.results.push(ItemSyncResult {
                item_id,
                path,
                result,
            });
        }
        debug!(
            collection = %strategy.collection(),
            total = batch.results.len(),
            failed = batch.failed(),
            "Item batch pushed"
        );
        batch
    }

    /// Reads every live item under the base path.
    ///
    /// Tombstones and rows that do not decode are skipped.
    pub async fn pull_items<S: ItemSyncStrategy>(&self, strategy: &S) -> SyncResult<Vec<S::Item>> {
        let ctx = self.core.context();
        let base = strategy.base_path(ctx.user_id(strategy.user_id()))?;

        let Some(Value::Object(children)) = read_node(ctx, &base).await? else {
            return Ok(Vec::new());
        };

        let mut items = Vec::with_capacity(children.len());
        for (item_id, node) in children {
            let path = format!("{}/{}", base, item_id);
            let envelope = match RawEnvelope::from_value(&path, node) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(path = %path, error = %e, "Skipping malformed item");
                    continue;
                }
            };
            let data = envelope.data.clone();
            ctx.remember(&path, envelope);

            let Some(data) = data else {
                continue;
            };
            match strategy.deserialize_item(data) {
                Ok(item) => items.push(item),
                Err(e) => warn!(path = %path, error = %e, "Skipping undecodable item"),
            }
        }

        ctx.log().record(
            LogSource::Remote,
            LogAction::Load,
            format!("{} items fetched: {}", strategy.collection(), items.len()),
            None,
            None,
        );
        Ok(items)
    }

    fn item_path<S: ItemSyncStrategy>(&self, strategy: &S, item_id: &str) -> SyncResult<String> {
        let ctx = self.core.context();
        let base = strategy.base_path(ctx.user_id(strategy.user_id()))?;
        Ok(child_path(&base, item_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, RemoteStore};
    use crate::strategy::SerdeItemStrategy;
    use crate::sync_core::test_support::core;
    use serde_json::json;

    fn setup(remote: &MemoryRemote, device: &str) -> ItemSync {
        ItemSync::new(core(remote, device))
    }

    #[tokio::test]
    async fn test_concurrent_rows_both_survive() {
        let remote = MemoryRemote::new();
        let laptop = setup(&remote, "laptop");
        let phone = setup(&remote, "phone");
        let strategy = SerdeItemStrategy::json("templates");

        laptop
            .push_item(&strategy, &json!({"id": "t1", "name": "Laptop row"}))
            .await
            .unwrap();
        phone
            .push_item(&strategy, &json!({"id": "t2", "name": "Phone row"}))
            .await
            .unwrap();

        let mut rows = laptop.pull_items(&strategy).await.unwrap();
        rows.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Laptop row");
        assert_eq!(rows[1]["name"], "Phone row");
    }

    #[tokio::test]
    async fn test_delete_writes_tombstone_not_parent() {
        let remote = MemoryRemote::new();
        let sync = setup(&remote, "laptop");
        let strategy = SerdeItemStrategy::json("globalInbox");

        sync.push_item(&strategy, &json!({"id": "a"})).await.unwrap();
        sync.push_item(&strategy, &json!({"id": "b"})).await.unwrap();
        sync.delete_item(&strategy, "a").await.unwrap();

        let node = remote.peek("users/u/globalInbox/a").unwrap();
        assert!(node["data"].is_null());
        assert!(remote.peek("users/u/globalInbox/b").is_some());

        let rows = sync.pull_items(&strategy).await.unwrap();
        assert_eq!(rows, vec![json!({"id": "b"})]);
    }

    #[tokio::test]
    async fn test_item_push_elides_identical() {
        let remote = MemoryRemote::new();
        let sync = setup(&remote, "laptop");
        let strategy = SerdeItemStrategy::json("shopItems");
        let item = json!({"id": "s1", "price": 5});

        assert_eq!(sync.push_item(&strategy, &item).await.unwrap(), PushOutcome::Written);
        assert_eq!(sync.push_item(&strategy, &item).await.unwrap(), PushOutcome::Skipped);
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_reports_per_item() {
        let remote = MemoryRemote::new();
        let sync = setup(&remote, "laptop");
        let strategy = SerdeItemStrategy::json("templates");

        let batch = sync
            .push_items(
                &strategy,
                &[json!({"id": "ok"}), json!({"id": "bad/id"}), json!({"name": "no id"})],
            )
            .await;

        assert!(!batch.success());
        assert_eq!(batch.count(&PushOutcome::Written), 1);
        assert_eq!(batch.failed(), 2);
        assert_eq!(batch.results[0].path.as_deref(), Some("users/u/templates/ok"));
        assert!(batch.results[1].path.is_none());
    }

    #[tokio::test]
    async fn test_pull_skips_malformed_rows() {
        let remote = MemoryRemote::new();
        let sync = setup(&remote, "laptop");
        let strategy = SerdeItemStrategy::json("templates");

        sync.push_item(&strategy, &json!({"id": "good"})).await.unwrap();
        remote
            .write("users/u/templates/junk", Some(json!(17)))
            .await
            .unwrap();

        let rows = sync.pull_items(&strategy).await.unwrap();
        assert_eq!(rows, vec![json!({"id": "good"})]);
    }

    #[tokio::test]
    async fn test_offline_item_push_is_queued() {
        let remote = MemoryRemote::new();
        let sync = setup(&remote, "laptop");
        let strategy = SerdeItemStrategy::json("templates");
        remote.set_offline(true);

        let outcome = sync.push_item(&strategy, &json!({"id": "t1"})).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Queued { .. }));
        assert_eq!(sync.core.retry_queue().len(), 1);
    }
}
