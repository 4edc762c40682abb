//! # Conflict Resolution
//!
//! Deterministic resolution between a local and a remote envelope.
//!
//! ## Decision Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Last-Write-Wins (LWW)                                │
//! │                                                                         │
//! │  local   remote                                   winner               │
//! │  ─────   ──────                                   ──────               │
//! │  none    some          ─────────────────────────► remote               │
//! │  some    none          ─────────────────────────► local                │
//! │  t=100   t=90          timestamp strictly greater local                │
//! │  t=90    t=100         timestamp strictly greater remote               │
//! │  t=100   t=100         greater hash (lexicographic), both devices      │
//! │                        pick the same envelope without coordination     │
//! │                                                                         │
//! │  Row merge (arrays of independently edited rows)                       │
//! │  ───────────────────────────────────────────────                       │
//! │  union by id; shared ids → greater row updatedAt, local on tie         │
//! │                                                                         │
//! │  Progress merge (cumulative counters)                                  │
//! │  ────────────────────────────────────                                  │
//! │  max(totalXp, dailyXp, availableXp); quests max progress / OR done;    │
//! │  xpHistory max per date, last 7 days                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Known Limitation
//! Row merge applies LWW at row granularity. Two devices editing the *same*
//! row concurrently still lose one of the edits; there is no field-level
//! merge inside a row.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::{RawEnvelope, SyncEnvelope};
use crate::error::CoreResult;
use crate::types::{ProgressState, SyncRow};

/// Number of days of XP history retained after a merge.
pub const XP_HISTORY_DAYS: usize = 7;

// =============================================================================
// Last-Write-Wins
// =============================================================================

/// Which side of a comparison won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// Compares two present envelopes.
///
/// Greater timestamp wins; on an exact tie the greater hash wins, so
/// the outcome does not depend on which device performs the comparison.
pub fn lww_winner<T, U>(local: &SyncEnvelope<T>, remote: &SyncEnvelope<U>) -> Side {
    match local.timestamp.cmp(&remote.timestamp) {
        Ordering::Greater => Side::Local,
        Ordering::Less => Side::Remote,
        Ordering::Equal => {
            if remote.hash > local.hash {
                Side::Remote
            } else {
                Side::Local
            }
        }
    }
}

/// Last-write-wins between two optional envelopes.
///
/// ## Example
/// ```rust
/// use dayflow_core::conflict::resolve_conflict_lww;
/// use dayflow_core::envelope::RawEnvelope;
/// use serde_json::json;
///
/// let a = RawEnvelope::at(Some(json!("new")), "a", 100);
/// let b = RawEnvelope::at(Some(json!("old")), "b", 90);
///
/// assert_eq!(resolve_conflict_lww(Some(&a), Some(&b)), Some(&a));
/// assert_eq!(resolve_conflict_lww(Some(&b), Some(&a)), Some(&a));
/// assert_eq!(resolve_conflict_lww(None, Some(&b)), Some(&b));
/// ```
pub fn resolve_conflict_lww<'a, T>(
    local: Option<&'a SyncEnvelope<T>>,
    remote: Option<&'a SyncEnvelope<T>>,
) -> Option<&'a SyncEnvelope<T>> {
    match (local, remote) {
        (None, None) => None,
        (Some(local), None) => Some(local),
        (None, Some(remote)) => Some(remote),
        (Some(local), Some(remote)) => match lww_winner(local, remote) {
            Side::Local => Some(local),
            Side::Remote => Some(remote),
        },
    }
}

// =============================================================================
// Row Merge
// =============================================================================

/// Unions two row lists by id, applying LWW per row.
///
/// Rows present on both sides keep the one with the greater
/// `updated_millis()`; the local row wins ties. The result is ordered by
/// creation time, newest first.
pub fn merge_rows_by_id<T: SyncRow + Clone>(local: &[T], remote: &[T]) -> Vec<T> {
    let mut rows: HashMap<String, T> = HashMap::with_capacity(local.len() + remote.len());

    for row in remote {
        rows.insert(row.row_id().to_string(), row.clone());
    }

    for row in local {
        let remote_is_newer = rows
            .get(row.row_id())
            .is_some_and(|existing| existing.updated_millis() > row.updated_millis());
        if !remote_is_newer {
            rows.insert(row.row_id().to_string(), row.clone());
        }
    }

    let mut merged: Vec<T> = rows.into_values().collect();
    merged.sort_by(|a, b| {
        b.created_millis()
            .cmp(&a.created_millis())
            .then_with(|| a.row_id().cmp(b.row_id()))
    });
    merged
}

/// Row view over a JSON object with `id` / `updatedAt` / `createdAt`.
#[derive(Clone)]
struct JsonRow {
    id: String,
    value: Value,
}

impl JsonRow {
    fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("id")?.as_str()?.to_string();
        Some(JsonRow {
            id,
            value: value.clone(),
        })
    }
}

impl SyncRow for JsonRow {
    fn row_id(&self) -> &str {
        &self.id
    }

    fn created_millis(&self) -> i64 {
        self.value.get("createdAt").map(json_millis).unwrap_or(0)
    }

    fn updated_millis(&self) -> i64 {
        match self.value.get("updatedAt") {
            Some(updated) if !updated.is_null() => json_millis(updated),
            _ => self.created_millis(),
        }
    }
}

/// Reads a timestamp stored either as epoch millis or as an RFC 3339 string.
fn json_millis(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0),
        _ => 0,
    }
}

/// Row merge over JSON arrays.
///
/// A side that is not an array counts as empty. Elements without a string
/// `id` cannot be matched and are dropped.
pub fn merge_json_rows(local: &Value, remote: &Value) -> Value {
    let rows = |side: &Value| -> Vec<JsonRow> {
        side.as_array()
            .map(|items| items.iter().filter_map(JsonRow::from_value).collect())
            .unwrap_or_default()
    };

    let merged = merge_rows_by_id(&rows(local), &rows(remote));
    Value::Array(merged.into_iter().map(|row| row.value).collect())
}

// =============================================================================
// Progress Merge
// =============================================================================

/// Field-level merge of cumulative progress.
///
/// `winner` selects which side supplies every field the merge does not
/// handle explicitly.
pub fn merge_progress(local: &ProgressState, remote: &ProgressState, winner: Side) -> ProgressState {
    let mut merged = match winner {
        Side::Local => local.clone(),
        Side::Remote => remote.clone(),
    };

    merged.total_xp = local.total_xp.max(remote.total_xp);
    merged.daily_xp = local.daily_xp.max(remote.daily_xp);
    merged.available_xp = local.available_xp.max(remote.available_xp);

    let mut quests = local.daily_quests.clone();
    for incoming in &remote.daily_quests {
        match quests.iter_mut().find(|q| q.id == incoming.id) {
            Some(existing) => {
                existing.progress = existing.progress.max(incoming.progress);
                existing.completed = existing.completed || incoming.completed;
            }
            None => quests.push(incoming.clone()),
        }
    }
    merged.daily_quests = quests;

    let mut by_date: BTreeMap<String, i64> = BTreeMap::new();
    for entry in local.xp_history.iter().chain(remote.xp_history.iter()) {
        let xp = by_date.entry(entry.date.clone()).or_insert(entry.xp);
        *xp = (*xp).max(entry.xp);
    }
    let skip = by_date.len().saturating_sub(XP_HISTORY_DAYS);
    merged.xp_history = by_date
        .into_iter()
        .skip(skip)
        .map(|(date, xp)| crate::types::XpHistoryEntry { date, xp })
        .collect();

    merged
}

// =============================================================================
// Policies
// =============================================================================

/// Conflict policy attached to a synchronized collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Whole-value last-write-wins.
    #[default]
    Lww,

    /// Row merge, either of the whole value (an array) or of one array field.
    MergeRows {
        #[serde(default)]
        field: Option<String>,
    },

    /// Cumulative counter merge for progress state.
    MergeProgress,
}

/// Outcome of resolving a remote envelope against the local one.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Local value stands.
    KeepLocal,
    /// Remote value replaces the local one.
    TakeRemote,
    /// Neither side alone; the merged value differs from the remote value.
    Merged(Value),
}

impl Resolution {
    /// The data a consumer should observe after resolution.
    pub fn resolved_data(&self, local: Option<&RawEnvelope>, remote: &RawEnvelope) -> Option<Value> {
        match self {
            Resolution::KeepLocal => local.and_then(|env| env.data.clone()),
            Resolution::TakeRemote => remote.data.clone(),
            Resolution::Merged(value) => Some(value.clone()),
        }
    }
}

impl ConflictPolicy {
    /// Resolves `remote` against the last known `local` envelope.
    ///
    /// Merge policies only apply when both sides carry data; tombstones
    /// always go through plain LWW.
    pub fn resolve(&self, local: Option<&RawEnvelope>, remote: &RawEnvelope) -> CoreResult<Resolution> {
        let Some(local) = local else {
            return Ok(Resolution::TakeRemote);
        };

        let winner = lww_winner(local, remote);
        let lww = match winner {
            Side::Local => Resolution::KeepLocal,
            Side::Remote => Resolution::TakeRemote,
        };

        let (Some(local_data), Some(remote_data)) = (&local.data, &remote.data) else {
            return Ok(lww);
        };

        let merged = match self {
            ConflictPolicy::Lww => return Ok(lww),
            ConflictPolicy::MergeRows { field: None } => merge_json_rows(local_data, remote_data),
            ConflictPolicy::MergeRows { field: Some(field) } => {
                merge_row_field(local_data, remote_data, field, winner)
            }
            ConflictPolicy::MergeProgress => {
                let local_state: ProgressState = serde_json::from_value(local_data.clone())?;
                let remote_state: ProgressState = serde_json::from_value(remote_data.clone())?;
                serde_json::to_value(merge_progress(&local_state, &remote_state, winner))?
            }
        };

        if &merged == remote_data {
            Ok(Resolution::TakeRemote)
        } else {
            Ok(Resolution::Merged(merged))
        }
    }
}

/// Merges one array field; every other field comes from the LWW winner.
fn merge_row_field(local: &Value, remote: &Value, field: &str, winner: Side) -> Value {
    let base = match winner {
        Side::Local => local,
        Side::Remote => remote,
    };

    let mut object: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    let empty = Value::Array(Vec::new());
    let rows = merge_json_rows(
        local.get(field).unwrap_or(&empty),
        remote.get(field).unwrap_or(&empty),
    );
    object.insert(field.to_string(), rows);
    Value::Object(object)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Quest, XpHistoryEntry};
    use serde_json::json;

    fn env(data: Value, device: &str, ts: i64) -> RawEnvelope {
        RawEnvelope::at(Some(data), device, ts)
    }

    #[test]
    fn test_lww_newer_wins_regardless_of_order() {
        let a = env(json!({"text": "buy milk"}), "a", 100);
        let b = env(json!({"text": "old"}), "b", 90);

        assert_eq!(resolve_conflict_lww(Some(&a), Some(&b)).unwrap().data, a.data);
        assert_eq!(resolve_conflict_lww(Some(&b), Some(&a)).unwrap().data, a.data);
    }

    #[test]
    fn test_lww_tie_breaks_on_hash_deterministically() {
        let a = env(json!("alpha"), "a", 100);
        let b = env(json!("beta"), "b", 100);
        let expected = if a.hash > b.hash { &a } else { &b };

        for _ in 0..3 {
            assert_eq!(resolve_conflict_lww(Some(&a), Some(&b)), Some(expected));
            assert_eq!(resolve_conflict_lww(Some(&b), Some(&a)), Some(expected));
        }
    }

    #[test]
    fn test_lww_absent_side_loses() {
        let a = env(json!(1), "a", 1);
        assert_eq!(resolve_conflict_lww(Some(&a), None), Some(&a));
        assert_eq!(resolve_conflict_lww(None, Some(&a)), Some(&a));
        assert_eq!(resolve_conflict_lww::<Value>(None, None), None);
    }

    #[test]
    fn test_merge_json_rows_unions_and_picks_newer_row() {
        let local = json!([
            {"id": "1", "text": "local edit", "createdAt": 10, "updatedAt": 50},
            {"id": "2", "text": "only local", "createdAt": 20},
        ]);
        let remote = json!([
            {"id": "1", "text": "remote edit", "createdAt": 10, "updatedAt": 40},
            {"id": "3", "text": "only remote", "createdAt": 30},
        ]);

        let merged = merge_json_rows(&local, &remote);
        let texts: Vec<&str> = merged
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["text"].as_str().unwrap())
            .collect();

        // newest createdAt first
        assert_eq!(texts, vec!["only remote", "only local", "local edit"]);
    }

    #[test]
    fn test_merge_json_rows_local_wins_row_tie() {
        let local = json!([{"id": "1", "text": "L", "createdAt": 1, "updatedAt": 5}]);
        let remote = json!([{"id": "1", "text": "R", "createdAt": 1, "updatedAt": 5}]);

        let merged = merge_json_rows(&local, &remote);
        assert_eq!(merged[0]["text"], "L");
    }

    #[test]
    fn test_merge_json_rows_reads_iso_timestamps() {
        let local = json!([{"id": "1", "text": "L", "createdAt": "2024-06-01T08:00:00Z"}]);
        let remote = json!([{
            "id": "1",
            "text": "R",
            "createdAt": "2024-06-01T08:00:00Z",
            "updatedAt": "2024-06-01T09:00:00Z",
        }]);

        let merged = merge_json_rows(&local, &remote);
        assert_eq!(merged[0]["text"], "R");
    }

    #[test]
    fn test_merge_progress_takes_max_counters() {
        let local = ProgressState {
            total_xp: 120,
            daily_xp: 30,
            available_xp: 5,
            daily_quests: vec![Quest {
                id: "q1".into(),
                progress: 3,
                target: 5,
                completed: false,
            }],
            xp_history: (1..=6)
                .map(|d| XpHistoryEntry {
                    date: format!("2024-06-0{}", d),
                    xp: 10,
                })
                .collect(),
            ..Default::default()
        };
        let remote = ProgressState {
            total_xp: 100,
            daily_xp: 40,
            available_xp: 9,
            daily_quests: vec![
                Quest {
                    id: "q1".into(),
                    progress: 2,
                    target: 5,
                    completed: true,
                },
                Quest {
                    id: "q2".into(),
                    progress: 1,
                    target: 1,
                    completed: true,
                },
            ],
            xp_history: vec![
                XpHistoryEntry {
                    date: "2024-06-06".into(),
                    xp: 25,
                },
                XpHistoryEntry {
                    date: "2024-06-07".into(),
                    xp: 5,
                },
                XpHistoryEntry {
                    date: "2024-06-08".into(),
                    xp: 5,
                },
            ],
            ..Default::default()
        };

        let merged = merge_progress(&local, &remote, Side::Remote);

        assert_eq!(merged.total_xp, 120);
        assert_eq!(merged.daily_xp, 40);
        assert_eq!(merged.available_xp, 9);
        assert_eq!(merged.daily_quests.len(), 2);
        assert_eq!(merged.daily_quests[0].progress, 3);
        assert!(merged.daily_quests[0].completed);

        assert_eq!(merged.xp_history.len(), XP_HISTORY_DAYS);
        assert_eq!(merged.xp_history.first().unwrap().date, "2024-06-02");
        let june6 = merged.xp_history.iter().find(|e| e.date == "2024-06-06").unwrap();
        assert_eq!(june6.xp, 25);
    }

    #[test]
    fn test_policy_lww_resolution() {
        let local = env(json!({"text": "old"}), "b", 90);
        let remote = env(json!({"text": "buy milk"}), "a", 100);

        let resolution = ConflictPolicy::Lww.resolve(Some(&local), &remote).unwrap();
        assert_eq!(resolution, Resolution::TakeRemote);

        let resolution = ConflictPolicy::Lww.resolve(Some(&remote), &local).unwrap();
        assert_eq!(resolution, Resolution::KeepLocal);

        let resolution = ConflictPolicy::Lww.resolve(None, &local).unwrap();
        assert_eq!(resolution, Resolution::TakeRemote);
    }

    #[test]
    fn test_policy_merge_rows_field() {
        let local = env(
            json!({"tasks": [{"id": "1", "createdAt": 1}], "note": "local"}),
            "b",
            90,
        );
        let remote = env(
            json!({"tasks": [{"id": "2", "createdAt": 2}], "note": "remote"}),
            "a",
            100,
        );

        let policy = ConflictPolicy::MergeRows {
            field: Some("tasks".into()),
        };
        let Resolution::Merged(merged) = policy.resolve(Some(&local), &remote).unwrap() else {
            panic!("expected a merged value");
        };

        assert_eq!(merged["note"], "remote");
        assert_eq!(merged["tasks"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_policy_merge_equal_to_remote_is_take_remote() {
        let rows = json!([{"id": "1", "createdAt": 1}]);
        let local = env(rows.clone(), "b", 90);
        let remote = env(rows, "a", 100);

        let policy = ConflictPolicy::MergeRows { field: None };
        assert_eq!(
            policy.resolve(Some(&local), &remote).unwrap(),
            Resolution::TakeRemote
        );
    }

    #[test]
    fn test_policy_merge_with_tombstone_falls_back_to_lww() {
        let local = env(json!([{"id": "1", "createdAt": 1}]), "b", 90);
        let remote = RawEnvelope::at(None, "a", 100);

        let policy = ConflictPolicy::MergeRows { field: None };
        assert_eq!(
            policy.resolve(Some(&local), &remote).unwrap(),
            Resolution::TakeRemote
        );
    }

    #[test]
    fn test_policy_serde_shape() {
        let policy: ConflictPolicy =
            serde_json::from_value(json!({"kind": "merge_rows", "field": "tasks"})).unwrap();
        assert_eq!(
            policy,
            ConflictPolicy::MergeRows {
                field: Some("tasks".into())
            }
        );

        let policy: ConflictPolicy = serde_json::from_value(json!({"kind": "lww"})).unwrap();
        assert_eq!(policy, ConflictPolicy::Lww);
    }
}
