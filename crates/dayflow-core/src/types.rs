//! # Domain Types
//!
//! Row shapes the conflict resolver needs to understand.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Task       │   │    Template     │   │  ProgressState  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │   │  id             │   │  totalXp        │       │
//! │  │  text           │   │  name           │   │  dailyXp        │       │
//! │  │  completed      │   │  autoGenerate   │   │  availableXp    │       │
//! │  │  createdAt      │   │  createdAt      │   │  dailyQuests[]  │       │
//! │  │  updatedAt?     │   │  updatedAt?     │   │  xpHistory[]    │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  SyncRow: every independently edited row exposes id + updatedAt        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything else the application stores is opaque to the sync core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Row Trait
// =============================================================================

/// A row that can be edited independently on several devices.
///
/// Rows are merged by [`crate::conflict::merge_rows_by_id`].
pub trait SyncRow {
    /// Stable identity of the row.
    fn row_id(&self) -> &str;

    /// Creation time in milliseconds.
    fn created_millis(&self) -> i64;

    /// Last modification time in milliseconds.
    ///
    /// Rows that were never edited fall back to their creation time.
    fn updated_millis(&self) -> i64 {
        self.created_millis()
    }
}

// =============================================================================
// Task
// =============================================================================

/// A schedulable task (inbox or daily schedule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Creates an uncompleted task.
    pub fn new(id: impl Into<String>, text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Task {
            id: id.into(),
            text: text.into(),
            completed: false,
            created_at,
            updated_at: None,
            completed_at: None,
        }
    }

    /// Marks the task completed at `at`.
    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.completed = true;
        self.completed_at = Some(at);
        self.updated_at = Some(at);
    }
}

impl SyncRow for Task {
    fn row_id(&self) -> &str {
        &self.id
    }

    fn created_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    fn updated_millis(&self) -> i64 {
        self.updated_at
            .unwrap_or(self.created_at)
            .timestamp_millis()
    }
}

/// One day of the schedule, keyed by `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyData {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub updated_at: i64,
}

// =============================================================================
// Template
// =============================================================================

/// A reusable task template. Synced per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub auto_generate: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncRow for Template {
    fn row_id(&self) -> &str {
        &self.id
    }

    fn created_millis(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    fn updated_millis(&self) -> i64 {
        self.updated_at
            .unwrap_or(self.created_at)
            .timestamp_millis()
    }
}

// =============================================================================
// Progress State
// =============================================================================

/// Cumulative progress counters, merged field by field.
///
/// Fields the merge does not know about are carried in `extra` and taken
/// from whichever side wins LWW.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    #[serde(default)]
    pub total_xp: i64,
    #[serde(default)]
    pub daily_xp: i64,
    #[serde(default)]
    pub available_xp: i64,
    #[serde(default)]
    pub daily_quests: Vec<Quest>,
    #[serde(default)]
    pub xp_history: Vec<XpHistoryEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A daily quest with monotone progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    pub id: String,
    #[serde(default)]
    pub progress: i64,
    #[serde(default)]
    pub target: i64,
    #[serde(default)]
    pub completed: bool,
}

/// XP earned on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpHistoryEntry {
    pub date: String,
    pub xp: i64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_task_updated_falls_back_to_created() {
        let mut task = Task::new("t1", "buy milk", at(1_000));
        assert_eq!(task.updated_millis(), 1_000);

        task.complete(at(5_000));
        assert_eq!(task.updated_millis(), 5_000);
        assert_eq!(task.created_millis(), 1_000);
    }

    #[test]
    fn test_task_wire_format_is_camel_case() {
        let task = Task::new("t1", "buy milk", at(0));
        let value = serde_json::to_value(&task).unwrap();

        assert!(value.get("createdAt").is_some());
        assert!(value.get("updatedAt").is_none());
    }

    #[test]
    fn test_progress_state_keeps_unknown_fields() {
        let json = serde_json::json!({
            "totalXp": 10,
            "streak": 4,
        });
        let state: ProgressState = serde_json::from_value(json).unwrap();

        assert_eq!(state.total_xp, 10);
        assert_eq!(state.extra.get("streak"), Some(&Value::from(4)));

        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["streak"], 4);
    }
}
