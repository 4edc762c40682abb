//! # System State Repository
//!
//! Key/value slots for engine bookkeeping: device id, persisted sync log.
//! Kept out of `records` so nothing here is ever observed or synchronized.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::error::DbResult;

/// Repository for the `system_state` table.
#[derive(Debug, Clone)]
pub struct SystemStateRepository {
    pool: SqlitePool,
}

impl SystemStateRepository {
    /// Creates a new SystemStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SystemStateRepository { pool }
    }

    /// Reads one slot.
    pub async fn get(&self, key: &str) -> DbResult<Option<Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM system_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        raw.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(Into::into)
    }

    /// Writes one slot.
    pub async fn set(&self, key: &str, value: &Value) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO system_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes one slot.
    pub async fn remove(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM system_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lists every slot, ordered by key.
    pub async fn list(&self) -> DbResult<Vec<(String, Value)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM system_state ORDER BY key")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(key, text)| -> DbResult<(String, Value)> {
                Ok((key, serde_json::from_str(&text)?))
            })
            .collect()
    }
}
