//! # Record Repository
//!
//! CRUD over the `records` table. One row per `(collection, key)`.

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Repository for synchronized application records.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    /// Creates a new RecordRepository.
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Reads one record.
    pub async fn get(&self, collection: &str, key: &str) -> DbResult<Option<Value>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM records WHERE collection = ? AND key = ?")
                .bind(collection)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        raw.map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(Into::into)
    }

    /// Inserts or replaces one record.
    pub async fn upsert(&self, collection: &str, key: &str, value: &Value) -> DbResult<()> {
        let text = serde_json::to_string(value)?;

        sqlx::query(
            r#"
            INSERT INTO records (collection, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (collection, key)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(collection, key, "Record upserted");
        Ok(())
    }

    /// Deletes one record. Returns true if a row was removed.
    pub async fn delete(&self, collection: &str, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = ? AND key = ?")
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists every record of a collection, ordered by key.
    pub async fn list(&self, collection: &str) -> DbResult<Vec<(String, Value)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM records WHERE collection = ? ORDER BY key")
                .bind(collection)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(key, text)| -> DbResult<(String, Value)> {
                Ok((key, serde_json::from_str(&text)?))
            })
            .collect()
    }

    /// Counts records in a collection.
    pub async fn count(&self, collection: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
