//! Per-request usage records.
//!
//! One row is written for every admitted request and removed again if the
//! relayed request fails. The quota window counts these rows.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};

use crate::store::{SqliteStore, StoreError, UsageStore};

/// A single admitted request attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub id: i64,
    pub namespace: String,
    /// Epoch milliseconds.
    pub request_time: i64,
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn insert_usage(
        &self,
        namespace: &str,
        request_time_ms: i64,
    ) -> Result<i64, StoreError> {
        let namespace = namespace.to_owned();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO rate_limit_records (namespace, request_time) VALUES (?1, ?2)",
                params![namespace, request_time_ms],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn delete_usage(&self, id: i64) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute("DELETE FROM rate_limit_records WHERE id = ?1", [id])?;
            Ok(changed > 0)
        })
        .await
    }

    async fn count_in_window(
        &self,
        namespace: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<i64, StoreError> {
        let namespace = namespace.to_owned();
        self.run(move |conn| {
            let count = conn.query_row(
                r#"
                SELECT COUNT(*) FROM rate_limit_records
                WHERE namespace = ?1 AND request_time >= ?2 AND request_time <= ?3
                "#,
                params![namespace, start_ms, end_ms],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    async fn earliest_in_window(
        &self,
        namespace: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Option<i64>, StoreError> {
        let namespace = namespace.to_owned();
        self.run(move |conn| {
            let earliest = conn
                .query_row(
                    r#"
                    SELECT request_time FROM rate_limit_records
                    WHERE namespace = ?1 AND request_time >= ?2 AND request_time <= ?3
                    ORDER BY request_time ASC
                    LIMIT 1
                    "#,
                    params![namespace, start_ms, end_ms],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(earliest)
        })
        .await
    }

    async fn records_in_window(
        &self,
        namespace: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let namespace = namespace.to_owned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, namespace, request_time FROM rate_limit_records
                WHERE namespace = ?1 AND request_time >= ?2 AND request_time <= ?3
                ORDER BY request_time ASC, id ASC
                "#,
            )?;
            let records = stmt
                .query_map(params![namespace, start_ms, end_ms], |row| {
                    Ok(UsageRecord {
                        id: row.get(0)?,
                        namespace: row.get(1)?,
                        request_time: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }
}
