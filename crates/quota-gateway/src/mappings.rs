//! Key -> namespace mappings.
//!
//! A mapping is written once, when a previously unseen API key is validated
//! against the upstream, and read on every later request carrying that key.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row, params};

use crate::store::{MappingStore, SqliteStore, StoreError};

/// One provisioned API key and the namespace it bills against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapping {
    pub key: String,
    pub namespace: String,
    /// Epoch milliseconds of the first provisioning write.
    pub created_at: i64,
    /// Epoch milliseconds of the latest write.
    pub updated_at: i64,
}

impl KeyMapping {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            namespace: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl MappingStore for SqliteStore {
    async fn namespace_for_key(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_owned();
        self.run(move |conn| {
            let namespace = conn
                .query_row(
                    "SELECT namespace FROM key_mappings WHERE key = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(namespace)
        })
        .await
    }

    async fn upsert_mapping(&self, key: &str, namespace: &str) -> Result<(), StoreError> {
        let (key, namespace) = (key.to_owned(), namespace.to_owned());
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO key_mappings (key, namespace, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    namespace = excluded.namespace,
                    updated_at = excluded.updated_at
                "#,
                params![key, namespace, now_ms()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_by_namespace(&self, namespace: &str) -> Result<Vec<KeyMapping>, StoreError> {
        let namespace = namespace.to_owned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, namespace, created_at, updated_at FROM key_mappings WHERE namespace = ?1 ORDER BY created_at",
            )?;
            let mappings = stmt
                .query_map([&namespace], KeyMapping::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(mappings)
        })
        .await
    }
}

// ============================================================================
// Administrative operations
// ============================================================================

impl SqliteStore {
    /// Point an existing key at a different namespace.
    pub async fn update_mapping(&self, key: &str, namespace: &str) -> Result<(), StoreError> {
        let (key, namespace) = (key.to_owned(), namespace.to_owned());
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE key_mappings SET namespace = ?2, updated_at = ?3 WHERE key = ?1",
                params![key, namespace, now_ms()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(key));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_mapping(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_owned();
        self.run(move |conn| {
            let changed = conn.execute("DELETE FROM key_mappings WHERE key = ?1", [&key])?;
            if changed == 0 {
                return Err(StoreError::NotFound(key));
            }
            Ok(())
        })
        .await
    }

    pub async fn key_exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_owned();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM key_mappings WHERE key = ?1",
                [&key],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    pub async fn count_keys_by_namespace(&self, namespace: &str) -> Result<i64, StoreError> {
        let namespace = namespace.to_owned();
        self.run(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM key_mappings WHERE namespace = ?1",
                [&namespace],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    /// Page through all mappings, newest first.
    pub async fn list_mappings(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<KeyMapping>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT key, namespace, created_at, updated_at FROM key_mappings
                ORDER BY created_at DESC, key
                LIMIT ?1 OFFSET ?2
                "#,
            )?;
            let mappings = stmt
                .query_map(params![limit, offset], KeyMapping::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(mappings)
        })
        .await
    }
}
