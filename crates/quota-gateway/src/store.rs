//! SQLite-backed persistence for key mappings and usage records.
//!
//! The store owns a single connection behind a mutex. Every operation runs
//! exactly one statement on tokio's blocking pool and is awaited by the
//! caller, so independent operations (for example a count followed by an
//! insert) commit separately and are never wrapped in a shared transaction.
//! An operation whose caller has gone away before it reached the connection
//! is skipped.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use thiserror::Error;

use crate::mappings::KeyMapping;
use crate::usage::UsageRecord;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS key_mappings (
    key TEXT PRIMARY KEY NOT NULL CHECK (length(key) <= 255),
    namespace TEXT NOT NULL CHECK (length(namespace) <= 255),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_key_mappings_namespace ON key_mappings (namespace);

CREATE TABLE IF NOT EXISTS rate_limit_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL CHECK (length(namespace) <= 255),
    request_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_namespace_timestamp
    ON rate_limit_records (namespace, request_time);
"#;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store connection lock poisoned")]
    Poisoned,

    /// An administrative mutation targeted a key that has no mapping.
    #[error("key '{0}' not found")]
    NotFound(String),

    #[error("store operation cancelled")]
    Cancelled,

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ============================================================================
// Adapter Traits
// ============================================================================

/// Typed access to the key -> namespace table.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Namespace for `key`, or `None` when the key has never been provisioned.
    async fn namespace_for_key(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite the mapping for `key`. Safe to repeat.
    async fn upsert_mapping(&self, key: &str, namespace: &str) -> Result<(), StoreError>;

    async fn list_by_namespace(&self, namespace: &str) -> Result<Vec<KeyMapping>, StoreError>;
}

/// Typed access to the usage-record table. Windows are inclusive on both ends
/// and expressed in epoch milliseconds.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert a record and return its id.
    async fn insert_usage(&self, namespace: &str, request_time_ms: i64)
    -> Result<i64, StoreError>;

    /// Delete a record by id. Returns `false` when no row matched.
    async fn delete_usage(&self, id: i64) -> Result<bool, StoreError>;

    async fn count_in_window(
        &self,
        namespace: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<i64, StoreError>;

    /// Timestamp of the earliest record in the window, if any.
    async fn earliest_in_window(
        &self,
        namespace: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Option<i64>, StoreError>;

    async fn records_in_window(
        &self,
        namespace: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<UsageRecord>, StoreError>;
}

// ============================================================================
// SQLite Store
// ============================================================================

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

/// Marks an operation abandoned when its future is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        log::debug!("store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    pub(crate) async fn run<F, T>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let cancelled = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(Arc::clone(&cancelled));

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            if cancelled.load(Ordering::Acquire) {
                return Err(StoreError::Cancelled);
            }
            op(&conn)
        })
        .await?
    }
}
