//! Keyed record storage behind the trace engine.
//!
//! Records are JSON values addressed by a namespace (`group_id`) and an id.
//! [`MemoryStore`] keeps them in process; [`SqliteStore`] persists them in a
//! single `records` table.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;

/// Namespace holding traces, keyed by trace id.
pub const TRACES: &str = "traces";
/// Namespace holding group records, keyed by correlation id.
pub const GROUPS: &str = "groups";

/// Errors from trace store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Lock error")]
    Lock,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keyed persistence used by the engine.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Inserts or replaces a record and returns what was stored.
    async fn set(&self, group_id: &str, id: &str, data: Value) -> Result<Value, StoreError>;

    /// Removes a record, returning it if it existed.
    async fn delete(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// All records in a namespace, in no particular order.
    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory
// ─────────────────────────────────────────────────────────────────────────────

/// Process-local store; the default for tests and single-process runs.
#[derive(Default)]
pub struct MemoryStore {
    groups: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let groups = self.groups.read().await;
        Ok(groups.get(group_id).and_then(|g| g.get(id)).cloned())
    }

    async fn set(&self, group_id: &str, id: &str, data: Value) -> Result<Value, StoreError> {
        let mut groups = self.groups.write().await;
        groups
            .entry(group_id.to_string())
            .or_default()
            .insert(id.to_string(), data.clone());
        Ok(data)
    }

    async fn delete(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let mut groups = self.groups.write().await;
        Ok(groups.get_mut(group_id).and_then(|g| g.remove(id)))
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StoreError> {
        let groups = self.groups.read().await;
        Ok(groups
            .get(group_id)
            .map(|g| g.values().cloned().collect())
            .unwrap_or_default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed record storage.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const RECORDS_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        group_id TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        updated_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
        PRIMARY KEY (group_id, id)
    );
"#;

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an open connection, creating the `records` table if missing.
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(RECORDS_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM records WHERE group_id = ?1 AND id = ?2",
                params![group_id, id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, group_id: &str, id: &str, data: Value) -> Result<Value, StoreError> {
        let json = serde_json::to_string(&data)?;
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        conn.execute(
            r#"INSERT INTO records (group_id, id, data) VALUES (?1, ?2, ?3)
               ON CONFLICT (group_id, id) DO UPDATE SET
               data = excluded.data,
               updated_at = CAST(strftime('%s', 'now') AS INTEGER)"#,
            params![group_id, id, json],
        )?;

        Ok(data)
    }

    async fn delete(&self, group_id: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let data: Option<String> = conn
            .query_row(
                "DELETE FROM records WHERE group_id = ?1 AND id = ?2 RETURNING data",
                params![group_id, id],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<Value>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Lock)?;

        let mut stmt = conn.prepare("SELECT data FROM records WHERE group_id = ?1")?;
        let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }

        Ok(records)
    }
}
