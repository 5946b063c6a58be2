//! Change log persistence
//!
//! Every document has an append-only log of accepted changes. The change at
//! version `n` is the `n`-th accepted change, so the current version equals
//! the log length.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::RwLock;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use crate::model::Change;

/// Append-only change log, keyed by document id
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Append a change and return the version it produced
    ///
    /// If the change is stamped with a version, it must be the next one.
    async fn add_change(&self, doc_id: &str, change: &Change) -> StorageResult<u64>;

    /// Changes with `since < version <= until` (until defaults to the
    /// current version), plus the current version
    async fn get_changes(
        &self,
        doc_id: &str,
        since: u64,
        until: Option<u64>,
    ) -> StorageResult<(Vec<Change>, u64)>;

    /// Current version; 0 for unknown documents
    async fn get_version(&self, doc_id: &str) -> StorageResult<u64>;

    /// Drop a document's log and return how many changes were removed
    async fn delete_changes(&self, doc_id: &str) -> StorageResult<usize>;

    /// Version of the change with the given id, if it was accepted
    async fn find_change(&self, doc_id: &str, change_id: &str) -> StorageResult<Option<u64>>;

    /// Known documents and their versions
    async fn list_documents(&self) -> StorageResult<Vec<(String, u64)>>;
}

fn check_next_version(doc_id: &str, change: &Change, current: u64) -> StorageResult<u64> {
    let next = current + 1;
    match change.info.version {
        Some(version) if version != next => Err(StorageError::VersionConflict {
            doc_id: doc_id.to_string(),
            version,
            current,
        }),
        _ => Ok(next),
    }
}

/// In-memory change store
#[derive(Debug, Default)]
pub struct MemoryChangeStore {
    docs: RwLock<HashMap<String, Vec<Change>>>,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangeStore for MemoryChangeStore {
    async fn add_change(&self, doc_id: &str, change: &Change) -> StorageResult<u64> {
        let mut docs = self.docs.write().await;
        let log = docs.entry(doc_id.to_string()).or_default();
        let version = check_next_version(doc_id, change, log.len() as u64)?;
        let mut change = change.clone();
        change.info.version = Some(version);
        log.push(change);
        Ok(version)
    }

    async fn get_changes(
        &self,
        doc_id: &str,
        since: u64,
        until: Option<u64>,
    ) -> StorageResult<(Vec<Change>, u64)> {
        let docs = self.docs.read().await;
        let Some(log) = docs.get(doc_id) else {
            return Ok((Vec::new(), 0));
        };
        let current = log.len();
        let end = until.map_or(current, |u| (u as usize).min(current));
        let start = (since as usize).min(end);
        Ok((log[start..end].to_vec(), current as u64))
    }

    async fn get_version(&self, doc_id: &str) -> StorageResult<u64> {
        let docs = self.docs.read().await;
        Ok(docs.get(doc_id).map_or(0, |log| log.len() as u64))
    }

    async fn delete_changes(&self, doc_id: &str) -> StorageResult<usize> {
        let mut docs = self.docs.write().await;
        Ok(docs.remove(doc_id).map_or(0, |log| log.len()))
    }

    async fn find_change(&self, doc_id: &str, change_id: &str) -> StorageResult<Option<u64>> {
        let docs = self.docs.read().await;
        Ok(docs.get(doc_id).and_then(|log| {
            log.iter()
                .position(|c| c.id == change_id)
                .map(|idx| idx as u64 + 1)
        }))
    }

    async fn list_documents(&self) -> StorageResult<Vec<(String, u64)>> {
        let docs = self.docs.read().await;
        let mut list: Vec<_> = docs
            .iter()
            .map(|(id, log)| (id.clone(), log.len() as u64))
            .collect();
        list.sort();
        Ok(list)
    }
}

/// Open a database file, creating its directory and schema as needed
pub(crate) fn open_connection(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }
    }
    let conn = Connection::open(path)?;
    if needs_init(&conn) {
        init_schema(&conn)?;
    }
    Ok(conn)
}

pub(crate) fn open_memory_connection() -> StorageResult<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// SQLite connection shared by a store
///
/// rusqlite calls block, so every query runs on tokio's blocking pool.
#[derive(Clone)]
pub(crate) struct SharedConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    pub(crate) fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub(crate) async fn run<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await?
    }
}

/// SQLite-backed change store
pub struct SqliteChangeStore {
    conn: SharedConnection,
}

impl SqliteChangeStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        Ok(Self {
            conn: SharedConnection::new(open_connection(path)?),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self {
            conn: SharedConnection::new(open_memory_connection()?),
        })
    }
}

fn current_version(conn: &Connection, doc_id: &str) -> StorageResult<u64> {
    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM changes WHERE doc_id = ?",
        [doc_id],
        |row| row.get(0),
    )?;
    Ok(version as u64)
}

fn decode_change(doc_id: &str, json: &str) -> StorageResult<Change> {
    serde_json::from_str(json).map_err(|e| StorageError::Corrupt {
        doc_id: doc_id.to_string(),
        details: e.to_string(),
    })
}

#[async_trait]
impl ChangeStore for SqliteChangeStore {
    async fn add_change(&self, doc_id: &str, change: &Change) -> StorageResult<u64> {
        let doc_id = doc_id.to_string();
        let mut change = change.clone();
        self.conn
            .run(move |conn| {
                let tx = conn.transaction()?;
                let version =
                    check_next_version(&doc_id, &change, current_version(&tx, &doc_id)?)?;

                change.info.version = Some(version);
                tx.execute(
                    "INSERT INTO changes (doc_id, version, change_id, change_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        doc_id,
                        version as i64,
                        change.id,
                        serde_json::to_string(&change)?,
                        change.info.timestamp.timestamp_millis(),
                    ],
                )?;
                tx.commit()?;
                Ok(version)
            })
            .await
    }

    async fn get_changes(
        &self,
        doc_id: &str,
        since: u64,
        until: Option<u64>,
    ) -> StorageResult<(Vec<Change>, u64)> {
        let doc_id = doc_id.to_string();
        self.conn
            .run(move |conn| {
                let current = current_version(conn, &doc_id)?;
                let until = until.map_or(current, |u| u.min(current));

                let mut stmt = conn.prepare(
                    "SELECT change_json FROM changes
                     WHERE doc_id = ?1 AND version > ?2 AND version <= ?3
                     ORDER BY version",
                )?;
                let rows = stmt.query_map(params![doc_id, since as i64, until as i64], |row| {
                    row.get::<_, String>(0)
                })?;

                let mut changes = Vec::new();
                for json in rows {
                    changes.push(decode_change(&doc_id, &json?)?);
                }
                Ok((changes, current))
            })
            .await
    }

    async fn get_version(&self, doc_id: &str) -> StorageResult<u64> {
        let doc_id = doc_id.to_string();
        self.conn
            .run(move |conn| current_version(conn, &doc_id))
            .await
    }

    async fn delete_changes(&self, doc_id: &str) -> StorageResult<usize> {
        let doc_id = doc_id.to_string();
        self.conn
            .run(move |conn| Ok(conn.execute("DELETE FROM changes WHERE doc_id = ?", [doc_id])?))
            .await
    }

    async fn find_change(&self, doc_id: &str, change_id: &str) -> StorageResult<Option<u64>> {
        let doc_id = doc_id.to_string();
        let change_id = change_id.to_string();
        self.conn
            .run(move |conn| {
                let version: Option<i64> = conn
                    .query_row(
                        "SELECT version FROM changes WHERE doc_id = ?1 AND change_id = ?2",
                        params![doc_id, change_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(version.map(|v| v as u64))
            })
            .await
    }

    async fn list_documents(&self) -> StorageResult<Vec<(String, u64)>> {
        self.conn
            .run(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT doc_id, MAX(version) FROM changes GROUP BY doc_id ORDER BY doc_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }
}
