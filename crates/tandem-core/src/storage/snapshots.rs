//! Document snapshots
//!
//! A snapshot is the materialized document at a version. The
//! [`SnapshotEngine`] rebuilds any version from the nearest earlier snapshot
//! plus the change log, so the log never has to be replayed from scratch.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::changes::{open_connection, open_memory_connection, ChangeStore, SharedConnection};
use super::error::{StorageError, StorageResult};
use crate::error::{CollabError, CollabResult};
use crate::model::Document;

/// Document state at a version
///
/// `data` is the CBOR-encoded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub doc_id: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn new(doc_id: impl Into<String>, version: u64, document: &Document) -> StorageResult<Self> {
        let doc_id = doc_id.into();
        let mut data = Vec::new();
        ciborium::into_writer(document, &mut data).map_err(|e| StorageError::Corrupt {
            doc_id: doc_id.clone(),
            details: format!("CBOR encoding failed: {}", e),
        })?;
        Ok(Self {
            doc_id,
            version,
            created_at: Utc::now(),
            data,
        })
    }

    /// Decode the stored document
    pub fn document(&self) -> StorageResult<Document> {
        ciborium::from_reader(self.data.as_slice()).map_err(|e| StorageError::Corrupt {
            doc_id: self.doc_id.clone(),
            details: format!("snapshot {} is unreadable: {}", self.version, e),
        })
    }

    /// Encode the whole record (for export)
    pub fn to_cbor(&self) -> StorageResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| StorageError::Corrupt {
            doc_id: self.doc_id.clone(),
            details: format!("CBOR encoding failed: {}", e),
        })?;
        Ok(bytes)
    }

    pub fn from_cbor(bytes: &[u8]) -> StorageResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| StorageError::Corrupt {
            doc_id: String::new(),
            details: format!("CBOR decoding failed: {}", e),
        })
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a snapshot, replacing one at the same version
    async fn save_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()>;

    async fn get_snapshot(&self, doc_id: &str, version: u64) -> StorageResult<Option<Snapshot>>;

    /// Versions with a stored snapshot, ascending
    async fn get_versions(&self, doc_id: &str) -> StorageResult<Vec<u64>>;

    /// Returns false if there was no such snapshot
    async fn delete_snapshot(&self, doc_id: &str, version: u64) -> StorageResult<bool>;
}

/// In-memory snapshot store
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    docs: RwLock<HashMap<String, BTreeMap<u64, Snapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()> {
        self.docs
            .write()
            .await
            .entry(snapshot.doc_id.clone())
            .or_default()
            .insert(snapshot.version, snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, doc_id: &str, version: u64) -> StorageResult<Option<Snapshot>> {
        let docs = self.docs.read().await;
        Ok(docs.get(doc_id).and_then(|s| s.get(&version)).cloned())
    }

    async fn get_versions(&self, doc_id: &str) -> StorageResult<Vec<u64>> {
        let docs = self.docs.read().await;
        Ok(docs
            .get(doc_id)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn delete_snapshot(&self, doc_id: &str, version: u64) -> StorageResult<bool> {
        let mut docs = self.docs.write().await;
        Ok(docs
            .get_mut(doc_id)
            .and_then(|s| s.remove(&version))
            .is_some())
    }
}

/// SQLite-backed snapshot store
pub struct SqliteSnapshotStore {
    conn: SharedConnection,
}

impl SqliteSnapshotStore {
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

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let snapshot = snapshot.clone();
        self.conn
            .run(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO snapshots (doc_id, version, data, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        snapshot.doc_id,
                        snapshot.version as i64,
                        snapshot.data,
                        snapshot.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get_snapshot(&self, doc_id: &str, version: u64) -> StorageResult<Option<Snapshot>> {
        let doc_id = doc_id.to_string();
        self.conn
            .run(move |conn| {
                let row: Option<(Vec<u8>, i64)> = conn
                    .query_row(
                        "SELECT data, created_at FROM snapshots WHERE doc_id = ?1 AND version = ?2",
                        params![doc_id, version as i64],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                Ok(row.map(|(data, created_at)| Snapshot {
                    doc_id,
                    version,
                    created_at: Utc
                        .timestamp_millis_opt(created_at)
                        .single()
                        .unwrap_or_else(Utc::now),
                    data,
                }))
            })
            .await
    }

    async fn get_versions(&self, doc_id: &str) -> StorageResult<Vec<u64>> {
        let doc_id = doc_id.to_string();
        self.conn
            .run(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT version FROM snapshots WHERE doc_id = ? ORDER BY version")?;
                let rows = stmt.query_map([doc_id], |row| row.get::<_, i64>(0))?;
                let mut versions = Vec::new();
                for version in rows {
                    versions.push(version? as u64);
                }
                Ok(versions)
            })
            .await
    }

    async fn delete_snapshot(&self, doc_id: &str, version: u64) -> StorageResult<bool> {
        let doc_id = doc_id.to_string();
        self.conn
            .run(move |conn| {
                let count = conn.execute(
                    "DELETE FROM snapshots WHERE doc_id = ?1 AND version = ?2",
                    params![doc_id, version as i64],
                )?;
                Ok(count > 0)
            })
            .await
    }
}

/// Rebuilds documents from snapshots and the change log
pub struct SnapshotEngine<C, S> {
    changes: Arc<C>,
    snapshots: Arc<S>,
}

impl<C: ChangeStore, S: SnapshotStore> SnapshotEngine<C, S> {
    pub fn new(changes: Arc<C>, snapshots: Arc<S>) -> Self {
        Self { changes, snapshots }
    }

    /// Document at `version` (the current version when `None`)
    ///
    /// Returns the document and the version it represents.
    pub async fn get_document(
        &self,
        doc_id: &str,
        version: Option<u64>,
    ) -> CollabResult<(Document, u64)> {
        let current = self.changes.get_version(doc_id).await?;
        let target = version.unwrap_or(current);
        if target > current {
            return Err(CollabError::VersionMismatch {
                doc_id: doc_id.to_string(),
                client: target,
                server: current,
            });
        }

        let base = self
            .snapshots
            .get_versions(doc_id)
            .await?
            .into_iter()
            .filter(|v| *v <= target)
            .max();
        let (mut document, base_version) = match base {
            Some(v) => match self.snapshots.get_snapshot(doc_id, v).await? {
                Some(snapshot) => (snapshot.document()?, v),
                None => (Document::new(), 0),
            },
            None => (Document::new(), 0),
        };

        let (changes, _) = self
            .changes
            .get_changes(doc_id, base_version, Some(target))
            .await?;
        debug!(
            "Rebuilding '{}' at {} from snapshot {} plus {} changes",
            doc_id,
            target,
            base_version,
            changes.len()
        );
        for change in &changes {
            document.apply_change(change)?;
        }
        Ok((document, target))
    }

    /// Materialize and store a snapshot
    pub async fn create_snapshot(
        &self,
        doc_id: &str,
        version: Option<u64>,
    ) -> CollabResult<Snapshot> {
        let (document, version) = self.get_document(doc_id, version).await?;
        let snapshot = Snapshot::new(doc_id, version, &document)?;
        self.snapshots.save_snapshot(&snapshot).await?;
        Ok(snapshot)
    }

    /// Remove every snapshot of a document; returns how many were removed
    pub async fn delete_snapshots(&self, doc_id: &str) -> CollabResult<usize> {
        let mut removed = 0;
        for version in self.snapshots.get_versions(doc_id).await? {
            if self.snapshots.delete_snapshot(doc_id, version).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
