//! Command handlers

pub mod changes;
pub mod config;
pub mod serve;
pub mod snapshot;
pub mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use tandem_core::storage::{SqliteChangeStore, SqliteSnapshotStore};
use tandem_core::Config;

/// Open the change log and snapshot store in the configured data directory
pub fn open_stores(config: &Config) -> Result<(Arc<SqliteChangeStore>, Arc<SqliteSnapshotStore>)> {
    let path = config.database_path();
    let changes = SqliteChangeStore::open(&path)
        .with_context(|| format!("Failed to open change log at {:?}", path))?;
    let snapshots = SqliteSnapshotStore::open(&path)
        .with_context(|| format!("Failed to open snapshot store at {:?}", path))?;
    Ok((Arc::new(changes), Arc::new(snapshots)))
}
