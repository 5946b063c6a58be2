//! Snapshot command handler

use std::path::PathBuf;

use anyhow::{Context, Result};

use tandem_core::storage::SnapshotEngine;
use tandem_core::Config;

use super::open_stores;
use crate::output::Output;

/// Materialize a document, optionally storing or exporting it
pub async fn show(
    config: &Config,
    doc_id: String,
    version: Option<u64>,
    save: bool,
    export: Option<PathBuf>,
    output: &Output,
) -> Result<()> {
    let (changes, snapshots) = open_stores(config)?;
    let engine = SnapshotEngine::new(changes, snapshots);

    let (document, version) = engine
        .get_document(&doc_id, version)
        .await
        .with_context(|| format!("Failed to rebuild '{}'", doc_id))?;

    if let Some(path) = export {
        let content = serde_json::to_string_pretty(&document)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {:?}", path))?;
        output.success(&format!(
            "Exported '{}' at version {} to {}",
            doc_id,
            version,
            path.display()
        ));
    } else {
        output.print_document(&doc_id, version, &document)?;
    }

    if save {
        let snapshot = engine.create_snapshot(&doc_id, Some(version)).await?;
        output.success(&format!(
            "Saved snapshot of '{}' at version {} ({} bytes)",
            doc_id,
            snapshot.version,
            snapshot.data.len()
        ));
    }
    Ok(())
}
