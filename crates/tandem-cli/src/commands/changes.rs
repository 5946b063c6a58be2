//! Change log command handlers

use anyhow::{bail, Result};
use std::io::{self, Write};

use tandem_core::storage::SnapshotEngine;
use tandem_core::{ChangeStore, Config};

use super::open_stores;
use crate::output::{Output, OutputFormat};

/// List the changes of a document
pub async fn list(
    config: &Config,
    doc_id: String,
    since: u64,
    until: Option<u64>,
    output: &Output,
) -> Result<()> {
    let (changes, _) = open_stores(config)?;
    let (log, _) = changes.get_changes(&doc_id, since, until).await?;
    output.print_changes(&doc_id, &log)
}

/// Show the current version of a document
pub async fn version(config: &Config, doc_id: String, output: &Output) -> Result<()> {
    let (changes, _) = open_stores(config)?;
    let version = changes.get_version(&doc_id).await?;

    match output.format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({"doc_id": doc_id, "version": version})
        ),
        OutputFormat::Quiet => println!("{}", version),
        OutputFormat::Human => println!("{} is at version {}", doc_id, version),
    }
    Ok(())
}

/// Delete a document's change log and snapshots
pub async fn reset(config: &Config, doc_id: String, force: bool, output: &Output) -> Result<()> {
    let (changes, snapshots) = open_stores(config)?;
    let version = changes.get_version(&doc_id).await?;
    if version == 0 {
        bail!("Document '{}' has no changes", doc_id);
    }

    if !force && output.should_prompt() {
        print!(
            "Delete all {} change(s) and snapshots of '{}'? [y/N] ",
            version, doc_id
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            output.message("Cancelled.");
            return Ok(());
        }
    }

    let engine = SnapshotEngine::new(changes.clone(), snapshots);
    let removed_snapshots = engine.delete_snapshots(&doc_id).await?;
    let removed = changes.delete_changes(&doc_id).await?;

    output.success(&format!(
        "Reset '{}' ({} change(s), {} snapshot(s) removed)",
        doc_id, removed, removed_snapshots
    ));
    Ok(())
}
