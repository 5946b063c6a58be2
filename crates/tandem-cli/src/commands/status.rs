//! Status command handler

use anyhow::Result;

use tandem_core::{ChangeStore, Config};

use super::open_stores;
use crate::output::{Output, OutputFormat};

/// Show where data lives and which documents it holds
pub async fn show(config: &Config, output: &Output) -> Result<()> {
    let (changes, _) = open_stores(config)?;
    let documents = changes.list_documents().await?;
    let db_path = config.database_path();
    let db_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    match output.format {
        OutputFormat::Json => {
            let docs: Vec<_> = documents
                .iter()
                .map(|(id, version)| serde_json::json!({"doc_id": id, "version": version}))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "listen_addr": config.listen_addr,
                    "server_url": config.server_url,
                    "auth_required": config.auth_token.is_some(),
                    "database": db_path,
                    "database_size": db_size,
                    "documents": docs
                }))?
            );
        }
        OutputFormat::Quiet => {
            for (id, _) in &documents {
                println!("{}", id);
            }
        }
        OutputFormat::Human => {
            println!("Tandem Status");
            println!("=============");
            println!();
            println!("Hub:");
            println!("  Listen: {}", config.listen_addr);
            println!(
                "  Auth:   {}",
                if config.auth_token.is_some() {
                    "token required"
                } else {
                    "open"
                }
            );
            if let Some(ref url) = config.server_url {
                println!("  Server: {}", url);
            }
            println!();
            println!("Storage:");
            println!("  Database: {}", db_path.display());
            println!("  Size:     {}", human_size(db_size));
            println!();
            println!("Documents ({}):", documents.len());
            for (id, version) in &documents {
                println!("  {} @ {}", id, version);
            }
        }
    }

    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
