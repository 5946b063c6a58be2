//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;
use tandem_core::{Change, Document};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Print a document's change log
    pub fn print_changes(&self, doc_id: &str, changes: &[Change]) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Human => {
                if changes.is_empty() {
                    println!("No changes for '{}'.", doc_id);
                    return Ok(());
                }
                for change in changes {
                    println!(
                        "{:>5} | {} | {} | {} op(s){}",
                        change
                            .info
                            .version
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        short_id(&change.id),
                        change.info.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        change.ops.len(),
                        change
                            .session_id
                            .as_deref()
                            .map(|s| format!(" | session {}", short_id(s)))
                            .unwrap_or_default()
                    );
                }
                println!("\n{} change(s)", changes.len());
            }
            OutputFormat::Json => self.json(changes)?,
            OutputFormat::Quiet => {
                for change in changes {
                    println!("{}", change.id);
                }
            }
        }
        Ok(())
    }

    /// Print a materialized document
    pub fn print_document(
        &self,
        doc_id: &str,
        version: u64,
        document: &Document,
    ) -> anyhow::Result<()> {
        match self.format {
            OutputFormat::Human => {
                println!("Document: {}", doc_id);
                println!("Version:  {}", version);
                println!("Nodes:    {}", document.node_count());
                println!();
                println!("{}", serde_json::to_string_pretty(document)?);
            }
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "doc_id": doc_id,
                    "version": version,
                    "document": document,
                }))?
            ),
            OutputFormat::Quiet => println!("{}", version),
        }
        Ok(())
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// First eight characters of an id
fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}
