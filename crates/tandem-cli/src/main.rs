//! Tandem CLI
//!
//! Runs the collaboration hub and inspects the documents it stores.

use std::fs::File;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Tandem - real-time collaborative editing hub")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collaboration hub
    Serve {
        /// Address to listen on (overrides listen_addr)
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// List the changes of a document
    #[command(alias = "log")]
    Changes {
        /// Document ID
        doc_id: String,
        /// Only changes after this version
        #[arg(long, default_value_t = 0)]
        since: u64,
        /// Only changes up to this version
        #[arg(long)]
        until: Option<u64>,
    },
    /// Show the current version of a document
    Version {
        /// Document ID
        doc_id: String,
    },
    /// Rebuild a document from its change log
    Snapshot {
        /// Document ID
        doc_id: String,
        /// Version to rebuild (defaults to the latest)
        #[arg(long)]
        version: Option<u64>,
        /// Store the result as a snapshot
        #[arg(long)]
        save: bool,
        /// Write the document as JSON to a file instead of printing it
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Delete a document's change log and snapshots
    Reset {
        /// Document ID
        doc_id: String,
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Show hub settings and stored documents
    Status,
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (see `tandem config show`)
        key: String,
        /// Configuration value (empty clears optional keys)
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands work even when the config file is broken
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(&output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, &output)
            }
        };
    }

    let config = Config::load()?;
    init_logging(&config, &cli.log_level);

    match cli.command {
        Commands::Serve { listen } => commands::serve::run(&config, listen, &output).await,
        Commands::Changes {
            doc_id,
            since,
            until,
        } => commands::changes::list(&config, doc_id, since, until, &output).await,
        Commands::Version { doc_id } => commands::changes::version(&config, doc_id, &output).await,
        Commands::Snapshot {
            doc_id,
            version,
            save,
            export,
        } => commands::snapshot::show(&config, doc_id, version, save, export, &output).await,
        Commands::Reset { doc_id, force } => {
            commands::changes::reset(&config, doc_id, force, &output).await
        }
        Commands::Status => commands::status::show(&config, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

/// Install the tracing subscriber
///
/// Logs go to `log_file` when configured, otherwise stderr. `RUST_LOG`
/// replaces the default filter.
fn init_logging(config: &Config, log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tandem_core={},tandem_cli={}", log_level, log_level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match &config.log_file {
        Some(path) => match File::create(path) {
            Ok(file) => {
                let _ = builder.with_ansi(false).with_writer(file).try_init();
                info!("Logging to {:?}", path);
            }
            Err(e) => {
                eprintln!("Warning: Could not create log file {:?}: {}", path, e);
                let _ = builder.with_writer(std::io::stderr).try_init();
            }
        },
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}
