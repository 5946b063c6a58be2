//! Config command handlers

use anyhow::{Context, Result};

use tandem_core::Config;

use crate::output::{Output, OutputFormat};

fn or_unset(value: Option<&str>) -> &str {
    value.unwrap_or("(not set)")
}

/// Show current configuration
pub fn show(output: &Output) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": config.data_dir,
                    "listen_addr": config.listen_addr,
                    "server_url": config.server_url,
                    "auth_token": config.auth_token.as_ref().map(|_| "********"),
                    "tick_interval_ms": config.tick_interval_ms,
                    "selection_debounce_ms": config.selection_debounce_ms,
                    "initial_reconnect_delay_ms": config.initial_reconnect_delay_ms,
                    "max_reconnect_delay_ms": config.max_reconnect_delay_ms,
                    "history_limit": config.history_limit,
                    "log_file": config.log_file
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:                   {}", config.data_dir.display());
            println!("  listen_addr:                {}", config.listen_addr);
            println!(
                "  server_url:                 {}",
                or_unset(config.server_url.as_deref())
            );
            println!(
                "  auth_token:                 {}",
                or_unset(config.auth_token.as_ref().map(|_| "********"))
            );
            println!("  tick_interval_ms:           {}", config.tick_interval_ms);
            println!("  selection_debounce_ms:      {}", config.selection_debounce_ms);
            println!(
                "  initial_reconnect_delay_ms: {}",
                config.initial_reconnect_delay_ms
            );
            println!("  max_reconnect_delay_ms:     {}", config.max_reconnect_delay_ms);
            println!("  history_limit:              {}", config.history_limit);
            println!(
                "  log_file:                   {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", Config::config_file_path().display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(key: String, value: String, output: &Output) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    config.set(&key, &value)?;
    config.save().context("Failed to save configuration")?;

    let shown = if key == "auth_token" && !value.is_empty() {
        "********"
    } else {
        value.as_str()
    };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}
