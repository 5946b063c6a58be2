//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tandem/config.toml)
//! 3. Environment variables (TANDEM_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable prefix
const ENV_PREFIX: &str = "TANDEM";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite change log and snapshots)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address the hub listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Hub URL clients connect to (optional)
    #[serde(default)]
    pub server_url: Option<String>,

    /// Shared secret required from connecting clients (optional)
    #[serde(default)]
    pub auth_token: Option<String>,

    /// How often clients commit buffered edits
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Delay before a selection change is broadcast
    #[serde(default = "default_selection_debounce_ms")]
    pub selection_debounce_ms: u64,

    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Undo levels kept per client (0 = unlimited)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Write logs here instead of stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen_addr: default_listen_addr(),
            server_url: None,
            auth_token: None,
            tick_interval_ms: default_tick_interval_ms(),
            selection_debounce_ms: default_selection_debounce_ms(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            history_limit: default_history_limit(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TANDEM_DATA_DIR, TANDEM_LISTEN_ADDR,
    ///    TANDEM_SERVER_URL, TANDEM_AUTH_TOKEN)
    /// 2. Config file (~/.config/tandem/config.toml or TANDEM_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // TANDEM_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // TANDEM_LISTEN_ADDR
        if let Ok(val) = std::env::var(format!("{}_LISTEN_ADDR", ENV_PREFIX)) {
            if !val.is_empty() {
                self.listen_addr = val;
            }
        }

        // TANDEM_SERVER_URL
        if let Ok(val) = std::env::var(format!("{}_SERVER_URL", ENV_PREFIX)) {
            self.server_url = if val.is_empty() { None } else { Some(val) };
        }

        // TANDEM_AUTH_TOKEN
        if let Ok(val) = std::env::var(format!("{}_AUTH_TOKEN", ENV_PREFIX)) {
            self.auth_token = if val.is_empty() { None } else { Some(val) };
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Update a single setting by name
    ///
    /// Empty values clear optional settings.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let optional = |v: &str| {
            if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            }
        };
        let number = |v: &str| -> Result<u64> {
            v.parse()
                .with_context(|| format!("Invalid value for {}: '{}' is not a number", key, v))
        };

        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "listen_addr" => self.listen_addr = value.to_string(),
            "server_url" => self.server_url = optional(value),
            "auth_token" => self.auth_token = optional(value),
            "tick_interval_ms" => self.tick_interval_ms = number(value)?,
            "selection_debounce_ms" => self.selection_debounce_ms = number(value)?,
            "initial_reconnect_delay_ms" => self.initial_reconnect_delay_ms = number(value)?,
            "max_reconnect_delay_ms" => self.max_reconnect_delay_ms = number(value)?,
            "history_limit" => self.history_limit = number(value)? as usize,
            "log_file" => self.log_file = optional(value).map(PathBuf::from),
            _ => bail!(
                "Unknown config key: {}. Valid keys: {}",
                key,
                Self::KEYS.join(", ")
            ),
        }
        Ok(())
    }

    /// Settings accepted by [`Config::set`]
    pub const KEYS: &'static [&'static str] = &[
        "data_dir",
        "listen_addr",
        "server_url",
        "auth_token",
        "tick_interval_ms",
        "selection_debounce_ms",
        "initial_reconnect_delay_ms",
        "max_reconnect_delay_ms",
        "history_limit",
        "log_file",
    ];

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TANDEM_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tandem")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("tandem.db")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tandem")
}

fn default_listen_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_selection_debounce_ms() -> u64 {
    250
}

fn default_initial_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_history_limit() -> usize {
    crate::history::DEFAULT_MAX_LEVELS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that touch environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Guard that locks env access and saves/restores env vars
    struct EnvGuard<'a> {
        _lock: std::sync::MutexGuard<'a, ()>,
        saved: Vec<(String, Option<String>)>,
    }

    impl<'a> EnvGuard<'a> {
        fn new(vars: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in vars {
                env::remove_var(name);
            }
            Self { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard<'_> {
        fn drop(&mut self) {
            for (name, value) in &self.saved {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    const ENV_VARS: &[&str] = &[
        "TANDEM_DATA_DIR",
        "TANDEM_LISTEN_ADDR",
        "TANDEM_SERVER_URL",
        "TANDEM_AUTH_TOKEN",
    ];

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:7878");
        assert!(config.server_url.is_none());
        assert!(config.auth_token.is_none());
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.selection_debounce_ms, 250);
        assert_eq!(config.history_limit, 100);
        assert!(config.data_dir.ends_with("tandem"));
        assert!(config.database_path().ends_with("tandem.db"));
    }

    #[test]
    fn test_env_override_data_dir() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TANDEM_DATA_DIR", "/tmp/tandem-test");
        config.apply_env_overrides();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/tandem-test"));
    }

    #[test]
    fn test_env_override_optional_values() {
        let _guard = EnvGuard::new(ENV_VARS);

        let mut config = Config::default();
        env::set_var("TANDEM_SERVER_URL", "ws://localhost:7878");
        env::set_var("TANDEM_AUTH_TOKEN", "secret");
        env::set_var("TANDEM_LISTEN_ADDR", "0.0.0.0:9000");
        config.apply_env_overrides();
        assert_eq!(config.server_url, Some("ws://localhost:7878".to_string()));
        assert_eq!(config.auth_token, Some("secret".to_string()));
        assert_eq!(config.listen_addr, "0.0.0.0:9000");

        // Empty string clears optional values
        env::set_var("TANDEM_SERVER_URL", "");
        env::set_var("TANDEM_AUTH_TOKEN", "");
        config.apply_env_overrides();
        assert!(config.server_url.is_none());
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_load_from_str() {
        let _guard = EnvGuard::new(ENV_VARS);

        let toml = r#"
            data_dir = "/custom/data"
            listen_addr = "0.0.0.0:8080"
            tick_interval_ms = 200
        "#;

        let config = Config::load_from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.tick_interval_ms, 200);
        // Unset keys keep their defaults
        assert_eq!(config.max_reconnect_delay_ms, 30_000);
    }

    #[test]
    fn test_serialization() {
        let config = Config {
            data_dir: PathBuf::from("/data/tandem"),
            server_url: Some("ws://hub.example.com".to_string()),
            log_file: Some(PathBuf::from("/var/log/tandem.log")),
            ..Config::default()
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("server_url"));

        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_path_missing_file() {
        let _guard = EnvGuard::new(ENV_VARS);
        let temp_dir = tempfile::TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        env::set_var("TANDEM_DATA_DIR", &data_dir);

        let path = PathBuf::from("/nonexistent/config.toml");
        let config = Config::load_from_path(&path).unwrap();
        assert!(config.server_url.is_none());
        assert!(data_dir.exists());
    }

    #[test]
    fn test_set() {
        let mut config = Config::default();
        config.set("server_url", "ws://hub:7878").unwrap();
        config.set("tick_interval_ms", "250").unwrap();
        config.set("log_file", "/tmp/tandem.log").unwrap();
        assert_eq!(config.server_url.as_deref(), Some("ws://hub:7878"));
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/tandem.log")));

        config.set("server_url", "").unwrap();
        assert!(config.server_url.is_none());

        assert!(config.set("tick_interval_ms", "soon").is_err());
        let err = config.set("favorite_tag", "x").unwrap_err();
        assert!(err.to_string().contains("Unknown config key"));
    }
}
