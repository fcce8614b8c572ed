//! Multi-tier TOML configuration for lspc.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > `--config` file > project file > global file > defaults

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Log level used when nothing else is configured.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Per-request timeout for language servers, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30000;

/// Name of the per-project config file, looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = ".lspc.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn default_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

/// Errors from resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No server named '{name}' is configured")]
    MissingServer { name: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to load config {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

/// Resolved configuration for an lspc run.
#[derive(Debug, Clone)]
pub struct LspcConfig {
    pub log_level: String,
    pub log_json: bool,
    pub servers: BTreeMap<String, ServerConfig>,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: Option<String>,
    pub json: Option<bool>,
}

/// How to launch one language server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Command to run (e.g., "rust-analyzer", "pyright-langserver").
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Timeout for requests in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub request_timeout_ms: u64,
    /// File extensions this server handles, without the leading dot.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// `languageId` sent on `didOpen`. Defaults to the server name.
    pub language_id: Option<String>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// An explicit config file, layered above the project file.
    pub config_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
}

impl SettingsFile {
    /// Layer `other` on top of `self`. Log fields override individually;
    /// a server entry replaces any entry of the same name.
    fn merge(&mut self, other: SettingsFile) {
        if other.log.level.is_some() {
            self.log.level = other.log.level;
        }
        if other.log.json.is_some() {
            self.log.json = other.log.json;
        }
        self.servers.extend(other.servers);
    }
}

impl LspcConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// Precedence (highest to lowest):
    /// 1. CLI flags
    /// 2. Environment variables (`LSPC_LOG`)
    /// 3. The `--config` file
    /// 4. Project config (`./.lspc.toml`)
    /// 5. Global config (`~/.lspc/config.toml`, or `$LSPC_CONFIG_DIR/config.toml`)
    /// 6. Defaults
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load_from(
            overrides,
            &config_dir(),
            &project_root,
            std::env::var("LSPC_LOG").ok(),
        )
    }

    /// [`load`](Self::load) with the directories and environment made explicit.
    pub fn load_from(
        overrides: CliOverrides,
        config_dir: &Path,
        project_root: &Path,
        env_log: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut settings = load_settings_file(&config_dir.join("config.toml"));
        settings.merge(load_settings_file(&project_root.join(PROJECT_CONFIG_FILE)));

        // An explicitly requested file must exist and parse.
        if let Some(path) = &overrides.config_file {
            settings.merge(read_settings_file(path)?);
        }

        // Resolve log level: CLI > env > config file > default
        let log_level = overrides
            .log_level
            .or(env_log)
            .or(settings.log.level)
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
            .to_ascii_lowercase();
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "log.level".into(),
                value: log_level,
            });
        }

        let log_json = overrides.log_json.or(settings.log.json).unwrap_or(false);

        for (name, server) in &settings.servers {
            validate_server(name, server)?;
        }

        Ok(LspcConfig {
            log_level,
            log_json,
            servers: settings.servers.into_iter().collect(),
            config_dir: config_dir.to_path_buf(),
        })
    }

    /// Look up a server by name.
    pub fn server(&self, name: &str) -> Result<&ServerConfig, ConfigError> {
        self.servers
            .get(name)
            .ok_or_else(|| ConfigError::MissingServer { name: name.into() })
    }

    /// Pick the server whose `extensions` include the file's extension.
    /// When several match, the first by name wins.
    pub fn server_for_path(&self, path: &Path) -> Option<(&str, &ServerConfig)> {
        let ext = path.extension()?.to_str()?;
        self.servers
            .iter()
            .find(|(_, server)| {
                server
                    .extensions
                    .iter()
                    .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
            .map(|(name, server)| (name.as_str(), server))
    }
}

impl ServerConfig {
    /// The `languageId` to announce for documents this server opens.
    pub fn language_id<'a>(&'a self, server_name: &'a str) -> &'a str {
        self.language_id.as_deref().unwrap_or(server_name)
    }
}

fn validate_server(name: &str, server: &ServerConfig) -> Result<(), ConfigError> {
    if server.command.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            key: format!("servers.{name}.command"),
            value: format!("{:?}", server.command),
        });
    }
    if server.request_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            key: format!("servers.{name}.request_timeout_ms"),
            value: "0".into(),
        });
    }
    Ok(())
}

/// Get the lspc config directory path (~/.lspc/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LSPC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lspc")
}

/// Load and parse a TOML settings file, returning defaults on any error.
fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(_) => SettingsFile::default(),
    }
}

fn read_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
