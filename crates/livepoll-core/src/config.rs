// Configuration loading and parsing (config/live-poll.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::poll::DEFAULT_DURATION_MS;

/// File name looked up under `config/` (and seeded from `defaults/`).
pub const CONFIG_FILE: &str = "live-poll.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of each connection's outbound event queue.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".into(),
            port: 5000,
            outbound_buffer: 64,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    pub default_duration_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            default_duration_ms: DEFAULT_DURATION_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/live-poll.toml` relative to `base_dir`.
///
/// Does not seed defaults; prefer `load_config()` which does.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let config: Config = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    validate(&config)?;

    Ok(config)
}

/// Seed `config/live-poll.toml` from `defaults/` if it does not exist yet.
/// Returns the path written, or `None` when a config was already in place.
/// An existing config is never overwritten.
pub fn seed_config_file(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let target = base_dir.join("config").join(CONFIG_FILE);
    if target.exists() {
        return Ok(None);
    }

    let source = base_dir.join("defaults").join(CONFIG_FILE);
    if !source.is_file() {
        return Err(ConfigError::DefaultsCopyError {
            message: format!(
                "neither config/{CONFIG_FILE} nor defaults/{CONFIG_FILE} found in {}; \
                 run from the project root",
                base_dir.display()
            ),
        });
    }

    std::fs::create_dir_all(base_dir.join("config")).map_err(|e| {
        ConfigError::DefaultsCopyError {
            message: format!("failed to create config directory: {e}"),
        }
    })?;
    std::fs::copy(&source, &target).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!(
            "failed to copy {} to {}: {e}",
            source.display(),
            target.display()
        ),
    })?;

    Ok(Some(target))
}

/// Convenience wrapper: seeds defaults, then loads config relative to the
/// current working directory.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    seed_config_file(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.host.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "server.host".into(),
            message: "must not be empty".into(),
        });
    }

    if config.server.port == 0 {
        return Err(ConfigError::ValidationError {
            field: "server.port".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.server.outbound_buffer == 0 {
        return Err(ConfigError::ValidationError {
            field: "server.outbound_buffer".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.poll.default_duration_ms == 0 {
        return Err(ConfigError::ValidationError {
            field: "poll.default_duration_ms".into(),
            message: "must be greater than 0".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
