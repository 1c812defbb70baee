//! Configuration resolution: environment overrides, then a TOML file,
//! then built-in defaults.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize default config: {0}")]
    SerializeFailed(#[source] toml::ser::Error),
}

/// Upstream endpoint and connection shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub max_requests: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "updater.example.com".to_string(),
            port: 43594,
            max_requests: revcache_core_max_requests(),
        }
    }
}

fn revcache_core_max_requests() -> usize {
    crate::wire::MAX_REQUESTS
}

/// Local client identity: the revision this client claims to be at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub rs_version: i32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { rs_version: 1 }
    }
}

/// On-disk cache location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RevcacheConfig {
    pub client: ClientConfig,
    pub upstream: UpstreamConfig,
    pub store: StoreConfig,
}

impl RevcacheConfig {
    /// Resolve configuration: env vars override the file, the file
    /// overrides built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match file_path() {
            Some(path) if path.exists() => read_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Effective cache database path: explicit config value, or
    /// `<data_dir>/revcache.sqlite3`.
    pub fn resolved_db_path(&self) -> PathBuf {
        self.store
            .db_path
            .clone()
            .unwrap_or_else(|| data_dir().join("revcache.sqlite3"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("REVCACHE_RS_VERSION") {
            if let Ok(parsed) = v.parse() {
                self.client.rs_version = parsed;
            }
        }
        if let Ok(v) = env::var("REVCACHE_HOST") {
            self.upstream.host = v;
        }
        if let Ok(v) = env::var("REVCACHE_PORT") {
            if let Ok(parsed) = v.parse() {
                self.upstream.port = parsed;
            }
        }
        if let Ok(v) = env::var("REVCACHE_MAX_REQUESTS") {
            if let Ok(parsed) = v.parse() {
                self.upstream.max_requests = parsed;
            }
        }
        if let Ok(v) = env::var("REVCACHE_DB_PATH") {
            self.store.db_path = Some(PathBuf::from(v));
        }
    }

    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteFailed {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let contents = toml::to_string_pretty(&Self::default()).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn read_file(path: &Path) -> Result<RevcacheConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// `$REVCACHE_CONFIG`, else `$XDG_CONFIG_HOME/revcache/config.toml`, else
/// `~/.config/revcache/config.toml`. Returns `None` if no home directory
/// can be determined and no override is set.
pub fn file_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("REVCACHE_CONFIG") {
        return Some(PathBuf::from(path));
    }
    Some(config_dir()?.join("config.toml"))
}

fn config_dir() -> Option<PathBuf> {
    dirs_or_home("XDG_CONFIG_HOME", ".config")
}

fn data_dir() -> PathBuf {
    dirs_or_home("XDG_DATA_HOME", ".local/share")
        .unwrap_or_else(|| PathBuf::from("."))
        .join("revcache")
}

fn dirs_or_home(xdg_var: &str, fallback_subdir: &str) -> Option<PathBuf> {
    if let Ok(xdg) = env::var(xdg_var) {
        return Some(PathBuf::from(xdg).join("revcache"));
    }
    let home = env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(fallback_subdir).join("revcache"))
}
