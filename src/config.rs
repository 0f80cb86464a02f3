//! Service configuration.
//!
//! Settings load from a TOML file with defaults suitable for development.
//! The base directory resolves from `ICEBOX_HOME` when set, falling back
//! to `~/.icebox/`, so deployments can relocate all state with one
//! environment variable.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;

/// Get the icebox base directory.
///
/// Resolution order:
/// 1. `ICEBOX_HOME` environment variable (if set)
/// 2. `~/.icebox/` (default)
pub fn icebox_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("ICEBOX_HOME")
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }

    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".icebox"))
}

/// Default config file path: `<icebox_dir>/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(icebox_dir()?.join("config.toml"))
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    /// Root directory holding every project's staging and frozen areas,
    /// plus the metadata databases.
    #[serde(default)]
    pub data_root: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved data root: configured value or `<icebox_dir>/data`.
    pub fn resolve_data_root(&self) -> Result<PathBuf> {
        match &self.data_root {
            Some(root) => Ok(root.clone()),
            None => Ok(icebox_dir()?.join("data")),
        }
    }
}

/// Credentials for the delegated basic-auth check.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    /// Admin credential, required for setting or clearing the service lock.
    #[serde(default)]
    pub admin: Option<Credential>,
    /// Project-scoped credentials; each may only act on its project.
    #[serde(default)]
    pub projects: Vec<ProjectCredential>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectCredential {
    pub project: String,
    pub user: String,
    pub password: String,
}

fn default_port() -> u16 {
    constants::DEFAULT_PORT
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    /// Load configuration from the default location, falling back to
    /// defaults when no config file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or
    /// parsed.
    pub fn load() -> Result<Self> {
        let path = default_config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid
    /// TOML.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
