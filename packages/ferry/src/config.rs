//! Loading the TOML configuration that drives a [`crate::cache::Cache`].
//!
//! The shape mirrors what the cache registry needs to bootstrap: a default
//! local cache location, a list of named remote servers with their
//! transport-specific settings, and optional tool path/flag overrides.
//! `%u` in `cache.path` expands to the invoking user's name, read from the
//! `USER` environment variable (falling back to `whoami`-style `id -un`
//! only if `USER` is unset, since some minimal containers don't export it).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{CONFIG_ERROR, Error};

/// Top-level configuration, deserialized directly from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub tool: HashMap<String, ToolConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// `[cache]`: where the local cache root lives and its default policy.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// The local cache root. May contain a `%u` placeholder, expanded at
    /// load time to the current username.
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Whether caching is enabled by default for servers that don't say
    /// otherwise.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            enabled: true,
        }
    }
}

fn default_cache_path() -> String {
    "/var/cache/ferry/%u".to_owned()
}

fn default_true() -> bool {
    true
}

/// `[server.NAME]`: a single named remote, and this crate's per-server
/// cache policy for it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// The base URL this server name resolves to.
    pub url: String,
    /// Alternate names that resolve to the same server.
    #[serde(default)]
    pub alias: Vec<String>,
    /// Whether this server is eligible for caching at all. Forces `cache`
    /// to `false` regardless of the `cache` field when `false`.
    #[serde(default = "default_true")]
    pub cachable: bool,
    /// Per-server override of [`CacheConfig::enabled`].
    pub cache: Option<bool>,
    /// Whether a local hit should still write back to this server.
    pub writeback: Option<bool>,
    /// Whether this server is itself the local cache (no network fetch
    /// needed to read from it).
    pub islocal: Option<bool>,
    /// Permission string applied to files written back to this server.
    pub push_permissions: Option<String>,
}

/// `[tool.NAME]`: an explicit path and/or flag override for an external
/// tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolConfig {
    pub path: Option<PathBuf>,
    pub flags: Option<String>,
}

/// `[log]`: how the CLI binary should initialize `tracing`.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Config {
    /// Parse `text` as TOML and expand `%u` in `cache.path`.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut config: Config = toml::from_str(text)
            .map_err(|err| Error::new(format!("failed to parse config: {err}")).with_code(CONFIG_ERROR))?;
        config.cache.path = expand_user(&config.cache.path)?;
        Ok(config)
    }

    /// Read and parse the config file at `path`.
    pub async fn load(path: &std::path::Path) -> Result<Self, Error> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| Error::new(format!("failed to read config file {}: {err}", path.display())))?;
        Self::parse(&text)
    }
}

/// Expand a single `%u` placeholder to the current username.
fn expand_user(path: &str) -> Result<String, Error> {
    if !path.contains("%u") {
        return Ok(path.to_owned());
    }
    let user = current_username()?;
    Ok(path.replace("%u", &user))
}

fn current_username() -> Result<String, Error> {
    if let Ok(user) = std::env::var("USER") {
        return Ok(user);
    }
    if let Ok(user) = std::env::var("LOGNAME") {
        return Ok(user);
    }
    Err(Error::new("cannot expand %u in cache.path: neither USER nor LOGNAME is set").with_code(CONFIG_ERROR))
}
