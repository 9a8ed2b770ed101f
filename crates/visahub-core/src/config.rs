//! Client configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! holds the backend endpoints, the retry/backoff policies and the choice of
//! credential storage.
//!
//! Configuration is stored at `~/.config/visahub/config.json`. A handful of
//! environment variables override the file so that deployments can point the
//! client at another backend without editing it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::RetryPolicy;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "visahub";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const ENV_API_URL: &str = "VISAHUB_API_URL";
const ENV_WS_URL: &str = "VISAHUB_WS_URL";
const ENV_STORAGE: &str = "VISAHUB_STORAGE";

/// Where the credential store keeps its durable copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// OS keychain
    #[default]
    Keyring,
    /// `session.json` in the cache directory
    File,
    /// Nothing survives the process
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!("Unknown storage kind: {}", other)),
        }
    }
}

/// Serialized form of a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the REST backend, e.g. `https://api.example.com`
    pub api_base_url: String,
    /// URL of the live update socket, e.g. `wss://api.example.com/ws`
    pub ws_url: String,
    pub login_path: String,
    pub logout_path: String,
    pub refresh_path: String,
    pub request_timeout_secs: u64,
    /// Request retries on timeouts (2 retries after the first attempt)
    pub request_retry: RetrySettings,
    /// Retries of the refresh call itself
    pub refresh_retry: RetrySettings,
    /// Reconnect scheduling of the live update channel
    pub reconnect: RetrySettings,
    /// Keepalive ping period on the live update socket; 0 turns pings off
    pub ping_interval_secs: u64,
    /// Cache TTL used when the credential's lifetime can't be read from its claims
    pub credential_ttl_minutes: u64,
    pub storage: StorageKind,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".to_string(),
            ws_url: "ws://localhost:5000/ws".to_string(),
            login_path: "/api/auth/login".to_string(),
            logout_path: "/api/auth/logout".to_string(),
            refresh_path: "/api/auth/refresh".to_string(),
            request_timeout_secs: 30,
            request_retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 1000,
            },
            refresh_retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 1000,
            },
            reconnect: RetrySettings {
                max_attempts: 5,
                base_delay_ms: 1000,
            },
            ping_interval_secs: 30,
            credential_ttl_minutes: 45,
            storage: StorageKind::default(),
            last_email: None,
        }
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Ok(url) = std::env::var(ENV_WS_URL) {
            self.ws_url = url;
        }
        if let Ok(kind) = std::env::var(ENV_STORAGE) {
            match kind.parse() {
                Ok(kind) => self.storage = kind,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_STORAGE),
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Join a path onto the API base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_policies() {
        let config = Config::default();
        assert_eq!(config.request_retry.policy().max_attempts(), 3);
        assert_eq!(config.refresh_retry.policy().delay_for(2), Duration::from_secs(2));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.credential_ttl(), Duration::from_secs(45 * 60));
    }

    #[test]
    fn test_url_joins_slashes() {
        let config = Config {
            api_base_url: "https://api.example.com/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.url("/api/jobs"), "https://api.example.com/api/jobs");
        assert_eq!(config.url("api/jobs"), "https://api.example.com/api/jobs");
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url": "https://x.test", "storage": "file"}"#)
                .expect("partial config should parse");
        assert_eq!(config.api_base_url, "https://x.test");
        assert_eq!(config.storage, StorageKind::File);
        assert_eq!(config.refresh_path, "/api/auth/refresh");
    }

    #[test]
    fn test_storage_kind_from_str() {
        assert_eq!("Keyring".parse::<StorageKind>().unwrap(), StorageKind::Keyring);
        assert_eq!(" memory ".parse::<StorageKind>().unwrap(), StorageKind::Memory);
        assert!("vault".parse::<StorageKind>().is_err());
    }
}
