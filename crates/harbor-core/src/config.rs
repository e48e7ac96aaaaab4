//! Proxy configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{HostError, HostResult};

/// Offline proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Version string of the running generation
    pub version: String,

    /// Prefix for cache generation names (`{prefix}-{version}`)
    pub cache_prefix: String,

    /// Origin the hosted application is served from
    pub origin: String,

    /// Shell URLs pre-cached at install time, relative to the origin or absolute
    pub shell_urls: Vec<String>,

    /// Path the offline document is stored under
    pub offline_path: String,

    /// Path of the version descriptor polled for updates
    pub version_path: String,

    /// Seconds between update checks
    pub update_interval_secs: u64,

    /// Seconds before a network fetch is abandoned
    pub fetch_timeout_secs: u64,

    /// Attempts per shell URL during install (1 = no retries)
    pub install_attempts: u32,

    /// Application name shown in the offline page and notifications
    pub app_name: String,

    /// User agent sent on network fetches
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            cache_prefix: "harbor".to_string(),
            origin: "http://localhost:8080".to_string(),
            shell_urls: vec![
                "/".to_string(),
                "/offline.html".to_string(),
                "/manifest.json".to_string(),
            ],
            offline_path: "/offline.html".to_string(),
            version_path: "/version.json".to_string(),
            update_interval_secs: 60 * 60,
            fetch_timeout_secs: 30,
            install_attempts: 1,
            app_name: "Harbor".to_string(),
            user_agent: format!("Harbor/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> HostResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading proxy config");
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the worker cannot run with.
    pub fn validate(&self) -> HostResult<()> {
        if self.version.trim().is_empty() {
            return Err(HostError::config("version must not be empty"));
        }
        let origin = self.origin_url()?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(HostError::config(format!(
                "origin must be http or https, got '{}'",
                origin.scheme()
            )));
        }
        if self.update_interval_secs == 0 {
            return Err(HostError::config("update_interval_secs must be positive"));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(HostError::config("fetch_timeout_secs must be positive"));
        }
        if self.install_attempts == 0 {
            return Err(HostError::config("install_attempts must be at least 1"));
        }
        for shell in &self.shell_urls {
            origin.join(shell)?;
        }
        Ok(())
    }

    /// Parsed origin URL.
    pub fn origin_url(&self) -> HostResult<Url> {
        Ok(Url::parse(&self.origin)?)
    }

    /// Name of the current cache generation.
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.version)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
