//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use testhub_auth::{AuthConfig, DEFAULT_API_URL};

use crate::error::CoreError;
use crate::Result;

/// Overrides `api_base_url` when set.
pub const API_URL_ENV: &str = "TESTHUB_API_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the local storage database
    pub database_path: PathBuf,
    /// Base URL of the platform's REST API, ending in `/api/`
    pub api_base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("testhub.db"),
            api_base_url: DEFAULT_API_URL.to_string(),
            auth: AuthConfig::default(),
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("TestHub"))
            .unwrap_or_else(|| PathBuf::from(".testhub"))
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(API_URL_ENV).filter(|url| !url.trim().is_empty()) {
            tracing::info!(api_base_url = %url, "Using API URL from environment");
            self.api_base_url = url.trim().to_string();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.api_base_url)
            .map_err(|e| CoreError::Config(format!("invalid API URL {:?}: {}", self.api_base_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::Config(format!(
                "unsupported API URL scheme: {}",
                url.scheme()
            )));
        }
        if self.auth.poll_interval.is_zero() {
            return Err(CoreError::Config(
                "auth.poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}
