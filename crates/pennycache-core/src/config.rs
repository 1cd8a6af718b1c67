//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! the remote store URL, request timeout, the last signed-in user and the
//! cache tuning knobs.
//!
//! Configuration is stored at `~/.config/pennycache/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::cache::config::{DEFAULT_GC_TIME, DEFAULT_PERSIST_MAX_AGE, DEFAULT_PERSIST_THROTTLE};
use crate::cache::retry::{DEFAULT_RETRIES, INITIAL_BACKOFF_MS};
use crate::cache::{CacheConfig, RetryPolicy};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "pennycache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "https://api.pennypilot.app/v1/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub persist_throttle_ms: u64,
    pub gc_minutes: u64,
    pub retry_count: u32,
    pub initial_backoff_ms: u64,
    pub persist_max_age_hours: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            persist_throttle_ms: DEFAULT_PERSIST_THROTTLE.as_millis() as u64,
            gc_minutes: DEFAULT_GC_TIME.as_secs() / 60,
            retry_count: DEFAULT_RETRIES,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            persist_max_age_hours: DEFAULT_PERSIST_MAX_AGE.as_secs() / 3600,
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        let retry = RetryPolicy::default()
            .with_retries(self.retry_count)
            .with_initial_backoff(Duration::from_millis(self.initial_backoff_ms));
        CacheConfig::new()
            .with_persist_throttle(Duration::from_millis(self.persist_throttle_ms))
            .with_gc_time(Duration::from_secs(self.gc_minutes.saturating_mul(60)))
            .with_retry(retry)
            .with_persist_max_age(Duration::from_secs(
                self.persist_max_age_hours.saturating_mul(3600),
            ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub last_user_id: Option<String>,
    pub cache: CacheSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            last_user_id: None,
            cache: CacheSettings::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
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

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
