//! Engine configuration.
//!
//! `EngineConfig` is shared by every client that embeds the sync engine. It
//! can be parsed from JSON or assembled from `PAWTRACK_*` environment
//! variables; both paths go through [`EngineConfig::validate`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_REFRESH_PAGE_SIZE: usize = 200;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

pub const ENV_REMOTE_URL: &str = "PAWTRACK_REMOTE_URL";
pub const ENV_REFRESH_PAGE_SIZE: &str = "PAWTRACK_REFRESH_PAGE_SIZE";
pub const ENV_TICK_INTERVAL_MS: &str = "PAWTRACK_TICK_INTERVAL_MS";
pub const ENV_POLL_INTERVAL_MS: &str = "PAWTRACK_POLL_INTERVAL_MS";

/// Tunables for the sync engine and its remote adapters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Base URL of the HTTP remote store; `None` runs fully offline
    pub remote_base_url: Option<String>,
    /// Page size of the one-shot refresh after reconnecting
    pub refresh_page_size: usize,
    /// Cadence of the visit countdown ticker
    pub tick_interval_ms: u64,
    /// Cadence of polling change feeds
    pub poll_interval_ms: u64,
    /// Transport timeout for remote requests
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            remote_base_url: None,
            refresh_page_size: DEFAULT_REFRESH_PAGE_SIZE,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON config document
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid engine config JSON: {error}")))?;
        config.validate()
    }

    /// Build a config from `PAWTRACK_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup (environment, profile file, tests)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self {
            remote_base_url: normalize_text_option(lookup(ENV_REMOTE_URL)),
            ..Self::default()
        };
        if let Some(value) = lookup(ENV_REFRESH_PAGE_SIZE) {
            config.refresh_page_size = parse_number(ENV_REFRESH_PAGE_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_TICK_INTERVAL_MS) {
            config.tick_interval_ms = parse_number(ENV_TICK_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &value)?;
        }
        config.validate()
    }

    /// Check ranges and normalize the remote URL
    pub fn validate(mut self) -> Result<Self> {
        if self.refresh_page_size == 0 {
            return Err(Error::Config("refresh_page_size must be positive".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".into()));
        }

        self.remote_base_url = match normalize_text_option(self.remote_base_url.take()) {
            Some(url) if is_http_url(&url) => Some(url.trim_end_matches('/').to_string()),
            Some(url) => {
                return Err(Error::Config(format!(
                    "remote_base_url '{url}' must include http:// or https://"
                )))
            }
            None => None,
        };
        Ok(self)
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number, got '{raw}'")))
}
