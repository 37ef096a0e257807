//! Sync engine configuration.
//!
//! `SyncConfig` can be read from a JSON file, from `TANDEM_*` environment
//! variables, or both (environment wins). Every value has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_REGISTRY_ATTEMPTS: u32 = 3;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Tunables for one sync session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Base URL of the remote store (`None` keeps the session local-only)
    pub remote_url: Option<String>,
    /// Bearer token for the remote store
    pub auth_token: Option<String>,
    /// Concurrent dispatches while draining
    pub workers: usize,
    /// Dispatch attempts before a transient failure becomes permanent
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    /// Cap for every backoff delay
    pub max_backoff_secs: u64,
    pub sync_interval_secs: u64,
    pub registry_attempts: u32,
    pub request_timeout_secs: u64,
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            auth_token: None,
            workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            registry_attempts: DEFAULT_REGISTRY_ATTEMPTS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("remote_url", &self.remote_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("workers", &self.workers)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_ms", &self.retry_base_ms)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("registry_attempts", &self.registry_attempts)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file and validate it
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Read `TANDEM_*` variables from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from defaults overlaid with looked-up variables
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().with_overrides(lookup)
    }

    /// Overlay looked-up variables onto this config and validate the result
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = normalize_text_option(lookup("TANDEM_REMOTE_URL")) {
            self.remote_url = Some(url);
        }
        if let Some(token) = normalize_text_option(lookup("TANDEM_AUTH_TOKEN")) {
            self.auth_token = Some(token);
        }
        if let Some(workers) = parse_var(&lookup, "TANDEM_SYNC_WORKERS")? {
            self.workers = workers;
        }
        if let Some(attempts) = parse_var(&lookup, "TANDEM_MAX_ATTEMPTS")? {
            self.max_attempts = attempts;
        }
        if let Some(base) = parse_var(&lookup, "TANDEM_RETRY_BASE_MS")? {
            self.retry_base_ms = base;
        }
        if let Some(cap) = parse_var(&lookup, "TANDEM_MAX_BACKOFF_SECS")? {
            self.max_backoff_secs = cap;
        }
        if let Some(interval) = parse_var(&lookup, "TANDEM_SYNC_INTERVAL_SECS")? {
            self.sync_interval_secs = interval;
        }
        if let Some(attempts) = parse_var(&lookup, "TANDEM_REGISTRY_ATTEMPTS")? {
            self.registry_attempts = attempts;
        }
        if let Some(timeout) = parse_var(&lookup, "TANDEM_REQUEST_TIMEOUT_SECS")? {
            self.request_timeout_secs = timeout;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.remote_url {
            if !is_http_url(url) {
                return Err(Error::Config(
                    "remote_url must include http:// or https://".to_string(),
                ));
            }
        }
        if !(1..=32).contains(&self.workers) {
            return Err(Error::Config("workers must be between 1 and 32".to_string()));
        }
        if !(1..=100).contains(&self.max_attempts) {
            return Err(Error::Config(
                "max_attempts must be between 1 and 100".to_string(),
            ));
        }
        if self.retry_base_ms == 0 {
            return Err(Error::Config("retry_base_ms must be > 0".to_string()));
        }
        if !(1..=3600).contains(&self.max_backoff_secs) {
            return Err(Error::Config(
                "max_backoff_secs must be between 1 and 3600".to_string(),
            ));
        }
        if Duration::from_millis(self.retry_base_ms) > self.max_backoff() {
            return Err(Error::Config(
                "retry_base_ms must not exceed max_backoff_secs".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(Error::Config("sync_interval_secs must be > 0".to_string()));
        }
        if self.registry_attempts == 0 {
            return Err(Error::Config("registry_attempts must be > 0".to_string()));
        }
        if !(1..=300).contains(&self.request_timeout_secs) {
            return Err(Error::Config(
                "request_timeout_secs must be between 1 and 300".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be > 0".to_string()));
        }
        Ok(())
    }

    /// Whether a remote store is configured
    pub const fn is_remote_configured(&self) -> bool {
        self.remote_url.is_some()
    }

    pub const fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub const fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = normalize_text_option(lookup(key)) else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} has invalid value '{raw}'")))
}
