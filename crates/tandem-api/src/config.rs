use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Static bearer token to account mapping
    pub api_tokens: HashMap<String, String>,
    pub rate_limit_window: Duration,
    pub requests_per_window: u32,
    pub max_push_batch: usize,
    pub max_payload_bytes: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut accounts = self.api_tokens.values().collect::<Vec<_>>();
        accounts.sort();
        accounts.dedup();
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_tokens", &"[REDACTED]")
            .field("accounts", &accounts)
            .field("rate_limit_window", &self.rate_limit_window)
            .field("requests_per_window", &self.requests_per_window)
            .field("max_push_batch", &self.max_push_batch)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "TANDEM_API_BIND_ADDR", "127.0.0.1:8080");

        let raw_tokens = required_trimmed(&lookup, "TANDEM_API_TOKENS")?;
        let api_tokens = parse_api_tokens(&raw_tokens)?;

        let rate_limit_window_secs =
            parse_in_range(&lookup, "RATE_LIMIT_WINDOW_SECS", "60", 1..=3_600)?;
        let requests_per_window =
            parse_in_range(&lookup, "RATE_LIMIT_PER_WINDOW", "600", 1..=100_000)?;
        let max_push_batch = parse_in_range(&lookup, "MAX_PUSH_BATCH", "100", 1..=1_000)?;
        let max_payload_bytes =
            parse_in_range(&lookup, "MAX_PAYLOAD_BYTES", "65536", 256..=1_048_576)?;

        Ok(Self {
            bind_addr,
            api_tokens,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            requests_per_window,
            max_push_batch,
            max_payload_bytes,
        })
    }
}

/// Parse `token=account` pairs separated by commas
fn parse_api_tokens(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut tokens = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let (token, account) = entry
            .split_once('=')
            .map(|(token, account)| (token.trim(), account.trim()))
            .filter(|(token, account)| !token.is_empty() && !account.is_empty())
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "TANDEM_API_TOKENS entries must look like `token=account`".to_string(),
                )
            })?;
        if tokens
            .insert(token.to_string(), account.to_string())
            .is_some()
        {
            return Err(ConfigError::Invalid(
                "TANDEM_API_TOKENS contains a duplicate token".to_string(),
            ));
        }
    }
    if tokens.is_empty() {
        return Err(ConfigError::MissingVar("TANDEM_API_TOKENS"));
    }
    Ok(tokens)
}

fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + fmt::Display,
{
    let describe = || {
        format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        )
    };
    let value = value_or_default(lookup, name, default)
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(describe()))?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid(describe()))
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
