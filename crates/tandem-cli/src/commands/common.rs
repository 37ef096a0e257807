use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tandem_core::models::Platform;
use tandem_core::notify::LogNotifier;
use tandem_core::remote::{HttpRemoteStore, RemoteStore};
use tandem_core::{DeviceInfo, EntityRecord, LocalStore, SyncConfig, SyncSession};

use crate::config_profiles::{normalize_text_option, CliProfile, CliProfilesConfig};
use crate::error::CliError;
use crate::remote::OfflineRemote;

/// Open a session for the selected profile.
///
/// Generates and persists the installation's device ID on first use.
pub fn open_session(db_path: &Path, profile_name: Option<&str>) -> Result<SyncSession, CliError> {
    let mut config = CliProfilesConfig::load().map_err(CliError::Config)?;
    let profile_name = config.resolve_profile_name(profile_name);
    let (device_id, created) = config.ensure_device_id(&profile_name);
    if created {
        config.save().map_err(CliError::Config)?;
    }
    let profile = config.profile(&profile_name).cloned().unwrap_or_default();

    session_for_profile(&profile, &device_id, db_path, |key| env::var(key).ok())
}

pub fn session_for_profile<F>(
    profile: &CliProfile,
    device_id: &str,
    db_path: &Path,
    lookup: F,
) -> Result<SyncSession, CliError>
where
    F: Fn(&str) -> Option<String>,
{
    let account_id = normalize_text_option(lookup("TANDEM_ACCOUNT_ID"))
        .or_else(|| profile.account_id())
        .ok_or(CliError::AccountNotConfigured)?;

    let config = SyncConfig {
        remote_url: profile.remote_url(),
        auth_token: profile.auth_token(),
        ..SyncConfig::default()
    }
    .with_overrides(lookup)?;

    let remote: Arc<dyn RemoteStore> = match &config.remote_url {
        Some(url) => Arc::new(HttpRemoteStore::new(
            url.clone(),
            config.auth_token.clone(),
            config.request_timeout(),
        )?),
        None => Arc::new(OfflineRemote),
    };

    let store = LocalStore::open(db_path)?;
    Ok(SyncSession::open(
        account_id,
        &device_info(device_id),
        store,
        config,
        remote,
        Arc::new(LogNotifier),
    )?)
}

pub fn device_info(device_id: &str) -> DeviceInfo {
    DeviceInfo {
        device_id: device_id.to_string(),
        platform: Platform::Cli,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        os_version: env::consts::OS.to_string(),
    }
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = cli_db_path.or_else(|| env::var_os("TANDEM_DB_PATH").map(PathBuf::from)) {
        return Ok(path);
    }
    default_db_path()
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("tandem").join("tandem.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

/// Parse an entity payload from the argument, falling back to piped stdin
pub fn resolve_payload(raw: Option<&str>) -> Result<Value, CliError> {
    let raw = match normalize_text_option(raw.map(str::to_string)) {
        Some(raw) => raw,
        None => read_piped_stdin()?.ok_or(CliError::EmptyPayload)?,
    };
    parse_payload(&raw)
}

pub fn parse_payload(raw: &str) -> Result<Value, CliError> {
    let value = serde_json::from_str::<Value>(raw.trim())?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(CliError::PayloadNotObject)
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(normalize_text_option(Some(buffer)))
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn parse_id<T: FromStr>(raw: &str) -> Result<T, CliError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| CliError::InvalidId(raw.trim().to_string()))
}

pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_entity_lines(records: &[EntityRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let key = record.key().to_string();
            let state = entity_state(record);
            let preview = payload_preview(record.payload.as_ref(), 48);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            format!(
                "{key:<32}  v{:<4}  {state:<9}  {relative_time:<9}  {preview}",
                record.version
            )
        })
        .collect()
}

pub const fn entity_state(record: &EntityRecord) -> &'static str {
    if record.is_deleted() {
        "deleted"
    } else if record.is_confirmed {
        "synced"
    } else {
        "pending"
    }
}

pub fn payload_preview(payload: Option<&Value>, max_chars: usize) -> String {
    let Some(payload) = payload else {
        return "-".to_string();
    };
    let rendered = payload.to_string();
    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let mut truncated = rendered
            .chars()
            .take(max_chars.saturating_sub(3))
            .collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
