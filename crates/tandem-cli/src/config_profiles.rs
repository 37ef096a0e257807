//! Persistent CLI profile configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use tandem_core::util::{is_http_url, normalize_text_option};

const CONFIG_FILE_NAME: &str = "cli-config.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfilesConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, CliProfile>,
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfile {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Installation identifier, generated on first use
    #[serde(default)]
    pub device_id: Option<String>,
}

impl std::fmt::Debug for CliProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliProfile")
            .field("account_id", &self.account_id)
            .field("remote_url", &self.remote_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("device_id", &self.device_id)
            .finish()
    }
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::config_dir()
        .map(|dir| dir.join("tandem").join(CONFIG_FILE_NAME))
        .ok_or_else(|| "Failed to resolve CLI config directory".to_string())
}

pub fn normalize_profile_name(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, String> {
        Self::load_from_path(&default_config_path()?)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|error| format!("Failed to read config at {}: {}", path.display(), error))?;
        let mut config = serde_json::from_str::<Self>(&raw)
            .map_err(|error| format!("Failed to parse config at {}: {}", path.display(), error))?;
        config.normalize();
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, String> {
        let path = default_config_path()?;
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                format!(
                    "Failed to create config directory {}: {}",
                    parent.display(),
                    error
                )
            })?;
        }

        let mut normalized = self.clone();
        normalized.normalize();
        let serialized = serde_json::to_string_pretty(&normalized)
            .map_err(|error| format!("Failed to serialize config: {error}"))?;
        std::fs::write(path, serialized)
            .map_err(|error| format!("Failed to write config at {}: {}", path.display(), error))
    }

    pub fn resolve_profile_name(&self, explicit: Option<&str>) -> String {
        self.resolve_profile_name_with(explicit, std::env::var("TANDEM_PROFILE").ok())
    }

    fn resolve_profile_name_with(&self, explicit: Option<&str>, env: Option<String>) -> String {
        normalize_profile_name(explicit)
            .or_else(|| normalize_profile_name(env.as_deref()))
            .or_else(|| normalize_profile_name(self.active_profile.as_deref()))
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn profile(&self, name: &str) -> Option<&CliProfile> {
        self.profiles.get(name)
    }

    pub fn profile_mut_or_default(&mut self, name: &str) -> &mut CliProfile {
        self.profiles.entry(name.to_string()).or_default()
    }

    /// Return the profile's installation ID, generating one if needed.
    ///
    /// The boolean is true when a new ID was generated and the config must
    /// be saved.
    pub fn ensure_device_id(&mut self, name: &str) -> (String, bool) {
        let profile = self.profile_mut_or_default(name);
        if let Some(device_id) = normalize_text_option(profile.device_id.clone()) {
            return (device_id, false);
        }
        let device_id = format!("cli-{}", uuid::Uuid::now_v7());
        profile.device_id = Some(device_id.clone());
        (device_id, true)
    }

    fn normalize(&mut self) {
        self.active_profile = normalize_profile_name(self.active_profile.as_deref());
        for profile in self.profiles.values_mut() {
            profile.normalize();
        }
    }
}

impl CliProfile {
    pub fn account_id(&self) -> Option<String> {
        normalize_text_option(self.account_id.clone())
    }

    pub fn remote_url(&self) -> Option<String> {
        normalize_text_option(self.remote_url.clone())
    }

    pub fn auth_token(&self) -> Option<String> {
        normalize_text_option(self.auth_token.clone())
    }

    fn normalize(&mut self) {
        self.account_id = normalize_text_option(self.account_id.clone());
        self.remote_url = normalize_text_option(self.remote_url.clone())
            .map(|url| url.trim_end_matches('/').to_string());
        self.auth_token = normalize_text_option(self.auth_token.clone());
        self.device_id = normalize_text_option(self.device_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_profile_name_rejects_empty() {
        assert_eq!(normalize_profile_name(None), None);
        assert_eq!(normalize_profile_name(Some(" ")), None);
    }

    #[test]
    fn config_roundtrip_normalizes_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = CliProfilesConfig {
            version: 1,
            active_profile: Some(" default ".to_string()),
            profiles: BTreeMap::new(),
        };
        config.profiles.insert(
            "default".to_string(),
            CliProfile {
                account_id: Some(" acct-1 ".to_string()),
                remote_url: Some(" https://sync.example.com/ ".to_string()),
                auth_token: Some("   ".to_string()),
                device_id: None,
            },
        );

        config.save_to_path(&path).unwrap();
        let loaded = CliProfilesConfig::load_from_path(&path).unwrap();
        assert_eq!(loaded.active_profile.as_deref(), Some("default"));
        let profile = loaded.profile("default").unwrap();
        assert_eq!(profile.account_id().as_deref(), Some("acct-1"));
        assert_eq!(
            profile.remote_url().as_deref(),
            Some("https://sync.example.com")
        );
        assert_eq!(profile.auth_token(), None);
    }

    #[test]
    fn missing_config_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = CliProfilesConfig::load_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, CliProfilesConfig::default());
    }

    #[test]
    fn resolve_profile_name_prefers_explicit_then_env_then_active() {
        let config = CliProfilesConfig {
            version: 1,
            active_profile: Some("work".to_string()),
            profiles: BTreeMap::new(),
        };
        assert_eq!(
            config.resolve_profile_name_with(Some("mobile"), Some("env".into())),
            "mobile"
        );
        assert_eq!(config.resolve_profile_name_with(None, Some("env".into())), "env");
        assert_eq!(config.resolve_profile_name_with(None, None), "work");
        assert_eq!(
            CliProfilesConfig::default().resolve_profile_name_with(None, None),
            "default"
        );
    }

    #[test]
    fn device_id_is_generated_once() {
        let mut config = CliProfilesConfig::default();
        let (first, created) = config.ensure_device_id("default");
        assert!(created);
        assert!(first.starts_with("cli-"));

        let (second, created) = config.ensure_device_id("default");
        assert!(!created);
        assert_eq!(first, second);
    }

    #[test]
    fn debug_redacts_token() {
        let profile = CliProfile {
            auth_token: Some("secret".to_string()),
            ..CliProfile::default()
        };
        assert!(!format!("{profile:?}").contains("secret"));
    }
}
