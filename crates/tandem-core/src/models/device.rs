//! Device model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Platform a device runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Web,
    Ios,
    Android,
    Desktop,
    Cli,
}

impl Platform {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Desktop => "desktop",
            Self::Cli => "cli",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "web" => Ok(Self::Web),
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            "desktop" => Ok(Self::Desktop),
            "cli" => Ok(Self::Cli),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// What an installation reports about itself when registering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable per-installation identifier
    pub device_id: String,
    pub platform: Platform,
    pub app_version: String,
    pub os_version: String,
}

/// A device associated with an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub account_id: String,
    pub platform: Platform,
    pub app_version: String,
    pub os_version: String,
    pub is_primary: bool,
    pub is_active: bool,
    /// First registration (Unix ms)
    pub registered_at: i64,
    pub last_seen_at: i64,
}

impl Device {
    pub fn from_info(account_id: impl Into<String>, info: DeviceInfo, now: i64) -> Self {
        Self {
            device_id: info.device_id,
            account_id: account_id.into(),
            platform: info.platform,
            app_version: info.app_version,
            os_version: info.os_version,
            is_primary: false,
            is_active: true,
            registered_at: now,
            last_seen_at: now,
        }
    }
}
