//! Cached entity model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The kinds of account data kept in sync across devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Booking,
    Favorite,
    Settings,
}

impl EntityType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Booking => "booking",
            Self::Favorite => "favorite",
            Self::Settings => "settings",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "booking" | "bookings" => Ok(Self::Booking),
            "favorite" | "favorites" | "favourite" => Ok(Self::Favorite),
            "settings" | "setting" => Ok(Self::Settings),
            other => Err(format!("unknown entity type '{other}'")),
        }
    }
}

/// Identifies one entity within an account
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A row of the local entity cache.
///
/// `payload` is the state the UI sees, including optimistic changes.
/// `confirmed_payload` and `version` mirror the last state the remote store
/// acknowledged. A `None` payload marks a deleted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: Option<Value>,
    /// Last confirmed remote version (0 when never confirmed)
    pub version: i64,
    pub confirmed_payload: Option<Value>,
    /// Whether `payload` equals the confirmed remote state
    pub is_confirmed: bool,
    /// Last local modification (Unix ms)
    pub updated_at: i64,
}

impl EntityRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    pub const fn is_deleted(&self) -> bool {
        self.payload.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_parse_accepts_plurals() {
        assert_eq!("bookings".parse::<EntityType>(), Ok(EntityType::Booking));
        assert_eq!(" Favorite ".parse::<EntityType>(), Ok(EntityType::Favorite));
        assert!("invoice".parse::<EntityType>().is_err());
    }

    #[test]
    fn entity_type_serializes_snake_case() {
        let json = serde_json::to_string(&EntityType::Settings).unwrap();
        assert_eq!(json, "\"settings\"");
    }

    #[test]
    fn entity_key_display() {
        let key = EntityKey::new(EntityType::Booking, "b-1");
        assert_eq!(key.to_string(), "booking/b-1");
    }
}
