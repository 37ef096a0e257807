//! Data models for Tandem

/// Declares a UUID v7 (time-sortable) identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new unique ID using UUID v7
            #[must_use]
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// Get the string representation of this ID
            #[must_use]
            pub fn as_str(&self) -> String {
                self.0.to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }
    };
}

mod backup;
mod conflict;
mod device;
mod entity;
mod operation;
mod optimistic_update;

pub use backup::{
    BackupEntity, BackupId, BackupReason, BackupSnapshot, BackupSummary, BACKUP_SCHEMA_VERSION,
};
pub use conflict::{Conflict, ConflictId, ConflictState, Resolution};
pub use device::{Device, DeviceInfo, Platform};
pub use entity::{EntityKey, EntityRecord, EntityType};
pub use operation::{OpId, OperationKind, OperationStatus, SyncOperation};
pub use optimistic_update::OptimisticUpdate;
