//! Shared sync state types.

use serde::{Deserialize, Serialize};

/// Overall sync state shown to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
    /// Device is unregistered; sync stays off until registration succeeds
    Disabled,
}

/// Step of the current sync cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Detecting,
    Offline,
    Draining,
    Pulling,
    Merging,
}

/// Snapshot published on every status change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_operations: usize,
    pub conflicts: usize,
    pub last_sync_at: Option<i64>,
    pub state: SyncState,
    pub phase: CyclePhase,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            is_online: false,
            pending_operations: 0,
            conflicts: 0,
            last_sync_at: None,
            state: SyncState::Offline,
            phase: CyclePhase::Idle,
        }
    }
}
