//! tandem-core - Cross-device sync engine for Tandem
//!
//! Local mutations are applied optimistically to a `SQLite` entity cache and
//! queued durably; a per-account coordinator pushes them to the remote store,
//! pulls remote changes, and hands concurrent edits to the conflict resolver.
//! [`SyncSession`] ties the pieces together for one account on one device.

pub mod backup;
pub mod config;
pub mod conflict;
pub mod context;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod notify;
pub mod optimistic;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod session;
pub mod state;
pub mod store;
pub mod util;

#[cfg(test)]
mod tests;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use events::SyncEvent;
pub use models::{
    Conflict, ConflictId, Device, DeviceInfo, EntityKey, EntityRecord, EntityType, OpId,
    OperationKind, OptimisticUpdate, Resolution,
};
pub use session::SyncSession;
pub use state::{SyncState, SyncStatus};
pub use store::LocalStore;
