//! In-memory remote store.
//!
//! `MemoryBackend` is an authoritative store for any number of accounts: it
//! versions every entity, remembers idempotency keys, and keeps an ordered
//! change log for pulls. The reference server and tests both run on it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    PullResponse, PushOperation, PushRequest, PushResult, PushStatus, RemoteChange, RemoteError,
    RemoteStore,
};
use crate::models::{Device, EntityKey, OperationKind};
use crate::util::now_millis;

/// Maximum changes returned by one pull
pub const PULL_PAGE_SIZE: usize = 500;

/// Business validation run before a write is applied; `Err` rejects it
pub type PushValidator = dyn Fn(&PushOperation) -> Result<(), String> + Send + Sync;

#[derive(Debug, Clone)]
struct StoredEntity {
    version: i64,
    payload: Option<Value>,
}

#[derive(Debug, Default)]
struct AccountState {
    entities: HashMap<EntityKey, StoredEntity>,
    /// Results of applied writes by idempotency key
    applied: HashMap<String, PushResult>,
    /// Change log; the cursor is the number of entries already seen
    log: Vec<RemoteChange>,
    devices: BTreeMap<String, Device>,
}

#[derive(Default)]
pub struct MemoryBackend {
    accounts: Mutex<HashMap<String, AccountState>>,
    validator: Option<Box<PushValidator>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&PushOperation) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    fn accounts(&self) -> MutexGuard<'_, HashMap<String, AccountState>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a batch of writes in order
    pub fn push(&self, account_id: &str, operations: &[PushOperation]) -> Vec<PushResult> {
        let mut accounts = self.accounts();
        let state = accounts.entry(account_id.to_string()).or_default();
        operations
            .iter()
            .map(|op| self.apply(state, op))
            .collect()
    }

    fn apply(&self, state: &mut AccountState, op: &PushOperation) -> PushResult {
        if let Some(previous) = state.applied.get(&op.idempotency_key) {
            tracing::debug!(key = %op.idempotency_key, "Replayed idempotent write");
            return PushResult {
                op_id: op.op_id,
                ..previous.clone()
            };
        }

        let key = op.key();
        let (current_version, current_payload) = state
            .entities
            .get(&key)
            .map_or((0, None), |entity| (entity.version, entity.payload.clone()));

        if op.base_version != current_version {
            return PushResult {
                op_id: op.op_id,
                status: PushStatus::Conflict,
                new_version: None,
                current_version: Some(current_version),
                current_payload,
                message: Some(format!(
                    "stale base version {} (current {current_version})",
                    op.base_version
                )),
            };
        }

        let rejection = match (&op.operation, &op.payload) {
            (OperationKind::Create | OperationKind::Update, Some(Value::Object(_)))
            | (OperationKind::Delete, _) => None,
            _ => Some("payload must be a JSON object".to_string()),
        }
        .or_else(|| self.validator.as_ref().and_then(|validate| validate(op).err()));

        let result = if let Some(message) = rejection {
            PushResult {
                op_id: op.op_id,
                status: PushStatus::Rejected,
                new_version: None,
                current_version: Some(current_version),
                current_payload: None,
                message: Some(message),
            }
        } else {
            let version = current_version + 1;
            let payload = match op.operation {
                OperationKind::Delete => None,
                OperationKind::Create | OperationKind::Update => op.payload.clone(),
            };
            state.entities.insert(
                key,
                StoredEntity {
                    version,
                    payload: payload.clone(),
                },
            );
            state.log.push(RemoteChange {
                entity_type: op.entity_type,
                entity_id: op.entity_id.clone(),
                version,
                payload,
                changed_at: now_millis(),
                device_id: Some(op.device_id.clone()),
            });
            PushResult {
                op_id: op.op_id,
                status: PushStatus::Accepted,
                new_version: Some(version),
                current_version: None,
                current_payload: None,
                message: None,
            }
        };

        state
            .applied
            .insert(op.idempotency_key.clone(), result.clone());
        result
    }

    /// Changes after `since`, oldest first
    pub fn pull(&self, account_id: &str, since: Option<&str>) -> Result<PullResponse, RemoteError> {
        let offset = match since {
            None => 0,
            Some(cursor) => cursor.parse::<usize>().map_err(|_| RemoteError::Rejected {
                status: 400,
                message: format!("invalid cursor '{cursor}'"),
            })?,
        };

        let accounts = self.accounts();
        let log = accounts
            .get(account_id)
            .map_or(&[][..], |state| state.log.as_slice());
        let start = offset.min(log.len());
        let end = (start + PULL_PAGE_SIZE).min(log.len());

        Ok(PullResponse {
            changes: log[start..end].to_vec(),
            cursor: Some(end.to_string()),
            has_more: end < log.len(),
        })
    }

    /// Upsert a device, keeping the stored primary flag and registration time
    pub fn register_device(&self, account_id: &str, device: &Device) -> Device {
        let mut accounts = self.accounts();
        let state = accounts.entry(account_id.to_string()).or_default();
        let stored = match state.devices.get(&device.device_id) {
            Some(existing) => Device {
                account_id: account_id.to_string(),
                is_primary: existing.is_primary,
                registered_at: existing.registered_at,
                last_seen_at: existing.last_seen_at.max(device.last_seen_at),
                ..device.clone()
            },
            None => Device {
                account_id: account_id.to_string(),
                is_primary: state.devices.is_empty(),
                ..device.clone()
            },
        };
        state
            .devices
            .insert(stored.device_id.clone(), stored.clone());
        stored
    }

    pub fn list_devices(&self, account_id: &str) -> Vec<Device> {
        self.accounts()
            .get(account_id)
            .map(|state| state.devices.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_primary_device(&self, account_id: &str, device_id: &str) -> Result<(), RemoteError> {
        let mut accounts = self.accounts();
        let devices = accounts
            .get_mut(account_id)
            .map(|state| &mut state.devices)
            .filter(|devices| devices.contains_key(device_id))
            .ok_or_else(|| RemoteError::Rejected {
                status: 404,
                message: format!("device '{device_id}' not found"),
            })?;
        for device in devices.values_mut() {
            device.is_primary = device.device_id == device_id;
        }
        Ok(())
    }

    /// Current version and payload of an entity
    pub fn entity(&self, account_id: &str, key: &EntityKey) -> Option<(i64, Option<Value>)> {
        self.accounts()
            .get(account_id)
            .and_then(|state| state.entities.get(key))
            .map(|entity| (entity.version, entity.payload.clone()))
    }

    /// Number of writes applied for an account
    pub fn write_count(&self, account_id: &str) -> usize {
        self.accounts()
            .get(account_id)
            .map_or(0, |state| state.log.len())
    }
}

#[derive(Debug)]
struct Faults {
    reachable: AtomicBool,
    drop_responses: AtomicUsize,
}

/// [`RemoteStore`] view of a [`MemoryBackend`] for one account.
///
/// Clones share the backend and the simulated network conditions.
#[derive(Debug, Clone)]
pub struct MemoryRemoteStore {
    backend: Arc<MemoryBackend>,
    account_id: String,
    faults: Arc<Faults>,
}

impl MemoryRemoteStore {
    pub fn new(backend: Arc<MemoryBackend>, account_id: impl Into<String>) -> Self {
        Self {
            backend,
            account_id: account_id.into(),
            faults: Arc::new(Faults {
                reachable: AtomicBool::new(true),
                drop_responses: AtomicUsize::new(0),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    /// Simulate losing or regaining connectivity
    pub fn set_reachable(&self, reachable: bool) {
        self.faults.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Apply the next `count` pushes but lose their responses
    pub fn drop_next_responses(&self, count: usize) {
        self.faults.drop_responses.store(count, Ordering::SeqCst);
    }

    fn ensure_reachable(&self) -> Result<(), RemoteError> {
        if self.faults.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unreachable("network is offline".to_string()))
        }
    }

    fn take_dropped_response(&self) -> bool {
        self.faults
            .drop_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn push(&self, request: PushRequest) -> Result<Vec<PushResult>, RemoteError> {
        self.ensure_reachable()?;
        let results = self.backend.push(&self.account_id, &request.operations);
        if self.take_dropped_response() {
            return Err(RemoteError::Unreachable(
                "connection reset before response".to_string(),
            ));
        }
        Ok(results)
    }

    async fn pull(&self, since: Option<&str>) -> Result<PullResponse, RemoteError> {
        self.ensure_reachable()?;
        self.backend.pull(&self.account_id, since)
    }

    async fn heartbeat(&self) -> Result<(), RemoteError> {
        self.ensure_reachable()
    }

    async fn register_device(&self, device: &Device) -> Result<Device, RemoteError> {
        self.ensure_reachable()?;
        Ok(self.backend.register_device(&self.account_id, device))
    }

    async fn list_devices(&self) -> Result<Vec<Device>, RemoteError> {
        self.ensure_reachable()?;
        Ok(self.backend.list_devices(&self.account_id))
    }

    async fn set_primary_device(&self, device_id: &str) -> Result<(), RemoteError> {
        self.ensure_reachable()?;
        self.backend.set_primary_device(&self.account_id, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, OpId};
    use serde_json::json;

    fn write(key: &str, base_version: i64, payload: Value) -> PushOperation {
        PushOperation {
            op_id: OpId::new(),
            idempotency_key: key.to_string(),
            entity_type: EntityType::Booking,
            entity_id: "b1".to_string(),
            operation: if base_version == 0 {
                OperationKind::Create
            } else {
                OperationKind::Update
            },
            payload: Some(payload),
            base_version,
            device_id: "dev".to_string(),
        }
    }

    #[test]
    fn stale_base_version_conflicts() {
        let backend = MemoryBackend::new();
        let first = backend.push("acct", &[write("k1", 0, json!({"n": 1}))]);
        assert_eq!(first[0].new_version, Some(1));

        let stale = backend.push("acct", &[write("k2", 0, json!({"n": 2}))]);
        assert_eq!(stale[0].status, PushStatus::Conflict);
        assert_eq!(stale[0].current_version, Some(1));
        assert_eq!(stale[0].current_payload, Some(json!({"n": 1})));
    }

    #[test]
    fn replayed_key_is_applied_once() {
        let backend = MemoryBackend::new();
        let op = write("k1", 0, json!({"n": 1}));
        backend.push("acct", &[op.clone()]);
        let replay = backend.push("acct", &[op]);

        assert_eq!(replay[0].status, PushStatus::Accepted);
        assert_eq!(replay[0].new_version, Some(1));
        assert_eq!(backend.write_count("acct"), 1);
    }

    #[test]
    fn pull_pages_through_log() {
        let backend = MemoryBackend::new();
        backend.push("acct", &[write("k1", 0, json!({"n": 1}))]);
        backend.push("acct", &[write("k2", 1, json!({"n": 2}))]);

        let page = backend.pull("acct", None).unwrap();
        assert_eq!(page.changes.len(), 2);
        assert_eq!(page.cursor.as_deref(), Some("2"));
        assert!(!page.has_more);

        let empty = backend.pull("acct", Some("2")).unwrap();
        assert!(empty.changes.is_empty());
        assert!(backend.pull("acct", Some("abc")).is_err());
    }

    #[test]
    fn first_device_becomes_primary() {
        let backend = MemoryBackend::new();
        let device = |id: &str| Device {
            device_id: id.to_string(),
            account_id: "acct".to_string(),
            platform: crate::models::Platform::Web,
            app_version: "1.0".to_string(),
            os_version: "x".to_string(),
            is_primary: false,
            is_active: true,
            registered_at: 1,
            last_seen_at: 1,
        };
        assert!(backend.register_device("acct", &device("a")).is_primary);
        assert!(!backend.register_device("acct", &device("b")).is_primary);

        backend.set_primary_device("acct", "b").unwrap();
        let primaries: Vec<_> = backend
            .list_devices("acct")
            .into_iter()
            .filter(|d| d.is_primary)
            .map(|d| d.device_id)
            .collect();
        assert_eq!(primaries, vec!["b".to_string()]);
        assert!(backend.set_primary_device("acct", "zzz").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_response_still_applies_write() {
        let store = MemoryRemoteStore::new(Arc::new(MemoryBackend::new()), "acct");
        store.drop_next_responses(1);

        let request = PushRequest {
            operations: vec![write("k1", 0, json!({"n": 1}))],
        };
        assert!(store.push(request.clone()).await.is_err());
        let retried = store.push(request).await.unwrap();
        assert_eq!(retried[0].new_version, Some(1));
        assert_eq!(store.backend().write_count("acct"), 1);
    }
}
