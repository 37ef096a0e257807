//! End-to-end scenarios across devices sharing one in-memory remote store

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::context::testing::{harness, Harness, ACCOUNT};
use crate::coordinator::{CycleOutcome, CycleReport, SyncCoordinator};
use crate::error::Error;
use crate::events::{DiscardedSide, SyncEvent};
use crate::models::{
    BackupReason, DeviceInfo, EntityKey, EntityType, OperationKind, Platform, Resolution,
};
use crate::notify::NotificationType;
use crate::optimistic::{OptimisticUpdateManager, ReconcileOutcome};
use crate::queue::OperationQueue;
use crate::registry::DeviceRegistry;
use crate::remote::MemoryBackend;
use crate::session::SyncSession;

/// One device of the account with its own local store
struct Peer {
    h: Harness,
    coordinator: SyncCoordinator,
    updates: OptimisticUpdateManager,
}

impl Peer {
    async fn new(device_id: &str, backend: Arc<MemoryBackend>) -> Self {
        let h = harness(device_id, backend);
        DeviceRegistry::new(h.ctx.clone())
            .register_device(device_info(device_id))
            .await
            .unwrap();
        Self {
            coordinator: SyncCoordinator::new(h.ctx.clone()),
            updates: OptimisticUpdateManager::new(h.ctx.clone()),
            h,
        }
    }

    async fn sync(&self) -> CycleReport {
        self.coordinator
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap()
    }

    fn offline(&self) {
        self.h.remote.set_reachable(false);
    }

    fn online(&self) {
        self.h.remote.set_reachable(true);
    }

    fn apply(&self, entity_type: EntityType, id: &str, kind: OperationKind, payload: Value) {
        self.updates
            .apply(entity_type, id, kind, Some(payload))
            .unwrap();
    }

    fn payload(&self, entity_type: EntityType, id: &str) -> Option<Value> {
        self.updates
            .entity(entity_type, id)
            .unwrap()
            .and_then(|record| record.payload)
    }

    fn active_ops(&self) -> usize {
        OperationQueue::new(self.h.ctx.store.clone(), ACCOUNT)
            .active_operations()
            .unwrap()
            .len()
    }
}

fn device_info(device_id: &str) -> DeviceInfo {
    DeviceInfo {
        device_id: device_id.to_string(),
        platform: Platform::Web,
        app_version: "1.0".to_string(),
        os_version: "test".to_string(),
    }
}

fn remote_payload(backend: &MemoryBackend, entity_type: EntityType, id: &str) -> Option<Value> {
    backend
        .entity(ACCOUNT, &EntityKey::new(entity_type, id))
        .and_then(|(_, payload)| payload)
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_edits_replay_in_order() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;

    a.apply(EntityType::Booking, "b1", OperationKind::Create, json!({"time": "09:00", "party": 2}));
    a.sync().await;

    a.offline();
    a.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"time": "10:00", "party": 2}));
    a.updates
        .apply(EntityType::Booking, "b1", OperationKind::Delete, None)
        .unwrap();
    a.apply(EntityType::Booking, "b1", OperationKind::Create, json!({"time": "11:00", "party": 4}));
    a.apply(EntityType::Booking, "b2", OperationKind::Create, json!({"time": "12:00", "party": 1}));
    a.apply(EntityType::Booking, "b2", OperationKind::Update, json!({"time": "12:30", "party": 1}));
    assert_eq!(a.sync().await.outcome, CycleOutcome::Offline);
    assert_eq!(a.active_ops(), 2);
    // b1 still exists remotely, so the re-create goes out as an update.
    let queued = OperationQueue::new(a.h.ctx.store.clone(), ACCOUNT)
        .active_operations()
        .unwrap();
    assert_eq!(queued[0].entity_id, "b1");
    assert_eq!(queued[0].kind, OperationKind::Update);
    assert_eq!(queued[1].kind, OperationKind::Create);

    a.online();
    let report = a.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.pushed, 2);

    for id in ["b1", "b2"] {
        assert_eq!(
            remote_payload(&backend, EntityType::Booking, id),
            a.payload(EntityType::Booking, id)
        );
    }
    assert_eq!(
        remote_payload(&backend, EntityType::Booking, "b1"),
        Some(json!({"time": "11:00", "party": 4}))
    );
    assert_eq!(a.h.ctx.status().pending_operations, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_create_then_delete_never_reaches_remote() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;

    a.offline();
    a.apply(EntityType::Favorite, "f9", OperationKind::Create, json!({"venue_id": "v-9"}));
    let deleted = a
        .updates
        .apply(EntityType::Favorite, "f9", OperationKind::Delete, None)
        .unwrap();
    assert!(!deleted.is_pending);
    assert_eq!(a.active_ops(), 0);

    a.online();
    let report = a.sync().await;
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.pushed, 0);
    assert_eq!(backend.write_count(ACCOUNT), 0);
    assert_eq!(backend.entity(ACCOUNT, &EntityKey::new(EntityType::Favorite, "f9")), None);
    assert!(a.updates.entity(EntityType::Favorite, "f9").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_response_is_not_applied_twice() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;
    a.apply(EntityType::Settings, "prefs", OperationKind::Create, json!({"locale": "en"}));

    a.h.remote.drop_next_responses(1);
    let report = a.sync().await;

    assert_eq!(report.pushed, 1);
    assert_eq!(backend.write_count(ACCOUNT), 1);
    let record = a.updates.entity(EntityType::Settings, "prefs").unwrap().unwrap();
    assert!(record.is_confirmed);
    assert_eq!(record.version, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_update_rolls_back() {
    let backend = Arc::new(MemoryBackend::new().with_validator(|op| {
        match op
            .payload
            .as_ref()
            .and_then(|payload| payload.get("party"))
            .and_then(Value::as_i64)
        {
            Some(party) if party > 20 => Err(format!("party of {party} exceeds venue capacity")),
            _ => Ok(()),
        }
    }));
    let a = Peer::new("dev-a", backend.clone()).await;
    a.apply(EntityType::Booking, "b1", OperationKind::Create, json!({"party": 2}));
    a.sync().await;

    a.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"party": 50}));
    assert_eq!(a.payload(EntityType::Booking, "b1"), Some(json!({"party": 50})));

    let report = a.sync().await;
    assert_eq!(report.failed, 1);
    assert_eq!(a.payload(EntityType::Booking, "b1"), Some(json!({"party": 2})));
    assert_eq!(remote_payload(&backend, EntityType::Booking, "b1"), Some(json!({"party": 2})));

    let failed = a.updates.list().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]
        .error
        .as_deref()
        .is_some_and(|error| error.contains("capacity")));
    let sent = a.h.notifier.sent.lock().unwrap().clone();
    assert!(sent.iter().any(|(_, kind)| *kind == NotificationType::SyncFailed));

    a.updates.dismiss(&failed[0].id).unwrap();
    assert!(a.updates.list().unwrap().is_empty());
    assert_eq!(a.payload(EntityType::Booking, "b1"), Some(json!({"party": 2})));
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_change_never_overwrites_pending_edit() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;
    let b = Peer::new("dev-b", backend.clone()).await;

    a.apply(EntityType::Booking, "b1", OperationKind::Create, json!({"time": "09:00"}));
    a.sync().await;
    b.sync().await;

    a.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"time": "10:00"}));
    a.sync().await;
    b.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"time": "11:00"}));
    let mut events = b.h.ctx.events.subscribe();

    let report = b
        .coordinator
        .pull_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(b.payload(EntityType::Booking, "b1"), Some(json!({"time": "11:00"})));

    let raised = std::iter::from_fn(|| events.try_recv().ok()).find_map(|event| match event {
        SyncEvent::ConflictRaised(conflict) => Some(conflict),
        _ => None,
    });
    let conflict = raised.unwrap();
    assert_eq!(conflict.local_payload, Some(json!({"time": "11:00"})));
    assert_eq!(conflict.remote_payload, Some(json!({"time": "10:00"})));

    // Edits stay blocked while the conflict is open.
    assert!(matches!(
        b.updates.apply(
            EntityType::Booking,
            "b1",
            OperationKind::Update,
            Some(json!({"time": "12:00"}))
        ),
        Err(Error::EntityBlocked(_))
    ));
    let pending = b.updates.get_pending_updates().unwrap();
    assert_eq!(pending[0].conflict_id, Some(conflict.conflict_id));

    let resolver = crate::conflict::ConflictResolver::new(b.h.ctx.clone());
    resolver
        .resolve(&conflict.conflict_id, Resolution::KeepLocal)
        .unwrap();
    b.sync().await;

    assert_eq!(remote_payload(&backend, EntityType::Booking, "b1"), Some(json!({"time": "11:00"})));
    a.sync().await;
    assert_eq!(a.payload(EntityType::Booking, "b1"), Some(json!({"time": "11:00"})));
    assert_eq!(resolver.history().unwrap().len(), 1);
    assert_eq!(b.h.ctx.status().conflicts, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_change_never_overwrites_failed_edit() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;
    let b = Peer::new("dev-b", backend.clone()).await;

    a.apply(EntityType::Booking, "b1", OperationKind::Create, json!({"n": 1}));
    a.sync().await;
    b.sync().await;

    a.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"n": 2}));
    let failed = a.updates.get_pending_updates().unwrap()[0].id;
    a.updates
        .reconcile(
            &failed,
            ReconcileOutcome::Exhausted {
                reason: "timeout".into(),
            },
        )
        .unwrap();

    b.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"n": 3}));
    b.sync().await;

    let report = a.sync().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.pulled, 0);
    assert_eq!(a.payload(EntityType::Booking, "b1"), Some(json!({"n": 2})));

    let update = a.updates.get(&failed).unwrap().unwrap();
    let conflict_id = update.conflict_id.unwrap();
    assert!(matches!(a.updates.dismiss(&failed), Err(Error::EntityBlocked(_))));

    crate::conflict::ConflictResolver::new(a.h.ctx.clone())
        .resolve(&conflict_id, Resolution::KeepRemote)
        .unwrap();

    let record = a.updates.entity(EntityType::Booking, "b1").unwrap().unwrap();
    assert_eq!(record.payload, Some(json!({"n": 3})));
    assert_eq!(record.confirmed_payload, Some(json!({"n": 3})));
    assert_eq!(record.version, 2);
    assert!(record.is_confirmed);
    assert!(a.updates.list().unwrap().is_empty());
    assert_eq!(a.active_ops(), 0);

    assert_eq!(a.sync().await.pushed, 0);
    assert_eq!(remote_payload(&backend, EntityType::Booking, "b1"), Some(json!({"n": 3})));
}

#[tokio::test(flavor = "multi_thread")]
async fn favorite_toggled_offline_on_two_devices() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;
    let b = Peer::new("dev-b", backend.clone()).await;
    let favorite = json!({"venue_id": "v-42"});

    for peer in [&a, &b] {
        peer.offline();
        peer.apply(EntityType::Favorite, "v-42", OperationKind::Create, favorite.clone());
        peer.updates
            .apply(EntityType::Favorite, "v-42", OperationKind::Delete, None)
            .unwrap();
        peer.apply(EntityType::Favorite, "v-42", OperationKind::Create, favorite.clone());
        assert_eq!(peer.active_ops(), 1);
    }

    a.online();
    b.online();
    a.sync().await;
    b.sync().await;
    a.sync().await;

    assert_eq!(backend.write_count(ACCOUNT), 1);
    assert_eq!(remote_payload(&backend, EntityType::Favorite, "v-42"), Some(favorite.clone()));
    for peer in [&a, &b] {
        assert_eq!(peer.payload(EntityType::Favorite, "v-42"), Some(favorite.clone()));
        assert_eq!(peer.active_ops(), 0);
        assert_eq!(peer.h.ctx.status().conflicts, 0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn disjoint_field_edits_merge() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;
    let b = Peer::new("dev-b", backend.clone()).await;

    a.apply(EntityType::Booking, "b1", OperationKind::Create, json!({"time": "09:00", "notes": ""}));
    a.sync().await;
    b.sync().await;

    a.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"time": "10:30", "notes": ""}));
    b.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"time": "09:00", "notes": "window seat"}));
    a.sync().await;
    let report = b.sync().await;
    assert_eq!(report.conflicts, 0);

    let merged = json!({"time": "10:30", "notes": "window seat"});
    assert_eq!(remote_payload(&backend, EntityType::Booking, "b1"), Some(merged.clone()));
    assert_eq!(b.payload(EntityType::Booking, "b1"), Some(merged.clone()));
    a.sync().await;
    assert_eq!(a.payload(EntityType::Booking, "b1"), Some(merged));

    let history = crate::conflict::ConflictResolver::new(b.h.ctx.clone())
        .history()
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].resolution.as_ref().map(Resolution::strategy), Some("merged"));
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_delete_wins_over_local_update() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;
    let b = Peer::new("dev-b", backend.clone()).await;

    a.apply(EntityType::Booking, "b1", OperationKind::Create, json!({"time": "09:00"}));
    a.sync().await;
    b.sync().await;

    a.updates
        .apply(EntityType::Booking, "b1", OperationKind::Delete, None)
        .unwrap();
    a.sync().await;
    b.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"time": "10:00"}));
    let mut events = b.h.ctx.events.subscribe();

    let report = b.sync().await;
    assert_eq!(report.conflicts, 0);
    assert_eq!(b.payload(EntityType::Booking, "b1"), None);
    assert_eq!(remote_payload(&backend, EntityType::Booking, "b1"), None);

    let discarded = std::iter::from_fn(|| events.try_recv().ok()).find_map(|event| match event {
        SyncEvent::UpdateDiscarded { side, payload, .. } => Some((side, payload)),
        _ => None,
    });
    assert_eq!(discarded, Some((DiscardedSide::Local, Some(json!({"time": "10:00"})))));
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_restores_onto_new_device_and_catches_up() {
    let backend = Arc::new(MemoryBackend::new());
    let a = Peer::new("dev-a", backend.clone()).await;
    a.apply(EntityType::Booking, "b1", OperationKind::Create, json!({"time": "09:00"}));
    a.apply(EntityType::Settings, "prefs", OperationKind::Create, json!({"dark": true}));
    a.sync().await;

    let backups = crate::backup::BackupManager::new(a.h.ctx.clone());
    let backup_id = backups.create_backup(BackupReason::Manual).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tandem-backup.json");
    backups.export_backup(&backup_id, &path).unwrap();

    // Written after the backup; the post-restore pull must bring it in.
    a.apply(EntityType::Booking, "b1", OperationKind::Update, json!({"time": "10:00"}));
    a.sync().await;

    let remote = crate::remote::MemoryRemoteStore::new(backend.clone(), ACCOUNT);
    let session = SyncSession::open(
        ACCOUNT,
        &device_info("dev-new"),
        crate::store::LocalStore::open(dir.path().join("new.db")).unwrap(),
        crate::config::SyncConfig::default(),
        Arc::new(remote),
        Arc::new(crate::notify::LogNotifier),
    )
    .unwrap();
    session.backups().import_backup(&path).unwrap();
    let report = session.restore_backup(&backup_id).await.unwrap();
    assert_eq!(report.entities_restored, 2);
    assert_eq!(report.operations_discarded, 0);

    let updates = session.updates();
    let booking = updates.entity(EntityType::Booking, "b1").unwrap().unwrap();
    assert_eq!(booking.payload, Some(json!({"time": "10:00"})));
    assert_eq!(booking.version, 2);
    let prefs = updates.entity(EntityType::Settings, "prefs").unwrap().unwrap();
    assert_eq!(prefs.payload, Some(json!({"dark": true})));
    assert!(session.devices().is_registered().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_survives_restart_mid_dispatch() {
    let backend = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.db");
    let remote = crate::remote::MemoryRemoteStore::new(backend.clone(), ACCOUNT);

    let open = || {
        SyncSession::open(
            ACCOUNT,
            &device_info("dev-a"),
            crate::store::LocalStore::open(&path).unwrap(),
            crate::config::SyncConfig::default(),
            Arc::new(remote.clone()),
            Arc::new(crate::notify::LogNotifier),
        )
        .unwrap()
    };

    {
        let session = open();
        session
            .updates()
            .apply(EntityType::Booking, "b1", OperationKind::Create, Some(json!({"n": 1})))
            .unwrap();
        // Claimed for dispatch when the process dies.
        session.queue().dequeue_next().unwrap().unwrap();
    }

    let session = open();
    assert_eq!(session.status().pending_operations, 1);
    let report = session.sync_now().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(backend.write_count(ACCOUNT), 1);
}
