use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tandem_core::models::Platform;
use tandem_core::notify::LogNotifier;
use tandem_core::remote::HttpRemoteStore;
use tandem_core::{
    DeviceInfo, EntityType, LocalStore, OperationKind, Resolution, SyncConfig, SyncSession,
};

use crate::config::AppConfig;
use crate::routes::{app_router, AppState};

async fn spawn_server() -> SocketAddr {
    let config = AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        api_tokens: HashMap::from([("tok-a".to_string(), "acct-1".to_string())]),
        rate_limit_window: Duration::from_secs(60),
        requests_per_window: 1_000,
        max_push_batch: 100,
        max_payload_bytes: 65_536,
    };
    let router = app_router(AppState::from_config(Arc::new(config)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await });
    addr
}

fn session(addr: SocketAddr, device_id: &str) -> SyncSession {
    let remote = HttpRemoteStore::new(
        format!("http://{addr}"),
        Some("tok-a".to_string()),
        Duration::from_secs(5),
    )
    .unwrap();
    let device = DeviceInfo {
        device_id: device_id.to_string(),
        platform: Platform::Web,
        app_version: "1.0".to_string(),
        os_version: "test".to_string(),
    };
    SyncSession::open(
        "acct-1",
        &device,
        LocalStore::open_in_memory().unwrap(),
        SyncConfig::default(),
        Arc::new(remote),
        Arc::new(LogNotifier),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn two_devices_sync_through_the_server() {
    let addr = spawn_server().await;
    let phone = session(addr, "phone");
    let laptop = session(addr, "laptop");

    phone
        .updates()
        .apply(
            EntityType::Booking,
            "b1",
            OperationKind::Create,
            Some(json!({"party": 2, "notes": "window"})),
        )
        .unwrap();
    let report = phone.sync_now().await.unwrap();
    assert_eq!(report.pushed, 1);

    laptop.sync_now().await.unwrap();
    let record = laptop
        .updates()
        .entity(EntityType::Booking, "b1")
        .unwrap()
        .unwrap();
    assert_eq!(record.payload, Some(json!({"party": 2, "notes": "window"})));
    assert_eq!(record.version, 1);

    let devices = laptop.devices().refresh_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices.iter().filter(|d| d.is_primary).count(), 1);

    // Both edit the same field from version 1; the second push conflicts.
    phone
        .updates()
        .apply(
            EntityType::Booking,
            "b1",
            OperationKind::Update,
            Some(json!({"party": 4, "notes": "window"})),
        )
        .unwrap();
    laptop
        .updates()
        .apply(
            EntityType::Booking,
            "b1",
            OperationKind::Update,
            Some(json!({"party": 6, "notes": "window"})),
        )
        .unwrap();
    phone.sync_now().await.unwrap();
    laptop.sync_now().await.unwrap();

    let active = laptop.conflicts().active().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].remote_version, 2);
    assert_eq!(active[0].remote_payload, Some(json!({"party": 4, "notes": "window"})));

    laptop
        .resolve_conflict(&active[0].conflict_id, Resolution::KeepLocal)
        .unwrap();
    laptop.sync_now().await.unwrap();
    assert_eq!(laptop.status().pending_operations, 0);

    phone.sync_now().await.unwrap();
    let record = phone
        .updates()
        .entity(EntityType::Booking, "b1")
        .unwrap()
        .unwrap();
    assert_eq!(record.payload, Some(json!({"party": 6, "notes": "window"})));
    assert_eq!(record.version, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_token_leaves_session_unregistered() {
    let addr = spawn_server().await;
    let remote = HttpRemoteStore::new(
        format!("http://{addr}"),
        Some("wrong".to_string()),
        Duration::from_secs(5),
    )
    .unwrap();
    let device = DeviceInfo {
        device_id: "tablet".to_string(),
        platform: Platform::Android,
        app_version: "1.0".to_string(),
        os_version: "14".to_string(),
    };
    let session = SyncSession::open(
        "acct-1",
        &device,
        LocalStore::open_in_memory().unwrap(),
        SyncConfig {
            retry_base_ms: 1,
            registry_attempts: 1,
            ..SyncConfig::default()
        },
        Arc::new(remote),
        Arc::new(LogNotifier),
    )
    .unwrap();

    let _ = session.sync_now().await;
    assert!(!session.devices().is_registered().unwrap());
}
