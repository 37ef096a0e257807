//! Hand-off to the platform notification component

use serde::Serialize;
use serde_json::Value;

/// Category of a queued notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    ConflictRequiresAttention,
    SyncFailed,
    OperationsDiscarded,
}

/// Queues user-facing notifications. Delivery is someone else's job.
pub trait Notifier: Send + Sync {
    fn queue_notification(&self, title: &str, body: &str, kind: NotificationType, data: Value);
}

/// Default notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn queue_notification(&self, title: &str, body: &str, kind: NotificationType, data: Value) {
        tracing::info!(?kind, %data, "Notification queued: {title} - {body}");
    }
}
