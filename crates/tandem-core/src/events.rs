//! Event channel between the sync engine and its clients

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::{Conflict, ConflictId, EntityType, OptimisticUpdate, Resolution};
use crate::state::SyncStatus;

/// Which side's change was thrown away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardedSide {
    Local,
    Remote,
}

/// Messages published by a sync session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    ConflictRaised(Conflict),
    ConflictResolved {
        conflict_id: ConflictId,
        entity_type: EntityType,
        entity_id: String,
        resolution: Resolution,
        automatic: bool,
    },
    OptimisticUpdate(OptimisticUpdate),
    /// A delete won over a concurrent update; informational only
    UpdateDiscarded {
        entity_type: EntityType,
        entity_id: String,
        side: DiscardedSide,
        payload: Option<Value>,
    },
    /// A restore dropped unsynced local operations
    OperationsDiscarded { count: usize },
}

/// Broadcast fan-out of [`SyncEvent`]s.
///
/// Publishing never blocks; slow subscribers observe `Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(SyncEvent::OperationsDiscarded { count: 3 });
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::OperationsDiscarded { count: 3 }
        );
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        EventBus::new(1).publish(SyncEvent::OperationsDiscarded { count: 0 });
    }

    #[test]
    fn events_are_tagged_by_name() {
        let event = SyncEvent::UpdateDiscarded {
            entity_type: EntityType::Booking,
            entity_id: "b1".into(),
            side: DiscardedSide::Local,
            payload: Some(json!({"notes": "x"})),
        };
        let value = serde_json::to_value(event).unwrap();
        assert_eq!(value["event"], "update_discarded");
        assert_eq!(value["side"], "local");
    }
}
