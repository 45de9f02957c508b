//! Status events published to subscribers.

use stash_engine::{EntityKey, MutationId, TableName, UserId};
use std::time::Duration;
use tokio::sync::broadcast;

/// Something observable happened in the sync runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A user's local records were written; UI queries over these keys
    /// should refresh
    RecordsChanged { user_id: UserId, keys: Vec<EntityKey> },
    /// A flush finished and removed acknowledged or rejected entries
    FlushCompleted {
        user_id: UserId,
        pushed: usize,
        rejected: usize,
        remaining: usize,
    },
    /// A flush failed; mutations stay queued
    FlushFailed {
        user_id: UserId,
        error: String,
        retry_in: Option<Duration>,
    },
    /// The server refused a mutation permanently; the change could not be saved
    MutationRejected {
        user_id: UserId,
        mutation_id: MutationId,
        key: EntityKey,
        reason: String,
    },
    /// A remote delete discarded a pending local change
    ConflictDetected {
        user_id: UserId,
        key: EntityKey,
        mutation_id: MutationId,
    },
    /// A pull of one table finished
    PullCompleted {
        user_id: UserId,
        table: TableName,
        applied: usize,
        staged: usize,
    },
}

/// Fan-out of [`SyncEvent`]s. Sending never blocks; slow subscribers lag.
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

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(SyncEvent::RecordsChanged {
            user_id: "alice".into(),
            keys: vec![EntityKey::new("events", "1")],
        });

        assert!(matches!(a.recv().await.unwrap(), SyncEvent::RecordsChanged { .. }));
        assert!(matches!(b.recv().await.unwrap(), SyncEvent::RecordsChanged { .. }));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(0);
        bus.emit(SyncEvent::FlushFailed {
            user_id: "alice".into(),
            error: "offline".into(),
            retry_in: None,
        });
    }
}
