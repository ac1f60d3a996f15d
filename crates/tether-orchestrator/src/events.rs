//! Dashboard event fan-out
//!
//! Delivery is best-effort: a client that is not subscribed when an event
//! is emitted misses it and resyncs through the list endpoints.

use tokio::sync::broadcast;

use tether_core::api::DashboardEvent;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<DashboardEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Push an event to every current subscriber; never blocks
    pub fn emit(&self, event: DashboardEvent) {
        let name = event.name();
        match self.tx.send(event) {
            Ok(receivers) => tracing::debug!("Broadcast {} to {} subscriber(s)", name, receivers),
            Err(_) => tracing::trace!("Dropped {} (no subscribers)", name),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::types::InstanceId;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let events = EventBroadcaster::new();
        events.emit(DashboardEvent::InstancesReordered { ids: vec![] });
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let events = EventBroadcaster::new();
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        events.emit(DashboardEvent::InstancesReordered {
            ids: vec![InstanceId::new("x")],
        });

        assert_eq!(a.recv().await.unwrap().name(), "instances:reordered");
        assert_eq!(b.recv().await.unwrap().name(), "instances:reordered");
    }
}
