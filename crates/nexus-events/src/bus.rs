//! Event bus seam and the in-memory implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use nexus_config::log_events_debug;
use tokio::sync::broadcast;

use crate::event::ChangeEvent;
use crate::Result;

/// Subscription handle: a lazy stream of events the consumer drives.
/// Dropping it releases the subscription.
pub struct EventStream {
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl EventStream {
    pub fn new(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, waiting as long as the caller lets the future live.
    /// Lagged subscribers skip ahead rather than erroring out.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log_events_debug!("event subscriber lagged", skipped = skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Pub/sub over change events, partitioned by zone.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: ChangeEvent) -> Result<()>;

    /// Subscribe to one zone's partition.
    async fn subscribe(&self, zone: &str) -> Result<EventStream>;
}

/// Tokio-broadcast bus for single-process deployments and tests. External
/// message buses plug in behind the same trait.
pub struct InMemoryEventBus {
    channels: DashMap<String, broadcast::Sender<ChangeEvent>>,
    capacity: usize,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, zone: &str) -> broadcast::Sender<ChangeEvent> {
        self.channels
            .entry(zone.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: ChangeEvent) -> Result<()> {
        // No subscribers is not an error
        let _ = self.sender(&event.zone).send(event);
        Ok(())
    }

    async fn subscribe(&self, zone: &str) -> Result<EventStream> {
        Ok(EventStream::new(self.sender(zone).subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[tokio::test]
    async fn publish_reaches_zone_subscribers_only() {
        let bus = InMemoryEventBus::new();
        let mut stream_a = bus.subscribe("zone-a").await.unwrap();

        bus.publish(ChangeEvent::new(EventKind::FileWrite, "/f", 1, "zone-b"))
            .await
            .unwrap();
        bus.publish(ChangeEvent::new(EventKind::FileWrite, "/g", 2, "zone-a"))
            .await
            .unwrap();

        let event = stream_a.next().await.unwrap();
        assert_eq!(event.path, "/g");
        assert_eq!(event.zone, "zone-a");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryEventBus::new();
        bus.publish(ChangeEvent::new(EventKind::FileDelete, "/x", 1, "z"))
            .await
            .unwrap();
    }
}
