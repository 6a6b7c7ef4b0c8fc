use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// A domain event published when entities change. Workflow trigger bindings
/// match on `event_type`; `entity_id` is the affected document.
#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    /// Event type, e.g. "documents.document_created"
    #[serde(rename = "type")]
    pub event_type: String,
    /// Id of the affected document
    pub entity_id: i64,
    /// Id of the user who triggered the change, if any
    pub actor: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent {
    /// Create a domain event timestamped to now.
    pub fn new(event_type: impl Into<String>, entity_id: i64, actor: Option<i64>) -> Self {
        Self {
            event_type: event_type.into(),
            entity_id,
            actor,
            timestamp: Utc::now(),
        }
    }
}

/// Broadcast-based event bus for domain events.
///
/// Subscribers receive events via `tokio::sync::broadcast`. If a subscriber
/// falls behind, it receives `RecvError::Lagged` and resumes from the oldest
/// retained event.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a domain event. If there are no subscribers the event is dropped silently.
    pub fn publish(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to domain events.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::new("documents.document_created", 42, Some(1)));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "documents.document_created");
        assert_eq!(event.entity_id, 42);
    }

    #[tokio::test]
    async fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        // Publishing with no subscribers should not panic
        bus.publish(DomainEvent::new("documents.document_trashed", 1, None));
    }

    #[tokio::test]
    async fn lagged_subscriber() {
        let bus = EventBus::new(2); // tiny buffer
        let mut rx = bus.subscribe();

        // Overflow the buffer
        for i in 0..5 {
            bus.publish(DomainEvent::new(format!("event.{i}"), i, None));
        }

        // First recv should be Lagged
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(_)) => {} // expected
            other => panic!("Expected Lagged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(DomainEvent::new("documents.document_edited", 7, Some(3)));

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event_type, e2.event_type);
        assert_eq!(e1.entity_id, e2.entity_id);
    }

    #[tokio::test]
    async fn domain_event_serializes_type_field() {
        let event = DomainEvent::new("documents.document_trashed", 9, None);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"documents.document_trashed""#));
        assert!(!json.contains("event_type"));
    }
}
