//! In-process event bus
//!
//! Live fan-out of session events to streaming clients. Durability is the
//! store's job; the bus only carries what current subscribers can absorb.
//! A slow subscriber loses events from the tail of its buffer, never the
//! middle, and can re-sync from the store using event ids.

use crate::db::SessionEvent;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Per-subscriber buffer capacity. A full buffer drops events for that
/// subscriber only.
const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<SessionEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a session's live events.
    pub fn subscribe(&self, session_id: &str) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .write()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver to every current subscriber without blocking. Subscribers
    /// whose channel has closed are pruned lazily on the next publish that
    /// observes them.
    pub fn publish(&self, event: &SessionEvent) {
        let mut closed = false;
        {
            let subscribers = self.subscribers.read().unwrap();
            let Some(senders) = subscribers.get(&event.session_id) else {
                return;
            };
            for tx in senders {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(
                            session_id = %event.session_id,
                            event_type = %event.event_type,
                            "Subscriber buffer full, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
                }
            }
        }

        if closed {
            self.prune(&event.session_id);
        }
    }

    /// Drop all subscriptions for a session (terminal cleanup).
    pub fn remove_session(&self, session_id: &str) {
        self.subscribers.write().unwrap().remove(session_id);
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.subscribers
            .read()
            .unwrap()
            .get(session_id)
            .map_or(0, Vec::len)
    }

    fn prune(&self, session_id: &str) {
        let mut subscribers = self.subscribers.write().unwrap();
        if let Some(senders) = subscribers.get_mut(session_id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                subscribers.remove(session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EventType;
    use chrono::Utc;
    use serde_json::json;

    fn event(session_id: &str, id: i64) -> SessionEvent {
        SessionEvent {
            id,
            session_id: session_id.to_string(),
            event_type: EventType::Output,
            data: json!({"line": id}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe("s1");
        let mut rx2 = bus.subscribe("s1");
        let mut other = bus.subscribe("s2");

        bus.publish(&event("s1", 1));

        assert_eq!(rx1.recv().await.unwrap().id, 1);
        assert_eq!(rx2.recv().await.unwrap().id, 1);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_never_blocks_and_drops_from_tail() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("s1");

        // Overfill the buffer; publish must not block or fail
        for i in 0..(SUBSCRIBER_BUFFER as i64 + 16) {
            bus.publish(&event("s1", i));
        }

        // The consumer sees a strictly in-order prefix of the published
        // sequence; everything past the buffer was dropped from the tail
        let mut seen = Vec::new();
        while let Ok(e) = rx.try_recv() {
            seen.push(e.id);
        }
        assert_eq!(seen.len(), SUBSCRIBER_BUFFER);
        let expected: Vec<i64> = (0..SUBSCRIBER_BUFFER as i64).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_closed_subscribers_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("s1");
        let _rx2 = bus.subscribe("s1");
        assert_eq!(bus.subscriber_count("s1"), 2);

        drop(rx);
        bus.publish(&event("s1", 1));
        assert_eq!(bus.subscriber_count("s1"), 1);
    }

    #[tokio::test]
    async fn test_remove_session() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("s1");
        bus.remove_session("s1");

        bus.publish(&event("s1", 1));
        assert!(rx.recv().await.is_none());
    }
}
