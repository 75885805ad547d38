//! Broadcast-backed publish/subscribe bus

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use super::{EventSink, OutputEvent, TERMINAL_INPUT};

/// Default number of buffered events per subscriber and topic
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// A message travelling over the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    pub topic: String,
    /// Originating session, when the event belongs to one
    pub session_id: Option<Uuid>,
    pub payload: Vec<u8>,
}

/// In-process publish/subscribe channel
///
/// Each topic has its own broadcast channel, so a burst on one topic never
/// evicts buffered events of another.
#[derive(Debug, Clone)]
pub struct EventBus {
    capacity: usize,
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<BusEvent>>>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber and topic
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish a raw event. Events with no subscribers are dropped.
    pub fn emit(&self, topic: &str, session_id: Option<Uuid>, payload: Vec<u8>) {
        let tx = self.lock_topics().get(topic).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(BusEvent {
                topic: topic.to_string(),
                session_id,
                payload,
            });
        }
    }

    /// Publish bytes for the active terminal's input
    pub fn emit_input(&self, payload: Vec<u8>) {
        self.emit(TERMINAL_INPUT, None, payload);
    }

    /// Subscribe to a single topic
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let rx = self
            .lock_topics()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        Subscription {
            topic: topic.to_string(),
            rx,
        }
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<BusEvent>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventSink for EventBus {
    fn publish(&self, topic: &str, event: OutputEvent) {
        self.emit(topic, Some(event.session_id), event.data);
    }
}

/// Receiver for one topic
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<BusEvent>,
}

impl Subscription {
    /// Receive the next event on this topic
    ///
    /// Returns `None` once the bus is gone. A lagging subscriber loses the
    /// overflowed events and keeps receiving.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscriber on {} lagged by {} events", self.topic, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
