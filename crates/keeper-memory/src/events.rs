//! Broadcast event emitter for daemon notifications.
//!
//! Listeners subscribe for a receiver; dropping the receiver unsubscribes.
//! `emit` never awaits. A slow listener lags and loses old events rather
//! than blocking the daemon.

use std::sync::atomic::{AtomicU64, Ordering};

use keeper_core::ConversationId;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Notifications published by the extraction daemon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DaemonEvent {
    /// A batch persisted at least one fact.
    MemoriesExtracted {
        /// Facts persisted.
        count: usize,
        /// Source conversation.
        conversation_id: ConversationId,
    },
    /// A cycle or a conversation batch failed.
    Error {
        /// Error description.
        cause: String,
        /// Affected conversation, when the failure was per conversation.
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
}

/// Broadcast-based event emitter.
pub struct EventEmitter {
    tx: broadcast::Sender<DaemonEvent>,
    emit_count: AtomicU64,
}

impl EventEmitter {
    /// Create an emitter with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an emitter with a custom capacity (at least 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Send to all current subscribers. Returns how many received it.
    pub fn emit(&self, event: DaemonEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.tx.subscribe()
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extracted(count: usize) -> DaemonEvent {
        DaemonEvent::MemoriesExtracted {
            count,
            conversation_id: ConversationId::from("c1"),
        }
    }

    #[test]
    fn emit_without_subscribers() {
        let emitter = EventEmitter::new();
        assert_eq!(emitter.emit(extracted(1)), 0);
        assert_eq!(emitter.emit_count(), 1);
    }

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let emitter = EventEmitter::new();
        let mut a = emitter.subscribe();
        let mut b = emitter.subscribe();
        assert_eq!(emitter.emit(extracted(3)), 2);
        assert_eq!(a.recv().await.unwrap(), extracted(3));
        assert_eq!(b.recv().await.unwrap(), extracted(3));
    }

    #[test]
    fn dropping_receiver_unsubscribes() {
        let emitter = EventEmitter::new();
        let rx = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 1);
        drop(rx);
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn wire_format() {
        let json = serde_json::to_value(extracted(2)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "memories-extracted", "count": 2, "conversationId": "c1"}));

        let json = serde_json::to_value(DaemonEvent::Error {
            cause: "store offline".into(),
            conversation_id: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "error", "cause": "store offline"}));
    }
}
