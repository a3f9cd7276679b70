//! Typed transport lifecycle events.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::Error;

/// Everything the transport announces to observers.
///
/// Delivered over a broadcast channel: emission never blocks the
/// transport, and a subscriber that falls behind loses the oldest
/// events rather than stalling anyone.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is open and usable.
    Ready,
    /// The connection closed, with the error that caused it if any.
    Close(Option<Arc<Error>>),
    /// A message left through `publish`/`send`.
    Publish {
        /// Routing key of the outbound message.
        routing_key: String,
    },
    /// An inbound delivery is about to be dispatched.
    Pre {
        /// Routing key of the delivery.
        routing_key: String,
    },
    /// An inbound delivery finished processing (reply sent or audited).
    After {
        /// Routing key of the delivery.
        routing_key: String,
    },
    /// The private reply queue exists and RPC calls may proceed.
    PrivateQueueReady {
        /// Name of the private queue.
        queue: String,
    },
    /// A consumed queue (re-)established its consumer and bindings.
    ConsumedQueueReconnected {
        /// Name of the consumed queue.
        queue: String,
    },
    /// A consumer was torn down.
    ConsumerClose {
        /// Name of the queue the consumer was attached to.
        queue: String,
    },
    /// An unexpected error surfaced outside any caller's future.
    Error(Arc<Error>),
}

/// Broadcast fan-out of [`TransportEvent`]s.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<TransportEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.tx.subscribe()
    }

    /// Sends an event to whoever listens. Nobody listening is fine.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_every_subscriber() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(TransportEvent::Ready);

        assert!(matches!(first.recv().await.unwrap(), TransportEvent::Ready));
        assert!(matches!(second.recv().await.unwrap(), TransportEvent::Ready));
    }

    #[test]
    fn emitting_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(TransportEvent::Publish {
            routing_key: "echo".to_string(),
        });
    }
}
