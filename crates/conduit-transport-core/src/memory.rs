//! In-memory reference transport, grounded on the teacher's `toka_bus_core::InMemoryBus`
//! (broadcast-channel-per-topic fan-out) but keyed per destination rather than a single global
//! channel, since SPEC_FULL.md's outbox/inbox rows each carry their own destination string.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conduit_types::{ConduitError, Envelope};
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::{Subscription, Transport, TransportCapabilities, TransportHandler};

const DEFAULT_CAPACITY: usize = 1024;

/// Single-process transport that delivers synchronously via `tokio::sync::broadcast`, one channel
/// per destination, created lazily on first publish or subscribe.
///
/// Advertises `PublishSubscribe | Ordered` (within one destination, broadcast preserves send
/// order to all receivers) — it does not advertise `Reliable`, since a lagging subscriber can miss
/// messages when the ring buffer overflows, matching the teacher bus's own documented trade-off.
#[derive(Clone)]
pub struct InMemoryTransport {
    capacity: usize,
    channels: Arc<DashMap<String, broadcast::Sender<Envelope>>>,
    ready: Arc<AtomicBool>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InMemoryTransport {
    /// Create a transport whose per-destination ring buffers hold `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, channels: Arc::new(DashMap::new()), ready: Arc::new(AtomicBool::new(true)) }
    }

    /// Test hook: simulate the transport not yet being connected.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn sender_for(&self, destination: &str) -> broadcast::Sender<Envelope> {
        self.channels
            .entry(destination.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), ConduitError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(ConduitError::TransportNotReady(destination.to_string()));
        }
        // A send with zero subscribers is not an error — at-least-once delivery only applies to
        // subscribers that exist at publish time, same as the teacher's `InMemoryBus::publish`.
        let _ = self.sender_for(destination).send(envelope);
        Ok(())
    }

    fn subscribe(&self, destination: &str, handler: Arc<dyn TransportHandler>) -> Subscription {
        let mut rx = self.sender_for(destination).subscribe();
        let destination = destination.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => handler.handle(&destination, envelope).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(destination = %destination, skipped, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription::new(task)
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::PUBLISH_SUBSCRIBE | TransportCapabilities::ORDERED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::InstanceId;
    use std::sync::Mutex;

    struct Collector(Arc<Mutex<Vec<Envelope>>>);

    #[async_trait]
    impl TransportHandler for Collector {
        async fn handle(&self, _destination: &str, envelope: Envelope) {
            self.0.lock().unwrap().push(envelope);
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let transport = InMemoryTransport::new(16);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sub = transport.subscribe("orders", Arc::new(Collector(received.clone())));

        let envelope = Envelope::new("test.widget", InstanceId::new(), &serde_json::json!({"n": 1})).unwrap();
        transport.publish("orders", envelope.clone()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(received.lock().unwrap().len(), 1);
        assert_eq!(received.lock().unwrap()[0].message_id, envelope.message_id);
        sub.stop();
    }

    #[tokio::test]
    async fn publish_fails_when_not_ready() {
        let transport = InMemoryTransport::new(16);
        transport.set_ready(false);
        let envelope = Envelope::new("test.widget", InstanceId::new(), &serde_json::json!({"n": 1})).unwrap();
        let err = transport.publish("orders", envelope).await.unwrap_err();
        assert!(matches!(err, ConduitError::TransportNotReady(_)));
    }
}
