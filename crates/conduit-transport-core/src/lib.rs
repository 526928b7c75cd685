#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-transport-core** – Pluggable broker/transport-adapter contract for conduit.
//!
//! This crate defines the [`Transport`] trait that the publisher and consumer workers depend on,
//! plus [`InMemoryTransport`], a reference implementation for tests and single-process demos.
//! Providing a real broker client (Kafka, NATS, SQS, ...) is explicitly out of scope (SPEC_FULL.md
//! §1 Non-goals) — applications bring their own adapter by implementing [`Transport`].

mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_types::{ConduitError, Envelope};
use tokio::task::JoinHandle;

pub use memory::InMemoryTransport;

/// Bitwise capability flags a transport advertises, mirroring the bitwise style of
/// [`conduit_types::StatusFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportCapabilities(pub u32);

impl TransportCapabilities {
    /// Synchronous request/response semantics (beyond a bare correlation-id store) are supported.
    pub const REQUEST_RESPONSE: TransportCapabilities = TransportCapabilities(1);
    /// Fan-out publish/subscribe delivery.
    pub const PUBLISH_SUBSCRIBE: TransportCapabilities = TransportCapabilities(2);
    /// Supports long-lived streaming consumption (as opposed to discrete polls).
    pub const STREAMING: TransportCapabilities = TransportCapabilities(4);
    /// Messages are redelivered until acknowledged.
    pub const RELIABLE: TransportCapabilities = TransportCapabilities(8);
    /// Preserves publish order within a destination.
    pub const ORDERED: TransportCapabilities = TransportCapabilities(16);
    /// Broker itself guarantees exactly-once delivery (rare; most brokers do not).
    pub const EXACTLY_ONCE: TransportCapabilities = TransportCapabilities(32);
    /// No capabilities.
    pub const NONE: TransportCapabilities = TransportCapabilities(0);

    /// True if `other`'s bits are all present in `self`.
    pub fn contains(self, other: TransportCapabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TransportCapabilities {
    type Output = TransportCapabilities;

    fn bitor(self, rhs: Self) -> Self::Output {
        TransportCapabilities(self.0 | rhs.0)
    }
}

/// Invoked once per message delivered to a subscription.
///
/// Implementations must not block the delivery task for long; slow handlers should hand off to
/// their own background work and return quickly, the same discipline the consumer worker (C7)
/// applies to receptor dispatch.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// Handle one delivered envelope from `destination`.
    async fn handle(&self, destination: &str, envelope: Envelope);
}

/// A live subscription. Dropping this without calling [`Subscription::stop`] leaves the
/// background delivery task running; callers that need deterministic shutdown should call `stop`
/// explicitly (mirrors `conduit_runtime::Runtime::shutdown`'s treatment of worker tasks).
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Stop receiving further deliveries for this subscription.
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Pluggable broker adapter consumed by the publisher (C6) and consumer (C7) workers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish `envelope` to `destination`. Returns [`ConduitError::TransportNotReady`] if the
    /// transport has not finished connecting, or [`ConduitError::TransportException`] on a
    /// transient send failure.
    async fn publish(&self, destination: &str, envelope: Envelope) -> Result<(), ConduitError>;

    /// Start a background subscription delivering every envelope published to `destination` to
    /// `handler`, until the returned [`Subscription`] is stopped or dropped-and-aborted.
    fn subscribe(&self, destination: &str, handler: Arc<dyn TransportHandler>) -> Subscription;

    /// The capability bitfield this transport advertises.
    fn capabilities(&self) -> TransportCapabilities;
}
