#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-workers** – Publisher, consumer, and perspective background workers
//! (SPEC_FULL.md §4.6–§4.8).
//!
//! Each worker owns one receiver half of [`conduit_coordinator::CoordinatorReceivers`] and drives
//! claimed work through the Ordered Stream Processor (`conduit-stream-processor`) before reporting
//! outcomes back through a [`conduit_coordinator::WorkCoordinator`]. None of the three blocks the
//! coordinator on I/O: transport calls and receptor/projection handler calls happen entirely on the
//! worker's own task.

pub mod consumer;
pub mod perspective;
pub mod perspective_model;
pub mod publisher;

pub use consumer::{ConsumerConfig, ConsumerDispatcher, ConsumerSubscriber, ReceptorHandler};
pub use perspective::{PerspectiveWorker, PerspectiveWorkerConfig};
pub use perspective_model::{IndexExtractor, InMemoryPerspectiveMaterializer, ModelAction, PerspectiveMaterializer, PerspectiveRow, ProjectionHandler};
pub use publisher::{PublisherConfig, PublisherWorker};
