#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-coordinator** – Work-coordinator strategies (SPEC_FULL.md §4.4).
//!
//! Sits between the unit-of-work layer (`conduit-uow`, C3) and the transactional store
//! (`conduit-store-core::WorkCoordinatorStore::process_work_batch`, C2). Buffers queued
//! enqueues/completions/failures and decides, per strategy, when to flush them in one round
//! trip — writing any newly claimed work straight into downstream channels so workers never have
//! to poll for locally produced work.

mod core;
pub mod immediate;
pub mod interval;
pub mod scoped;

use async_trait::async_trait;
use conduit_store_core::{
    InboxCompletion, InboxFailure, NewInboxItem, NewOutboxItem, OutboxCompletion, OutboxFailure,
    PerspectiveCompletion, PerspectiveFailure, StorageError, WorkBatch,
};
use conduit_types::MessageId;

pub use crate::core::{CoordinatorChannels, CoordinatorConfig, CoordinatorCore, CoordinatorReceivers};
pub use immediate::ImmediateCoordinator;
pub use interval::IntervalCoordinator;
pub use scoped::ScopedCoordinator;

/// Adapter in front of the work-batch procedure (SPEC_FULL §4.4). All three strategies below
/// implement this trait with an identical surface; they differ only in when `flush` is triggered
/// implicitly.
#[async_trait]
pub trait WorkCoordinator: Send + Sync {
    /// Queue a new outbox row for the next flush.
    async fn queue_new_outbox(&self, item: NewOutboxItem);
    /// Queue a new inbox row for the next flush.
    async fn queue_new_inbox(&self, item: NewInboxItem);
    /// Queue an outbox completion for the next flush.
    async fn queue_outbox_completion(&self, completion: OutboxCompletion);
    /// Queue an outbox failure for the next flush.
    async fn queue_outbox_failure(&self, failure: OutboxFailure);
    /// Queue an inbox completion for the next flush.
    async fn queue_inbox_completion(&self, completion: InboxCompletion);
    /// Queue an inbox failure for the next flush.
    async fn queue_inbox_failure(&self, failure: InboxFailure);
    /// Queue a receptor-dispatch completion for the next flush.
    async fn queue_receptor_completion(&self, completion: InboxCompletion);
    /// Queue a receptor-dispatch failure for the next flush.
    async fn queue_receptor_failure(&self, failure: InboxFailure);
    /// Queue a perspective-checkpoint completion for the next flush.
    async fn queue_perspective_completion(&self, completion: PerspectiveCompletion);
    /// Queue a perspective-checkpoint failure for the next flush.
    async fn queue_perspective_failure(&self, failure: PerspectiveFailure);
    /// Request that `id`'s lease be renewed on the next flush (only takes effect if the caller
    /// still owns the row).
    async fn renew_outbox_lease(&self, id: MessageId);
    /// Request that `(id, handler_name)`'s lease be renewed on the next flush.
    async fn renew_inbox_lease(&self, id: MessageId, handler_name: String);
    /// Force an immediate round trip, regardless of the strategy's normal trigger.
    async fn flush(&self) -> Result<WorkBatch, StorageError>;
    /// Flush any pending state, then refuse further queueing.
    async fn dispose(&self) -> Result<(), StorageError>;
}
