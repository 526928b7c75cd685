#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-store-core** – Durable store abstractions for the conduit runtime.
//!
//! This crate defines the contracts storage backends must satisfy: an append-only event log
//! (`StorageBackend`) and the single atomic work-batch procedure (`WorkCoordinatorStore`) that is
//! the heart of the Work Coordination Engine (SPEC_FULL.md §4.1–4.2). Concrete backends
//! (`conduit-store-memory`, `conduit-store-postgres`) implement these traits; this crate provides
//! no I/O of its own.

pub mod error;
pub mod records;
pub mod work_batch;

pub use error::StorageError;
pub use records::{
    DedupRecord, EventRecord, InboxRecord, PerspectiveCheckpoint, PerspectiveStatus,
    PartitionAssignment, ServiceInstanceRecord, OutboxRecord,
};
pub use work_batch::{
    CallerIdentity, InboxCompletion, InboxFailure, NewInboxItem, NewOutboxItem, OutboxCompletion,
    OutboxFailure, PerspectiveCompletion, PerspectiveFailure, WorkBatch, WorkBatchRequest,
};

use async_trait::async_trait;
use conduit_types::{Envelope, StreamId};

/// Abstraction over an append-only event log.
///
/// Storage backends implement this trait to provide event persistence. `append_event` must be
/// atomic and must serialise concurrent appends to the same stream (SPEC_FULL §4.1).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Append `envelope` to `stream_id`'s event log, returning the assigned dense sequence
    /// number. Fails with [`StorageError::StreamConflict`] if a concurrent append raced ahead of
    /// the caller's expected position.
    async fn append_event(&self, stream_id: StreamId, envelope: Envelope) -> Result<i64, StorageError>;

    /// Read all events in `stream_id` from `from_sequence` (inclusive) onward, in ascending
    /// sequence order.
    async fn read_stream(&self, stream_id: StreamId, from_sequence: i64) -> Result<Vec<EventRecord>, StorageError>;

    /// The highest assigned sequence number for `stream_id`, or `-1` if the stream is empty.
    async fn last_sequence(&self, stream_id: StreamId) -> Result<i64, StorageError>;

    /// True if `(message_id, handler_name)` has already been recorded as processed.
    async fn has_processed(&self, message_id: conduit_types::MessageId, handler_name: &str) -> Result<bool, StorageError>;

    /// Idempotently record that `(message_id, handler_name)` has been processed.
    async fn mark_processed(&self, message_id: conduit_types::MessageId, handler_name: &str) -> Result<(), StorageError>;

    /// Erase the `(stream_id, perspective_name)` checkpoint row entirely (SPEC_FULL §3.1's
    /// GDPR-style `Purge` action) rather than leave it for a future lazy-recreation pass to find.
    /// A no-op if no such checkpoint exists.
    async fn purge_perspective_checkpoint(&self, stream_id: StreamId, perspective_name: &str) -> Result<(), StorageError>;
}

/// The single atomic operation that applies completions/failures, inserts new outbox/inbox rows,
/// renews leases, reclaims and claims partitions, and returns newly leased work — all in one
/// round trip (SPEC_FULL §4.2).
#[async_trait]
pub trait WorkCoordinatorStore: Send + Sync {
    /// Execute one work-batch round trip. All-or-nothing: either every side effect below becomes
    /// visible, or none does.
    async fn process_work_batch(&self, request: WorkBatchRequest) -> Result<WorkBatch, StorageError>;
}

/// Convenience alias combining both store responsibilities, implemented by every conduit storage
/// backend.
pub trait ConduitStore: StorageBackend + WorkCoordinatorStore {}
impl<T> ConduitStore for T where T: StorageBackend + WorkCoordinatorStore {}

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        CallerIdentity, ConduitStore, DedupRecord, EventRecord, InboxCompletion, InboxFailure, InboxRecord,
        NewInboxItem, NewOutboxItem, OutboxCompletion, OutboxFailure, OutboxRecord,
        PartitionAssignment, PerspectiveCheckpoint, PerspectiveCompletion, PerspectiveFailure,
        PerspectiveStatus, ServiceInstanceRecord, StorageBackend, StorageError, WorkBatch,
        WorkBatchRequest, WorkCoordinatorStore,
    };
}
