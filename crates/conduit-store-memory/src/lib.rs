#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-store-memory** – In-memory reference implementation of the conduit work-coordination
//! store.
//!
//! This backend is not meant to scale past one process: the entire work-batch procedure runs
//! behind a single `tokio::sync::Mutex`, trading throughput for an implementation simple enough
//! to read as a specification of [`conduit_store_core::WorkCoordinatorStore::process_work_batch`]'s
//! semantics. It backs the crate's own tests, the demo app's default mode, and
//! `conduit-store-postgres`'s test suite (which runs the same scenarios against both backends and
//! asserts they agree).

mod batch;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use conduit_store_core::{EventRecord, StorageBackend, StorageError};
use conduit_types::{Envelope, MessageAssociationTable, MessageId, StreamId};

use conduit_store_core::{DedupRecord, InboxRecord, OutboxRecord, PartitionAssignment, PerspectiveCheckpoint, ServiceInstanceRecord};

/// All mutable state the work-batch procedure touches, guarded by one mutex so that the whole
/// operation is atomic (SPEC_FULL.md §4.2's "all-or-nothing" requirement).
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) events: HashMap<StreamId, Vec<EventRecord>>,
    pub(crate) outbox: HashMap<MessageId, OutboxRecord>,
    pub(crate) inbox: HashMap<(MessageId, String), InboxRecord>,
    pub(crate) dedup: HashMap<(MessageId, String), DedupRecord>,
    pub(crate) checkpoints: HashMap<(StreamId, String), PerspectiveCheckpoint>,
    pub(crate) instances: HashMap<conduit_types::InstanceId, ServiceInstanceRecord>,
    pub(crate) partitions: HashMap<conduit_types::PartitionNumber, PartitionAssignment>,
}

/// An in-memory, single-process store implementing both [`StorageBackend`] and
/// [`conduit_store_core::WorkCoordinatorStore`].
pub struct MemoryStore {
    pub(crate) state: Mutex<State>,
    pub(crate) associations: MessageAssociationTable,
}

impl MemoryStore {
    /// Create an empty store. `associations` declares which `(EventType, PerspectiveName)` pairs
    /// this service instance maintains — consulted when claiming perspective work
    /// (SPEC_FULL §4.2 step 10).
    pub fn new(associations: MessageAssociationTable) -> Self {
        Self {
            state: Mutex::new(State::default()),
            associations,
        }
    }

    /// Number of events stored across all streams. Useful for tests and demo-app reporting.
    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn append_event(&self, stream_id: StreamId, envelope: Envelope) -> Result<i64, StorageError> {
        let mut state = self.state.lock().await;
        let stream = state.events.entry(stream_id).or_default();
        let sequence = stream.len() as i64;
        stream.push(EventRecord {
            stream_id,
            sequence,
            event_type: envelope.message_type.clone(),
            envelope,
            created_at: Utc::now(),
        });
        Ok(sequence)
    }

    async fn read_stream(&self, stream_id: StreamId, from_sequence: i64) -> Result<Vec<EventRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .get(&stream_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.sequence >= from_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last_sequence(&self, stream_id: StreamId) -> Result<i64, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .get(&stream_id)
            .map(|records| records.len() as i64 - 1)
            .unwrap_or(-1))
    }

    async fn has_processed(&self, message_id: MessageId, handler_name: &str) -> Result<bool, StorageError> {
        let state = self.state.lock().await;
        Ok(state.dedup.contains_key(&(message_id, handler_name.to_string())))
    }

    async fn mark_processed(&self, message_id: MessageId, handler_name: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .dedup
            .entry((message_id, handler_name.to_string()))
            .or_insert(DedupRecord {
                message_id,
                handler_name: handler_name.to_string(),
                processed_at: Utc::now(),
            });
        Ok(())
    }

    async fn purge_perspective_checkpoint(&self, stream_id: StreamId, perspective_name: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state.checkpoints.remove(&(stream_id, perspective_name.to_string()));
        Ok(())
    }
}
