//! Perspective worker (SPEC_FULL.md §4.8): advances claimed perspective checkpoints by replaying
//! missing events through a registered projection handler and applying the resulting
//! [`ModelAction`](crate::perspective_model::ModelAction) to a materialised read model.

use std::collections::HashMap;
use std::sync::Arc;

use conduit_coordinator::WorkCoordinator;
use conduit_store_core::{PerspectiveCheckpoint, PerspectiveCompletion, PerspectiveFailure, StorageBackend};
use conduit_stream_processor::{process_ordered, ProcessOutcome, StreamItem, StreamProcessorError};
use conduit_types::{MessageId, StreamId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::perspective_model::{ModelAction, PerspectiveMaterializer, ProjectionHandler};

/// Tuning knobs for [`PerspectiveWorker`].
#[derive(Debug, Clone)]
pub struct PerspectiveWorkerConfig {
    /// Whether distinct streams project concurrently.
    pub parallelize_streams: bool,
    /// Concurrency bound when `parallelize_streams` is true.
    pub max_concurrency: usize,
    /// Upper bound on how many checkpoints are drained from the channel into one batch.
    pub max_batch_size: usize,
}

impl Default for PerspectiveWorkerConfig {
    fn default() -> Self {
        Self { parallelize_streams: true, max_concurrency: 8, max_batch_size: 128 }
    }
}

struct ClaimedCheckpoint {
    checkpoint: PerspectiveCheckpoint,
    // Synthetic per-tick ordering key: `PerspectiveCheckpoint` carries no `MessageId` of its own,
    // but the stream processor groups/sorts on one, so each claimed checkpoint gets a fresh
    // UUIDv7 at claim time purely to give it a stable processing order within the batch.
    order_key: MessageId,
}

impl StreamItem for ClaimedCheckpoint {
    fn stream_id(&self) -> Option<StreamId> {
        Some(self.checkpoint.stream_id)
    }

    fn message_id(&self) -> MessageId {
        self.order_key
    }
}

#[derive(Debug, Clone)]
struct AdvanceOutcome {
    perspective_name: String,
    last_processed_event_id: Option<MessageId>,
}

/// Drains claimed perspective checkpoints and advances each by replaying missing events.
pub struct PerspectiveWorker {
    store: Arc<dyn StorageBackend>,
    coordinator: Arc<dyn WorkCoordinator>,
    perspective_rx: mpsc::Receiver<PerspectiveCheckpoint>,
    handlers: HashMap<String, Arc<dyn ProjectionHandler>>,
    materializer: Arc<dyn PerspectiveMaterializer>,
    config: PerspectiveWorkerConfig,
}

impl PerspectiveWorker {
    /// Build a perspective worker consuming checkpoints claimed by `coordinator` and handed out
    /// through `perspective_rx`, routing by `perspective_name` to `handlers`.
    pub fn new(
        store: Arc<dyn StorageBackend>,
        coordinator: Arc<dyn WorkCoordinator>,
        perspective_rx: mpsc::Receiver<PerspectiveCheckpoint>,
        handlers: HashMap<String, Arc<dyn ProjectionHandler>>,
        materializer: Arc<dyn PerspectiveMaterializer>,
        config: PerspectiveWorkerConfig,
    ) -> Self {
        Self { store, coordinator, perspective_rx, handlers, materializer, config }
    }

    /// Run until the channel closes or `cancellation` fires.
    pub async fn run(mut self, cancellation: CancellationToken) {
        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let first = tokio::select! {
                item = self.perspective_rx.recv() => item,
                _ = cancellation.cancelled() => None,
            };
            let Some(first) = first else { break };

            let mut batch = vec![ClaimedCheckpoint { checkpoint: first, order_key: MessageId::new() }];
            while batch.len() < self.config.max_batch_size {
                match self.perspective_rx.try_recv() {
                    Ok(checkpoint) => batch.push(ClaimedCheckpoint { checkpoint, order_key: MessageId::new() }),
                    Err(_) => break,
                }
            }

            let store = self.store.clone();
            let handlers = self.handlers.clone();
            let materializer = self.materializer.clone();
            let outcomes = process_ordered(batch, self.config.parallelize_streams, self.config.max_concurrency, cancellation.clone(), move |item: ClaimedCheckpoint| {
                let store = store.clone();
                let handlers = handlers.clone();
                let materializer = materializer.clone();
                async move { advance_checkpoint(store.as_ref(), &handlers, materializer.as_ref(), item.checkpoint).await }
            })
            .await;

            self.report(outcomes).await;
        }
    }

    async fn report(&self, outcomes: Vec<ProcessOutcome<AdvanceOutcome>>) {
        for outcome in outcomes {
            let Some(stream_id) = outcome.stream_id else {
                tracing::error!("perspective outcome missing stream id, this is a stream-processor invariant violation");
                continue;
            };
            match outcome.result {
                Ok(advance) => {
                    let last_processed_event_id = advance
                        .last_processed_event_id
                        .expect("a successful advance always replays at least one event, since checkpoints are only claimed when behind");
                    self.coordinator
                        .queue_perspective_completion(PerspectiveCompletion { stream_id, perspective_name: advance.perspective_name, last_processed_event_id })
                        .await;
                }
                Err(err) => {
                    self.coordinator
                        .queue_perspective_failure(PerspectiveFailure {
                            stream_id,
                            perspective_name: err.partial_status.perspective_name,
                            partial_last_processed_event_id: err.partial_status.last_processed_event_id,
                            error: err.error,
                        })
                        .await;
                }
            }
        }
    }
}

async fn advance_checkpoint(
    store: &dyn StorageBackend,
    handlers: &HashMap<String, Arc<dyn ProjectionHandler>>,
    materializer: &dyn PerspectiveMaterializer,
    checkpoint: PerspectiveCheckpoint,
) -> Result<AdvanceOutcome, StreamProcessorError<AdvanceOutcome>> {
    let perspective_name = checkpoint.perspective_name.clone();
    let progress = |last_processed_event_id: Option<MessageId>| AdvanceOutcome { perspective_name: perspective_name.clone(), last_processed_event_id };

    let Some(handler) = handlers.get(&perspective_name) else {
        return Err(StreamProcessorError::new(progress(None), format!("no projection handler registered for perspective {perspective_name}")));
    };

    let events = match store.read_stream(checkpoint.stream_id, 0).await {
        Ok(events) => events,
        Err(err) => return Err(StreamProcessorError::new(progress(None), err.to_string())),
    };

    let start = match checkpoint.last_processed_event_id {
        Some(last) => events.iter().position(|event| event.envelope.message_id == last).map(|idx| idx + 1).unwrap_or(0),
        None => 0,
    };

    let mut advanced = checkpoint.last_processed_event_id;
    for event in &events[start..] {
        let action = match handler.project(event).await {
            Ok(action) => action,
            Err(err) => return Err(StreamProcessorError::new(progress(advanced), err.to_string())),
        };
        let is_purge = matches!(action, ModelAction::Purge);
        if let Err(err) = materializer.apply(checkpoint.stream_id, &perspective_name, action).await {
            return Err(StreamProcessorError::new(progress(advanced), err.to_string()));
        }
        if is_purge {
            // Erase the checkpoint row itself, not just the materialised model — a lazily
            // recreated checkpoint still reprojects this stream from scratch, but that is the
            // same re-derivation any newly-registered perspective goes through, not a resurrection
            // of the purged data (the row, once recreated, starts at `last_processed_event_id: None`
            // and the handler decides what to do with each event again).
            if let Err(err) = store.purge_perspective_checkpoint(checkpoint.stream_id, &perspective_name).await {
                return Err(StreamProcessorError::new(progress(advanced), err.to_string()));
            }
        }
        advanced = Some(event.envelope.message_id);
    }

    Ok(progress(advanced))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_store_core::{EventRecord, PerspectiveStatus};
    use conduit_types::{ConduitError, Envelope, InstanceId, PartitionNumber};

    struct UpsertName;

    #[async_trait]
    impl ProjectionHandler for UpsertName {
        async fn project(&self, event: &EventRecord) -> Result<ModelAction, ConduitError> {
            Ok(ModelAction::Upsert(event.envelope.payload.clone()))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ProjectionHandler for AlwaysFails {
        async fn project(&self, _event: &EventRecord) -> Result<ModelAction, ConduitError> {
            Err(ConduitError::Unknown("projection exploded".into()))
        }
    }

    struct AlwaysPurges;

    #[async_trait]
    impl ProjectionHandler for AlwaysPurges {
        async fn project(&self, _event: &EventRecord) -> Result<ModelAction, ConduitError> {
            Ok(ModelAction::Purge)
        }
    }

    fn event(stream_id: StreamId, name: &str) -> EventRecord {
        let envelope = Envelope::new("product.created", InstanceId::new(), &serde_json::json!({"name": name})).unwrap();
        EventRecord { stream_id, sequence: 0, envelope, event_type: "product.created".into(), created_at: chrono::Utc::now() }
    }

    fn checkpoint(stream_id: StreamId, last_processed_event_id: Option<MessageId>) -> PerspectiveCheckpoint {
        PerspectiveCheckpoint {
            stream_id,
            perspective_name: "catalog".into(),
            last_processed_event_id,
            status: PerspectiveStatus::InProgress,
            processed_at: None,
            error: None,
            instance_id: None,
            lease_expiry: None,
            partition_number: PartitionNumber(0),
        }
    }

    struct FakeStore {
        events: Vec<EventRecord>,
        purged: std::sync::Mutex<Vec<(StreamId, String)>>,
    }

    impl FakeStore {
        fn new(events: Vec<EventRecord>) -> Self {
            Self { events, purged: std::sync::Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl StorageBackend for FakeStore {
        async fn append_event(&self, _stream_id: StreamId, _envelope: Envelope) -> Result<i64, conduit_store_core::StorageError> {
            unimplemented!()
        }

        async fn read_stream(&self, _stream_id: StreamId, _from_sequence: i64) -> Result<Vec<EventRecord>, conduit_store_core::StorageError> {
            Ok(self.events.clone())
        }

        async fn last_sequence(&self, _stream_id: StreamId) -> Result<i64, conduit_store_core::StorageError> {
            Ok(self.events.len() as i64 - 1)
        }

        async fn has_processed(&self, _message_id: MessageId, _handler_name: &str) -> Result<bool, conduit_store_core::StorageError> {
            Ok(false)
        }

        async fn mark_processed(&self, _message_id: MessageId, _handler_name: &str) -> Result<(), conduit_store_core::StorageError> {
            Ok(())
        }

        async fn purge_perspective_checkpoint(&self, stream_id: StreamId, perspective_name: &str) -> Result<(), conduit_store_core::StorageError> {
            self.purged.lock().unwrap().push((stream_id, perspective_name.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn advances_checkpoint_through_all_missing_events() {
        let stream = StreamId::from_key("Product:p1");
        let events = vec![event(stream, "first"), event(stream, "second")];
        let expected_last = events[1].envelope.message_id;
        let store = FakeStore::new(events);

        let handlers: HashMap<String, Arc<dyn ProjectionHandler>> = HashMap::from([("catalog".to_string(), Arc::new(UpsertName) as Arc<dyn ProjectionHandler>)]);
        let materializer = Arc::new(crate::perspective_model::InMemoryPerspectiveMaterializer::new(Arc::new(|model: &serde_json::Value| {
            let mut map = serde_json::Map::new();
            if let Some(name) = model.get("name") {
                map.insert("name".to_string(), name.clone());
            }
            map
        })));

        let outcome = advance_checkpoint(&store, &handlers, materializer.as_ref(), checkpoint(stream, None)).await.unwrap();
        assert_eq!(outcome.last_processed_event_id, Some(expected_last));

        let row = materializer.read(stream, "catalog").await.unwrap().unwrap();
        assert_eq!(row.model["name"], "second");
        assert_eq!(row.version, 2);
    }

    #[tokio::test]
    async fn failure_reports_partial_progress() {
        let stream = StreamId::from_key("Product:p1");
        let events = vec![event(stream, "first"), event(stream, "second")];
        let store = FakeStore::new(events);

        let handlers: HashMap<String, Arc<dyn ProjectionHandler>> = HashMap::from([("catalog".to_string(), Arc::new(AlwaysFails) as Arc<dyn ProjectionHandler>)]);
        let materializer = Arc::new(crate::perspective_model::InMemoryPerspectiveMaterializer::new(Arc::new(|_: &serde_json::Value| serde_json::Map::new())));

        let err = advance_checkpoint(&store, &handlers, materializer.as_ref(), checkpoint(stream, None)).await.unwrap_err();
        assert_eq!(err.partial_status.last_processed_event_id, None, "no event applied before the first one failed");
    }

    #[tokio::test]
    async fn purge_removes_the_row_and_erases_the_checkpoint() {
        let stream = StreamId::from_key("Product:p1");
        let events = vec![event(stream, "first")];
        let store = FakeStore::new(events);

        let handlers: HashMap<String, Arc<dyn ProjectionHandler>> = HashMap::from([("catalog".to_string(), Arc::new(AlwaysPurges) as Arc<dyn ProjectionHandler>)]);
        let materializer = Arc::new(crate::perspective_model::InMemoryPerspectiveMaterializer::new(Arc::new(|_: &serde_json::Value| serde_json::Map::new())));
        materializer.apply(stream, "catalog", ModelAction::Upsert(serde_json::json!({"name": "pre-purge"}))).await.unwrap();

        advance_checkpoint(&store, &handlers, materializer.as_ref(), checkpoint(stream, None)).await.unwrap();

        assert!(materializer.read(stream, "catalog").await.unwrap().is_none(), "the materialised row is gone");
        assert_eq!(store.purged.lock().unwrap().as_slice(), [(stream, "catalog".to_string())], "the checkpoint row itself was erased, not just the model");
    }
}
