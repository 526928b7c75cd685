//! Consumer worker (SPEC_FULL.md §4.7): subscribes to transport destinations, stores received
//! envelopes durably before acknowledging, and drives claimed inbox work to registered receptors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_coordinator::WorkCoordinator;
use conduit_store_core::{InboxCompletion, InboxFailure, InboxRecord, NewInboxItem, StorageBackend};
use conduit_stream_processor::{process_ordered, ProcessOutcome, StreamProcessorError};
use conduit_transport_core::TransportHandler;
use conduit_types::{ConduitError, Envelope, EventRegistry, StatusFlags};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Application-supplied receptor logic, keyed by `handler_name` in [`ConsumerDispatcher`].
#[async_trait]
pub trait ReceptorHandler: Send + Sync {
    /// Handle one delivered envelope. Errors are classified the same way as the publisher's
    /// transport errors (`is_retryable`) to decide whether the inbox row's retry budget is spent.
    async fn handle(&self, envelope: &Envelope) -> Result<(), ConduitError>;
}

/// Receives envelopes from the transport and stores them in the inbox before acknowledging.
///
/// This is deliberately a separate type from [`ConsumerDispatcher`] (rather than one struct
/// implementing both [`TransportHandler`] and driving the claim loop) because `TransportHandler`
/// requires `Send + Sync` and the dispatcher owns an exclusive `mpsc::Receiver`.
pub struct ConsumerSubscriber {
    store: Arc<dyn StorageBackend>,
    coordinator: Arc<dyn WorkCoordinator>,
    registry: Arc<EventRegistry>,
}

impl ConsumerSubscriber {
    /// Build a subscriber that looks up receptor names and stream-key resolvers in `registry`.
    pub fn new(store: Arc<dyn StorageBackend>, coordinator: Arc<dyn WorkCoordinator>, registry: Arc<EventRegistry>) -> Self {
        Self { store, coordinator, registry }
    }
}

#[async_trait]
impl TransportHandler for ConsumerSubscriber {
    async fn handle(&self, _destination: &str, envelope: Envelope) {
        let handlers = self.registry.handlers_for(&envelope.message_type);
        if handlers.is_empty() {
            tracing::debug!(message_type = %envelope.message_type, "no receptor registered for message type, dropping");
            return;
        }
        let stream_id = self.registry.resolve_stream_key(&envelope.message_type, &envelope.payload);

        for registered in handlers {
            match self.store.has_processed(envelope.message_id, registered.name).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(?err, handler = registered.name, "dedup check failed, skipping this delivery");
                    continue;
                }
            }

            // Queueing synchronously (via an Immediate coordinator) is what makes this the
            // acknowledgment point: the row is durable before `handle` returns. Interval/Scoped
            // coordinators trade that guarantee for batching throughput.
            self.coordinator
                .queue_new_inbox(NewInboxItem {
                    message_id: envelope.message_id,
                    handler_name: registered.name.to_string(),
                    message_type: envelope.message_type.clone(),
                    payload: envelope.payload.clone(),
                    metadata: serde_json::Value::Null,
                    stream_id,
                    scheduled_for: None,
                })
                .await;
        }
    }
}

/// Tuning knobs for [`ConsumerDispatcher`].
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Attempts allowed before a retryable receptor error becomes terminal.
    pub max_attempts: u32,
    /// Whether distinct streams dispatch concurrently.
    pub parallelize_streams: bool,
    /// Concurrency bound when `parallelize_streams` is true.
    pub max_concurrency: usize,
    /// Upper bound on how many items are drained from the channel into one processing batch.
    pub max_batch_size: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { max_attempts: 5, parallelize_streams: true, max_concurrency: 8, max_batch_size: 256 }
    }
}

#[derive(Debug, Clone, Copy)]
struct DispatchAttempt {
    terminal: bool,
}

/// Drives claimed inbox rows to the registered receptor and reports the outcome back to the
/// coordinator as a receptor completion/failure.
pub struct ConsumerDispatcher {
    coordinator: Arc<dyn WorkCoordinator>,
    inbox_rx: mpsc::Receiver<InboxRecord>,
    receptors: HashMap<String, Arc<dyn ReceptorHandler>>,
    config: ConsumerConfig,
}

impl ConsumerDispatcher {
    /// Build a dispatcher consuming inbox work claimed by `coordinator` and handed out through
    /// `inbox_rx`, routing by `handler_name` to `receptors`.
    pub fn new(coordinator: Arc<dyn WorkCoordinator>, inbox_rx: mpsc::Receiver<InboxRecord>, receptors: HashMap<String, Arc<dyn ReceptorHandler>>, config: ConsumerConfig) -> Self {
        Self { coordinator, inbox_rx, receptors, config }
    }

    /// Run until the channel closes or `cancellation` fires.
    pub async fn run(mut self, cancellation: CancellationToken) {
        loop {
            if cancellation.is_cancelled() {
                break;
            }

            let first = tokio::select! {
                item = self.inbox_rx.recv() => item,
                _ = cancellation.cancelled() => None,
            };
            let Some(first) = first else { break };

            let mut batch = vec![first];
            while batch.len() < self.config.max_batch_size {
                match self.inbox_rx.try_recv() {
                    Ok(item) => batch.push(item),
                    Err(_) => break,
                }
            }

            for item in &batch {
                self.coordinator.renew_inbox_lease(item.message_id, item.handler_name.clone()).await;
            }

            let receptors = self.receptors.clone();
            let max_attempts = self.config.max_attempts;
            let outcomes = process_ordered(batch, self.config.parallelize_streams, self.config.max_concurrency, cancellation.clone(), move |item: InboxRecord| {
                let receptors = receptors.clone();
                async move { dispatch_one(&receptors, max_attempts, item).await }
            })
            .await;

            self.report(outcomes).await;
        }
    }

    async fn report(&self, outcomes: Vec<ProcessOutcome<(String, DispatchAttempt)>>) {
        for outcome in outcomes {
            match outcome.result {
                Ok((handler_name, _)) => {
                    self.coordinator
                        .queue_receptor_completion(InboxCompletion {
                            message_id: outcome.message_id,
                            handler_name,
                            status_flags: StatusFlags::PUBLISHED,
                            mark_processed: true,
                        })
                        .await;
                }
                Err(err) => {
                    let (handler_name, attempt) = err.partial_status;
                    self.coordinator
                        .queue_receptor_failure(InboxFailure {
                            message_id: outcome.message_id,
                            handler_name,
                            partial_status_flags: StatusFlags::STORED,
                            error: err.error,
                            terminal: attempt.terminal,
                        })
                        .await;
                }
            }
        }
    }
}

async fn dispatch_one(
    receptors: &HashMap<String, Arc<dyn ReceptorHandler>>,
    max_attempts: u32,
    record: InboxRecord,
) -> Result<(String, DispatchAttempt), StreamProcessorError<(String, DispatchAttempt)>> {
    let handler_name = record.handler_name.clone();
    let Some(receptor) = receptors.get(&handler_name).cloned() else {
        return Err(StreamProcessorError::new(
            (handler_name.clone(), DispatchAttempt { terminal: true }),
            format!("no receptor registered for handler {handler_name}"),
        ));
    };

    let envelope = Envelope { message_id: record.message_id, message_type: record.message_type.clone(), hops: Vec::new(), payload: record.payload.clone() };

    match receptor.handle(&envelope).await {
        Ok(()) => Ok((handler_name, DispatchAttempt { terminal: false })),
        Err(err) => {
            let terminal = !err.is_retryable() || record.attempts + 1 >= max_attempts;
            Err(StreamProcessorError::new((handler_name, DispatchAttempt { terminal }), err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::{InstanceId, MessageId, PartitionNumber};

    struct Echo(Arc<std::sync::Mutex<Vec<Envelope>>>);

    #[async_trait]
    impl ReceptorHandler for Echo {
        async fn handle(&self, envelope: &Envelope) -> Result<(), ConduitError> {
            self.0.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl ReceptorHandler for AlwaysFails {
        async fn handle(&self, _envelope: &Envelope) -> Result<(), ConduitError> {
            Err(ConduitError::ValidationError("nope".into()))
        }
    }

    fn sample_record(handler_name: &str) -> InboxRecord {
        InboxRecord {
            message_id: MessageId::new(),
            handler_name: handler_name.to_string(),
            message_type: "test.widget".into(),
            payload: serde_json::json!({"n": 1}),
            metadata: serde_json::json!({}),
            attempts: 0,
            error: None,
            failure_reason: None,
            created_at: chrono::Utc::now(),
            processed_at: None,
            instance_id: None,
            lease_expiry: None,
            stream_id: None,
            partition_number: PartitionNumber(0),
            status_flags: StatusFlags::STORED,
            scheduled_for: None,
        }
    }

    #[tokio::test]
    async fn successful_dispatch_reports_completion() {
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let receptors: HashMap<String, Arc<dyn ReceptorHandler>> = HashMap::from([("index_search".to_string(), Arc::new(Echo(received.clone())) as Arc<dyn ReceptorHandler>)]);

        let record = sample_record("index_search");
        let (handler_name, attempt) = dispatch_one(&receptors, 5, record).await.unwrap();
        assert_eq!(handler_name, "index_search");
        assert!(!attempt.terminal);
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_handler_is_terminal() {
        let receptors: HashMap<String, Arc<dyn ReceptorHandler>> = HashMap::new();
        let record = sample_record("missing_handler");
        let err = dispatch_one(&receptors, 5, record).await.unwrap_err();
        assert!(err.partial_status.1.terminal);
    }

    #[tokio::test]
    async fn validation_error_is_terminal_immediately() {
        let receptors: HashMap<String, Arc<dyn ReceptorHandler>> = HashMap::from([("index_search".to_string(), Arc::new(AlwaysFails) as Arc<dyn ReceptorHandler>)]);
        let record = sample_record("index_search");
        let err = dispatch_one(&receptors, 5, record).await.unwrap_err();
        assert!(err.partial_status.1.terminal);
    }

    #[tokio::test]
    async fn subscriber_skips_already_processed_messages() {
        let store = Arc::new(conduit_store_memory::MemoryStore::new(conduit_types::MessageAssociationTable::new()));
        let identity = conduit_store_core::CallerIdentity { instance_id: InstanceId::new(), service_name: "consumer-test".into(), host_name: "localhost".into(), process_id: 1 };
        let config = conduit_coordinator::CoordinatorConfig { partition_count: 4, max_partitions_per_instance: 4, lease_seconds: 30, stale_threshold_seconds: 60, batch_size: 10, debug_mode: false };
        let (core, _receivers) = conduit_coordinator::CoordinatorCore::new(store.clone(), identity, config);
        let coordinator: Arc<dyn WorkCoordinator> = Arc::new(conduit_coordinator::ImmediateCoordinator::new(Arc::new(core)));

        let mut registry = EventRegistry::new();
        registry.register_handler("test.widget", "index_search", 0);
        let registry = Arc::new(registry);

        let subscriber = ConsumerSubscriber::new(store.clone(), coordinator, registry);
        let envelope = Envelope::new("test.widget", InstanceId::new(), &serde_json::json!({"n": 1})).unwrap();

        store.mark_processed(envelope.message_id, "index_search").await.unwrap();
        subscriber.handle("orders", envelope).await;
    }
}
