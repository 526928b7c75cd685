#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-runtime** – Composition root for the conduit Work Coordination Engine.
//!
//! This crate wires a storage backend, a transport, a work-coordinator strategy, and the
//! publisher/consumer/perspective workers (`conduit-workers`, C6–C8) into one running
//! [`Runtime`], the way `toka-runtime::Runtime` bridges the kernel, storage, and event bus in the
//! teacher crate. An application builds a [`RuntimeConfig`] (or loads one from the environment)
//! and a [`RuntimeDeps`] bundle of its own collaborators (event registry, transport, receptors,
//! projection handlers), then calls [`Runtime::new`].

mod config;

use std::collections::HashMap;
use std::sync::Arc;

use conduit_coordinator::{CoordinatorCore, ImmediateCoordinator, IntervalCoordinator, ScopedCoordinator, WorkCoordinator};
use conduit_store_core::{CallerIdentity, StorageBackend, WorkCoordinatorStore};
use conduit_transport_core::{Subscription, Transport, TransportHandler};
use conduit_types::{EventRegistry, InstanceId};
use conduit_workers::{
    ConsumerConfig, ConsumerDispatcher, ConsumerSubscriber, PerspectiveMaterializer, PerspectiveWorker, PerspectiveWorkerConfig,
    ProjectionHandler, PublisherConfig, PublisherWorker, ReceptorHandler,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(feature = "memory-storage")]
use conduit_store_memory::MemoryStore;
#[cfg(feature = "postgres-storage")]
use conduit_store_postgres::PostgresStore;

pub use config::{CoordinatorStrategyConfig, RuntimeConfig, StorageConfig};

/// Application-supplied collaborators a [`Runtime`] wires together. Unlike [`RuntimeConfig`]
/// (tunable knobs, loadable from the environment), everything here is a concrete dependency the
/// host application must construct itself.
pub struct RuntimeDeps {
    /// Stream-key resolvers, handler dispatch table, and perspective associations.
    pub registry: EventRegistry,
    /// Broker/transport adapter used by the publisher and consumer workers.
    pub transport: Arc<dyn Transport>,
    /// Destinations the consumer subscribes to at startup.
    pub subscribe_destinations: Vec<String>,
    /// Receptor logic, keyed by `handler_name`.
    pub receptors: HashMap<String, Arc<dyn ReceptorHandler>>,
    /// Projection handlers, keyed by perspective name.
    pub projection_handlers: HashMap<String, Arc<dyn ProjectionHandler>>,
    /// Where projected perspective rows are materialised.
    pub materializer: Arc<dyn PerspectiveMaterializer>,
}

/// A complete, running conduit instance.
///
/// Encapsulates the storage backend, transport, work coordinator, and the three background
/// workers, mirroring the teacher's `Runtime` struct (kernel + storage + bus + persistence task).
pub struct Runtime {
    store: Arc<dyn StorageBackend>,
    coordinator: Arc<dyn WorkCoordinator>,
    transport: Arc<dyn Transport>,
    registry: Arc<EventRegistry>,
    cancellation: CancellationToken,
    worker_tasks: Vec<JoinHandle<()>>,
    subscriptions: Vec<Subscription>,
}

impl Runtime {
    /// Build and start a runtime: creates the storage backend, the chosen coordinator strategy,
    /// and spawns the publisher, consumer, and perspective workers as background tasks.
    pub async fn new(config: RuntimeConfig, deps: RuntimeDeps) -> Result<Self, RuntimeError> {
        info!(service_name = %config.service_name, "initializing conduit runtime");

        let identity = CallerIdentity {
            instance_id: InstanceId::new(),
            service_name: config.service_name.clone(),
            host_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            process_id: std::process::id(),
        };

        let registry = Arc::new(deps.registry);
        let (store, coordinator_store) = Self::create_storage_backend(&config.storage, registry.associations().clone()).await?;
        debug!(storage = ?config.storage, "created storage backend");

        let (core, receivers) = CoordinatorCore::new(coordinator_store, identity.clone(), config.coordinator_config());
        let core = Arc::new(core);
        let coordinator: Arc<dyn WorkCoordinator> = match &config.coordinator_strategy {
            CoordinatorStrategyConfig::Immediate => Arc::new(ImmediateCoordinator::new(core)),
            CoordinatorStrategyConfig::Interval { .. } => {
                let polling = config.coordinator_strategy.polling().expect("interval strategy always carries a polling config");
                Arc::new(IntervalCoordinator::new(core, polling))
            }
            CoordinatorStrategyConfig::Scoped => Arc::new(ScopedCoordinator::new(core)),
        };
        debug!("created work coordinator");

        let cancellation = CancellationToken::new();

        let publisher = PublisherWorker::new(
            coordinator.clone(),
            deps.transport.clone(),
            receivers.outbox_rx,
            identity.instance_id,
            PublisherConfig {
                max_attempts: config.max_attempts,
                parallelize_streams: config.parallelize_streams,
                max_concurrency: config.max_concurrency,
                max_batch_size: config.worker_batch_size,
            },
        );
        let consumer = ConsumerDispatcher::new(
            coordinator.clone(),
            receivers.inbox_rx,
            deps.receptors,
            ConsumerConfig {
                max_attempts: config.max_attempts,
                parallelize_streams: config.parallelize_streams,
                max_concurrency: config.max_concurrency,
                max_batch_size: config.worker_batch_size,
            },
        );
        let perspective = PerspectiveWorker::new(
            store.clone(),
            coordinator.clone(),
            receivers.perspective_rx,
            deps.projection_handlers,
            deps.materializer,
            PerspectiveWorkerConfig {
                parallelize_streams: config.parallelize_streams,
                max_concurrency: config.max_concurrency,
                max_batch_size: config.worker_batch_size,
            },
        );

        let worker_tasks = vec![
            tokio::spawn(publisher.run(cancellation.clone())),
            tokio::spawn(consumer.run(cancellation.clone())),
            tokio::spawn(perspective.run(cancellation.clone())),
        ];
        debug!("spawned publisher, consumer, and perspective workers");

        let subscriber: Arc<dyn TransportHandler> = Arc::new(ConsumerSubscriber::new(store.clone(), coordinator.clone(), registry.clone()));
        let subscriptions = deps
            .subscribe_destinations
            .iter()
            .map(|destination| deps.transport.subscribe(destination, subscriber.clone()))
            .collect();

        // A reliable transport redelivers until acknowledged, which only matters if dedup records
        // outlive a redelivery window left at its default (SPEC_FULL.md §9 Open Question).
        if deps.transport.capabilities().contains(conduit_transport_core::TransportCapabilities::RELIABLE) && config.retention_days == RuntimeConfig::default().retention_days {
            tracing::warn!(retention_days = config.retention_days, "transport is reliable (redelivers until acked) but dedup retention_days is still at its default; a long redelivery window can outlive dedup records and reprocess a message");
        }

        info!("conduit runtime initialized");

        Ok(Self { store, coordinator, transport: deps.transport, registry, cancellation, worker_tasks, subscriptions })
    }

    async fn create_storage_backend(
        storage: &StorageConfig,
        associations: conduit_types::MessageAssociationTable,
    ) -> Result<(Arc<dyn StorageBackend>, Arc<dyn WorkCoordinatorStore>), RuntimeError> {
        match storage {
            #[cfg(feature = "memory-storage")]
            StorageConfig::Memory => {
                let store = Arc::new(MemoryStore::new(associations));
                Ok((store.clone(), store))
            }
            #[cfg(feature = "postgres-storage")]
            StorageConfig::Postgres { database_url } => {
                let store = Arc::new(PostgresStore::connect(database_url, associations).await.map_err(|err| RuntimeError::Storage(err.to_string()))?);
                Ok((store.clone(), store))
            }
            #[cfg(not(feature = "memory-storage"))]
            StorageConfig::Memory => Err(RuntimeError::Configuration("memory-storage feature not enabled".to_string())),
        }
    }

    /// The storage backend this runtime was built with, for direct reads (e.g. a demo app's own
    /// query layer).
    pub fn store(&self) -> Arc<dyn StorageBackend> {
        self.store.clone()
    }

    /// The work coordinator, for application handlers that queue new outbox/inbox rows.
    pub fn coordinator(&self) -> Arc<dyn WorkCoordinator> {
        self.coordinator.clone()
    }

    /// The transport adapter, for publishing outside the normal outbox flow (rare; most
    /// applications only ever queue outbox rows through the coordinator).
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// The event registry this runtime was built with.
    pub fn registry(&self) -> Arc<EventRegistry> {
        self.registry.clone()
    }

    /// Shut the runtime down: stop accepting new subscription deliveries, cancel the three
    /// background workers and wait for in-flight batches to finish, then flush and dispose the
    /// coordinator.
    pub async fn shutdown(self) -> Result<(), RuntimeError> {
        info!("shutting down conduit runtime");

        for subscription in self.subscriptions {
            subscription.stop();
        }

        self.cancellation.cancel();
        for task in self.worker_tasks {
            let _ = task.await;
        }

        self.coordinator.dispose().await.map_err(|err| RuntimeError::Storage(err.to_string()))?;

        info!("conduit runtime shutdown complete");
        Ok(())
    }
}

/// Errors that can occur while building or tearing down a [`Runtime`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Configuration was missing or malformed.
    #[error("runtime configuration error: {0}")]
    Configuration(String),
    /// The storage backend failed to initialize.
    #[error("storage backend error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_store_core::NewOutboxItem;
    use conduit_transport_core::InMemoryTransport;
    use conduit_workers::InMemoryPerspectiveMaterializer;

    fn test_deps() -> RuntimeDeps {
        RuntimeDeps {
            registry: EventRegistry::new(),
            transport: Arc::new(InMemoryTransport::new(16)),
            subscribe_destinations: vec!["orders".to_string()],
            receptors: HashMap::new(),
            projection_handlers: HashMap::new(),
            materializer: Arc::new(InMemoryPerspectiveMaterializer::new(Arc::new(|_: &serde_json::Value| serde_json::Map::new()))),
        }
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig { coordinator_strategy: CoordinatorStrategyConfig::Immediate, ..RuntimeConfig::default() }
    }

    #[tokio::test]
    async fn runtime_creation_wires_every_component() {
        let runtime = Runtime::new(test_config(), test_deps()).await.unwrap();
        let _store = runtime.store();
        let _coordinator = runtime.coordinator();
        let _transport = runtime.transport();
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn queued_outbox_item_is_published_through_the_wired_transport() {
        let runtime = Runtime::new(test_config(), test_deps()).await.unwrap();
        let coordinator = runtime.coordinator();

        coordinator
            .queue_new_outbox(NewOutboxItem {
                message_id: None,
                destination: "orders".to_string(),
                message_type: "test.widget".to_string(),
                payload: serde_json::json!({"n": 1}),
                metadata: serde_json::json!({}),
                scope: None,
                stream_id: None,
                carries_event: false,
                scheduled_for: None,
            })
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        runtime.shutdown().await.unwrap();
    }
}
