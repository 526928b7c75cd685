//! Runtime configuration (SPEC_FULL.md §8's configuration surface table), loadable from
//! environment variables via the `config` crate, grounded on the teacher's `RuntimeConfig` /
//! `StorageConfig` pair and on `choice-sherpa::config::AppConfig::load`'s env-loading shape.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-memory, single-process storage. Not durable across restarts.
    Memory,
    /// Postgres-backed storage, required once more than one instance runs concurrently
    /// (SPEC_FULL.md's partition-leasing model assumes a shared store).
    #[cfg(feature = "postgres-storage")]
    Postgres {
        /// `postgres://` connection string.
        database_url: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Which work-coordinator strategy (SPEC_FULL.md §4.4) this instance runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum CoordinatorStrategyConfig {
    /// Flush on every queue call.
    Immediate,
    /// Flush on an adaptive timer.
    Interval {
        /// Fastest tick, in milliseconds, when there is work to do.
        min_interval_ms: u64,
        /// Slowest tick, in milliseconds, reached after sustained idleness.
        max_interval_ms: u64,
        /// Consecutive empty flushes tolerated before the interval backs off.
        idle_threshold_polls: u32,
    },
    /// Flush once per explicitly ended scope.
    Scoped,
}

impl Default for CoordinatorStrategyConfig {
    fn default() -> Self {
        CoordinatorStrategyConfig::Interval { min_interval_ms: 100, max_interval_ms: 5000, idle_threshold_polls: 2 }
    }
}

impl CoordinatorStrategyConfig {
    pub(crate) fn polling(&self) -> Option<conduit_coordinator::interval::PollingConfig> {
        match self {
            CoordinatorStrategyConfig::Interval { min_interval_ms, max_interval_ms, idle_threshold_polls } => {
                Some(conduit_coordinator::interval::PollingConfig {
                    min_interval: Duration::from_millis(*min_interval_ms),
                    max_interval: Duration::from_millis(*max_interval_ms),
                    idle_threshold_polls: *idle_threshold_polls,
                })
            }
            _ => None,
        }
    }
}

/// Root runtime configuration. Every field has a spec-mandated default, so `RuntimeConfig::load`
/// works with zero environment variables set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Logical service name, used as [`conduit_store_core::CallerIdentity::service_name`].
    pub service_name: String,
    /// Storage backend selection.
    pub storage: StorageConfig,
    /// Work-coordinator strategy.
    pub coordinator_strategy: CoordinatorStrategyConfig,
    /// Number of hash buckets partitions are assigned into.
    pub partition_count: u32,
    /// Per-instance cap on claimed partitions.
    pub max_partitions_per_instance: u32,
    /// Lease lifetime, in seconds.
    pub lease_seconds: i64,
    /// Instance-liveness window, in seconds.
    pub stale_threshold_seconds: i64,
    /// Max items claimed per `process_work_batch` round trip.
    pub batch_size: u32,
    /// Dedup-record retention window, in days.
    pub retention_days: u32,
    /// Attach extra telemetry to every `process_work_batch` round trip.
    pub debug_mode: bool,
    /// Whether distinct streams process concurrently in the Ordered Stream Processor.
    pub parallelize_streams: bool,
    /// Concurrency bound when `parallelize_streams` is true.
    pub max_concurrency: usize,
    /// Attempts allowed before a retryable publish/dispatch error becomes terminal.
    pub max_attempts: u32,
    /// Max items drained into one worker processing batch.
    pub worker_batch_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "conduit".to_string(),
            storage: StorageConfig::default(),
            coordinator_strategy: CoordinatorStrategyConfig::default(),
            partition_count: 10_000,
            max_partitions_per_instance: 100,
            lease_seconds: 300,
            stale_threshold_seconds: 600,
            batch_size: 256,
            retention_days: 30,
            debug_mode: false,
            parallelize_streams: true,
            max_concurrency: 8,
            max_attempts: 5,
            worker_batch_size: 256,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables, falling back to spec defaults for anything
    /// unset.
    ///
    /// Reads a `.env` file if present (development convenience), then environment variables
    /// prefixed `CONDUIT__`, with `__` separating nested fields (e.g. `CONDUIT__LEASE_SECONDS=60`,
    /// `CONDUIT__STORAGE__BACKEND=memory`).
    pub fn load() -> Result<Self, RuntimeError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::default().prefix("CONDUIT").separator("__"))
            .build()
            .map_err(|err| RuntimeError::Configuration(err.to_string()))?;

        config.try_deserialize().map_err(|err| RuntimeError::Configuration(err.to_string()))
    }

    pub(crate) fn coordinator_config(&self) -> conduit_coordinator::CoordinatorConfig {
        conduit_coordinator::CoordinatorConfig {
            partition_count: self.partition_count,
            max_partitions_per_instance: self.max_partitions_per_instance,
            lease_seconds: self.lease_seconds,
            stale_threshold_seconds: self.stale_threshold_seconds,
            batch_size: self.batch_size,
            debug_mode: self.debug_mode,
        }
    }
}
