//! Row shapes for the tables described in SPEC_FULL.md §3.
//!
//! Column-naming here is the logical contract; a concrete backend (e.g.
//! `conduit-store-postgres`) may lay out its SQL schema differently as long as every semantic
//! column below is representable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conduit_types::{Envelope, InstanceId, MessageId, PartitionNumber, StatusFlags, StreamId};

/// One row of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Aggregate identity this event belongs to.
    pub stream_id: StreamId,
    /// Dense, 0-based, monotonic position within `stream_id`.
    pub sequence: i64,
    /// The envelope as committed.
    pub envelope: Envelope,
    /// Application-defined event type (matches `envelope.message_type`).
    pub event_type: String,
    /// When this event was appended.
    pub created_at: DateTime<Utc>,
}

/// An outbound message staged for publication via the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Unique, time-ordered identifier (shared with the envelope).
    pub message_id: MessageId,
    /// Transport destination (topic/queue/exchange name).
    pub destination: String,
    /// Stable wire-contract identifier for the payload type.
    pub message_type: String,
    /// JSON-encoded payload.
    pub payload: Value,
    /// Free-form metadata (headers, trace context).
    pub metadata: Value,
    /// Logical scope this row was queued under (e.g. the UoW unit id that produced it).
    pub scope: Option<String>,
    /// Number of publish attempts made so far. Monotonically non-decreasing.
    pub attempts: u32,
    /// Last error message, if any attempt failed.
    pub error: Option<String>,
    /// Human-readable reason for terminal failure, if `status_flags` has `Failed` set.
    pub failure_reason: Option<String>,
    /// When this row was inserted.
    pub created_at: DateTime<Utc>,
    /// When the transport accepted this envelope, if it has been published.
    pub published_at: Option<DateTime<Utc>>,
    /// When this row last had a completion or failure applied to it.
    pub processed_at: Option<DateTime<Utc>>,
    /// The instance currently leasing this row, if any.
    pub instance_id: Option<InstanceId>,
    /// When the current lease expires, if any. Invariant: `(instance_id, lease_expiry)` are
    /// either both `None` or both `Some`.
    pub lease_expiry: Option<DateTime<Utc>>,
    /// The stream this row's envelope is ordered against, if any (commands with no aggregate
    /// affinity may have `None`, forming the "null stream" group in the stream processor).
    pub stream_id: Option<StreamId>,
    /// Partition bucket, `hash(stream_id) mod P`. Rows with no `stream_id` use partition 0.
    pub partition_number: PartitionNumber,
    /// Bitwise status flags (SPEC_FULL §3, §4.2 step 2).
    pub status_flags: StatusFlags,
    /// True if this row's envelope is itself a durably-appended domain event — controls whether
    /// `EventStored` participates in terminality (see DESIGN.md's Open Question decision).
    pub carries_event: bool,
    /// Earliest time this row becomes claimable; `None` means immediately claimable.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// True if this row is terminal (per the `carries_event`-aware rule in [`StatusFlags::is_terminal`]).
    pub fn is_terminal(&self) -> bool {
        self.status_flags.is_terminal(self.carries_event)
    }
}

/// A received message staged for receptor dispatch.
///
/// Mirrors [`OutboxRecord`] but is keyed by `(message_id, handler_name)` rather than `message_id`
/// alone, since multiple handlers may independently process the same inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    /// Identifier of the received envelope.
    pub message_id: MessageId,
    /// The receptor this row is destined for.
    pub handler_name: String,
    /// Stable wire-contract identifier for the payload type.
    pub message_type: String,
    /// JSON-encoded payload.
    pub payload: Value,
    /// Free-form metadata (headers, trace context).
    pub metadata: Value,
    /// Number of dispatch attempts made so far.
    pub attempts: u32,
    /// Last error message, if any attempt failed.
    pub error: Option<String>,
    /// Human-readable reason for terminal failure.
    pub failure_reason: Option<String>,
    /// When this row was inserted.
    pub created_at: DateTime<Utc>,
    /// When this row last had a completion or failure applied to it.
    pub processed_at: Option<DateTime<Utc>>,
    /// The instance currently leasing this row, if any.
    pub instance_id: Option<InstanceId>,
    /// When the current lease expires, if any.
    pub lease_expiry: Option<DateTime<Utc>>,
    /// The stream this row's envelope is ordered against, if any.
    pub stream_id: Option<StreamId>,
    /// Partition bucket, `hash(stream_id) mod P`.
    pub partition_number: PartitionNumber,
    /// Bitwise status flags.
    pub status_flags: StatusFlags,
    /// Earliest time this row becomes claimable.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl InboxRecord {
    /// Inbox rows never carry a domain event of their own (they are the *receiving* side), so
    /// terminality only depends on `Published`/`Failed`... but inbox rows use `Published` to mean
    /// "receptor ran to completion". `carries_event` is therefore always `false` here.
    pub fn is_terminal(&self) -> bool {
        self.status_flags.is_terminal(false)
    }
}

/// Dedup table row: `(message_id, handler_name)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// The envelope that was processed.
    pub message_id: MessageId,
    /// The handler that processed it.
    pub handler_name: String,
    /// When it was recorded as processed.
    pub processed_at: DateTime<Utc>,
}

/// Lifecycle status of a perspective checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerspectiveStatus {
    /// No events have been projected yet.
    Pending,
    /// Currently being advanced by a leaseholder.
    InProgress,
    /// Fully caught up to the stream's last event.
    Caught,
    /// The projection handler raised an error on its last attempt.
    Failed,
}

/// Per-(stream, perspective) cursor recording how far a read model has been advanced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveCheckpoint {
    /// The stream being projected.
    pub stream_id: StreamId,
    /// The perspective (read model) name.
    pub perspective_name: String,
    /// The last event id successfully projected, if any.
    pub last_processed_event_id: Option<MessageId>,
    /// Current lifecycle status.
    pub status: PerspectiveStatus,
    /// When this checkpoint was last advanced.
    pub processed_at: Option<DateTime<Utc>>,
    /// Last projection error, if `status` is `Failed`.
    pub error: Option<String>,
    /// The instance currently leasing this checkpoint, if any.
    pub instance_id: Option<InstanceId>,
    /// When the current lease expires, if any.
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Partition bucket, `hash(stream_id) mod P`.
    pub partition_number: PartitionNumber,
}

/// Liveness record for one running service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceRecord {
    /// Unique identity of this process.
    pub instance_id: InstanceId,
    /// Logical service name (shared by all instances of the same deployable).
    pub service_name: String,
    /// Hostname the process is running on.
    pub host_name: String,
    /// OS process id.
    pub process_id: u32,
    /// When this process started.
    pub started_at: DateTime<Utc>,
    /// Most recent heartbeat.
    pub last_heartbeat_at: DateTime<Utc>,
}

impl ServiceInstanceRecord {
    /// True if the instance has heartbeat within `stale_threshold`.
    pub fn is_alive(&self, now: DateTime<Utc>, stale_threshold: chrono::Duration) -> bool {
        self.last_heartbeat_at > now - stale_threshold
    }
}

/// A partition's current owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    /// Partition bucket.
    pub partition_number: PartitionNumber,
    /// The instance currently holding it.
    pub instance_id: InstanceId,
    /// When the instance first claimed this partition.
    pub assigned_at: DateTime<Utc>,
    /// Most recent heartbeat the instance sent while holding this partition.
    pub last_heartbeat: DateTime<Utc>,
}
