//! Shared error taxonomy for the conduit runtime (SPEC_FULL.md §7).
//!
//! Every failure reported across a component boundary carries one of these reasons plus a
//! human-readable message. There is no stack-trace exchange contract between components — callers
//! get an enum they can match on and a string for logs.

use thiserror::Error;

use crate::ids::MessageId;

/// The exhaustive error taxonomy shared by stores, transports, and workers.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConduitError {
    /// Broker not yet connected; item stays claimed, lease will expire.
    #[error("transport not ready: {0}")]
    TransportNotReady(String),

    /// Publish/subscribe call failed; retry counted.
    #[error("transport exception: {0}")]
    TransportException(String),

    /// Envelope or payload failed to encode/decode; non-retryable in the same form.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Handler rejected message on domain grounds; non-retryable.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Retry budget exhausted; row marked `Failed` permanently.
    #[error("max attempts exceeded after {attempts} tries")]
    MaxAttemptsExceeded {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Completion arrived for a row we no longer own; ignored.
    #[error("lease expired for message {0}")]
    LeaseExpired(MessageId),

    /// Sequence-collision on event append; caller retries at next sequence.
    #[error("stream conflict: expected sequence {expected}, store is at {actual}")]
    StreamConflict {
        /// Sequence number the caller expected to append at.
        expected: i64,
        /// The sequence actually at the head of the stream.
        actual: i64,
    },

    /// Operation on a shut-down component.
    #[error("component disposed")]
    Disposed,

    /// Default / uncategorized failure.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ConduitError {
    /// True if this error should count against an item's retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConduitError::TransportNotReady(_) | ConduitError::TransportException(_) | ConduitError::Unknown(_)
        )
    }
}
