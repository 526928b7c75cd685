//! Storage-layer error taxonomy.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    /// Event or row serialization failed.
    #[error("failed to serialize: {0}")]
    SerializationFailed(String),
    /// Event or row deserialization failed.
    #[error("failed to deserialize: {0}")]
    DeserializationFailed(String),
    /// The storage backend's underlying operation failed (connection, SQL, I/O).
    #[error("storage backend error: {0}")]
    BackendError(String),
    /// Referenced row not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Concurrent append raced ahead of the caller's expected sequence.
    #[error("stream conflict: expected sequence {expected}, store is at {actual}")]
    StreamConflict {
        /// Sequence number the caller expected to append at.
        expected: i64,
        /// The sequence actually at the head of the stream.
        actual: i64,
    },
}

impl From<StorageError> for conduit_types::ConduitError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::StreamConflict { expected, actual } => {
                conduit_types::ConduitError::StreamConflict { expected, actual }
            }
            StorageError::SerializationFailed(msg) | StorageError::DeserializationFailed(msg) => {
                conduit_types::ConduitError::SerializationError(msg)
            }
            StorageError::BackendError(msg) | StorageError::NotFound(msg) => {
                conduit_types::ConduitError::Unknown(msg)
            }
        }
    }
}
