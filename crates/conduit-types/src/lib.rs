#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **conduit-types** – Shared primitive data structures for the conduit runtime.
//!
//! The crate is dependency-light and sits at the very bottom of the crate graph so that every
//! other `conduit-*` crate can depend on it without causing cycles. It intentionally makes no
//! assumptions about I/O, storage, or transport — those contracts live in `conduit-store-core`
//! and `conduit-transport-core`.

pub mod envelope;
pub mod error;
pub mod ids;
pub mod registry;
pub mod status;

pub use envelope::{Envelope, MessageHop};
pub use error::ConduitError;
pub use ids::{InstanceId, MessageId, PartitionNumber, StreamId};
pub use registry::{EventRegistry, HandlerDispatchTable, MessageAssociationTable, StreamKeyed};
pub use status::StatusFlags;

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use super::{
        Envelope, MessageHop, ConduitError, InstanceId, MessageId, PartitionNumber, StreamId,
        EventRegistry, HandlerDispatchTable, MessageAssociationTable, StreamKeyed, StatusFlags,
    };
}
