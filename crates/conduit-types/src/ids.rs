//! Strongly-typed identifiers.
//!
//! Every identifier in conduit is a newtype around a 128-bit UUID. `MessageId` and `InstanceId`
//! use UUIDv7 so that ordering by value matches ordering by creation time — the stream-ordering
//! guard in the work-batch procedure relies on this (§4.2 step 8 of SPEC_FULL.md).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, time-ordered identifier for a [`crate::Envelope`].
///
/// Because this is a UUIDv7, comparing two `MessageId`s with `Ord` also compares their creation
/// order — this is what lets the stream-ordering guard and the Ordered Stream Processor sort
/// work items into temporal order without a separate sequence column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a fresh, time-ordered message id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identity of the aggregate (stream) that a sequence of events belongs to.
///
/// `StreamId` is derived by hashing an event's declared stream-key field (see
/// [`StreamKeyed`](crate::registry::StreamKeyed)); it is not itself time-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Derive a stream id by hashing a UTF-8 key (typically "TypeName:aggregate-key").
    ///
    /// Uses UUIDv5 (namespace + SHA-1) so the same key always yields the same `StreamId`,
    /// which is required for aggregates to accumulate events under one stream across restarts.
    pub fn from_key(key: &str) -> Self {
        const NAMESPACE: Uuid = Uuid::from_bytes([
            0x6b, 0x3c, 0x27, 0x45, 0x2b, 0x1d, 0x4b, 0x8e, 0x9a, 0x21, 0x0f, 0x6f, 0x6a, 0x64,
            0x2a, 0xd1,
        ]);
        Self(Uuid::new_v5(&NAMESPACE, key.as_bytes()))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identity of a running service instance (one process of one service).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Generate a fresh instance id for the current process.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A partition bucket number, `0..partition_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionNumber(pub u32);

impl PartitionNumber {
    /// Consistent-hash a stream id into a partition bucket, mod `partition_count`.
    pub fn of(stream_id: StreamId, partition_count: u32) -> Self {
        assert!(partition_count > 0, "partition_count must be positive");
        let bytes = stream_id.0.as_bytes();
        // FNV-1a over the stream id bytes keeps this independent of the host's hasher, which
        // matters because the partition number must be computed identically regardless of which
        // backend (memory or postgres) runs the hash.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        Self((hash % partition_count as u64) as u32)
    }
}

impl fmt::Display for PartitionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_sort_by_creation_order() {
        let a = MessageId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = MessageId::new();
        assert!(a < b, "later MessageId must sort greater (UUIDv7 time order)");
    }

    #[test]
    fn stream_id_from_key_is_deterministic() {
        let a = StreamId::from_key("Product:p1");
        let b = StreamId::from_key("Product:p1");
        let c = StreamId::from_key("Product:p2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn partition_of_is_stable_and_in_range() {
        let stream = StreamId::from_key("Product:p1");
        let p1 = PartitionNumber::of(stream, 10_000);
        let p2 = PartitionNumber::of(stream, 10_000);
        assert_eq!(p1, p2);
        assert!(p1.0 < 10_000);
    }

    proptest::proptest! {
        #[test]
        fn partition_number_always_in_bounds(seed in proptest::prelude::any::<u128>(), count in 1u32..50_000) {
            let stream = StreamId(Uuid::from_u128(seed));
            let p = PartitionNumber::of(stream, count);
            proptest::prop_assert!(p.0 < count);
        }
    }
}
