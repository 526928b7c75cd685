//! Message envelope: the wire/store unit carried through outbox, inbox, and transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{InstanceId, MessageId};

/// One service's touch on an envelope: who handled it, when, and any correlation metadata it
/// contributed. Hops are append-only — [`Envelope::with_hop`] always returns a new envelope
/// rather than mutating in place, so a reference to an older hop list stays valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHop {
    /// The instance that touched the envelope at this hop.
    pub instance_id: InstanceId,
    /// When this hop occurred.
    pub timestamp: DateTime<Utc>,
    /// Correlation id for this hop, inherited from the first hop unless overridden.
    pub correlation_id: Option<MessageId>,
    /// The id of the message that caused this hop to happen, if any.
    pub causation_id: Option<MessageId>,
    /// Free-form metadata attached at this hop (headers, trace ids, etc).
    pub metadata: Value,
}

impl MessageHop {
    /// Construct the first hop of a brand-new envelope.
    pub fn origin(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: Value::Null,
        }
    }
}

/// A typed payload wrapped with identity and causal metadata.
///
/// Envelopes are immutable after hops are appended — appending a hop via [`Envelope::with_hop`]
/// produces a new `Envelope` value rather than mutating `self`, matching the "hops are append-only"
/// invariant in SPEC_FULL.md §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique, time-ordered identifier for this envelope.
    pub message_id: MessageId,
    /// Stable, wire-contract identifier for the payload's type (e.g. `"catalog.product_created"`).
    pub message_type: String,
    /// Ordered history of every service that has touched this envelope.
    pub hops: Vec<MessageHop>,
    /// The JSON-encoded payload.
    pub payload: Value,
}

impl Envelope {
    /// Wrap a serializable payload into a brand-new envelope with one origin hop.
    pub fn new<T: Serialize>(
        message_type: impl Into<String>,
        origin: InstanceId,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: MessageId::new(),
            message_type: message_type.into(),
            hops: vec![MessageHop::origin(origin)],
            payload: serde_json::to_value(payload)?,
        })
    }

    /// The correlation id of this envelope's causal chain, defined by the first hop.
    ///
    /// Falls back to this envelope's own `message_id` if the first hop never set one explicitly —
    /// every envelope is the root of its own correlation chain unless told otherwise.
    pub fn correlation_id(&self) -> MessageId {
        self.hops
            .first()
            .and_then(|hop| hop.correlation_id)
            .unwrap_or(self.message_id)
    }

    /// Return a copy of this envelope with one more hop appended.
    pub fn with_hop(&self, hop: MessageHop) -> Self {
        let mut hops = self.hops.clone();
        hops.push(hop);
        Self {
            message_id: self.message_id,
            message_type: self.message_type.clone(),
            hops,
            payload: self.payload.clone(),
        }
    }

    /// Deserialize the payload into a concrete type.
    pub fn deserialize_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
    }

    #[test]
    fn round_trips_payload() {
        let origin = InstanceId::new();
        let widget = Widget { name: "gadget".into() };
        let envelope = Envelope::new("test.widget", origin, &widget).unwrap();
        let decoded: Widget = envelope.deserialize_payload().unwrap();
        assert_eq!(decoded, widget);
        assert_eq!(envelope.hops.len(), 1);
    }

    #[test]
    fn with_hop_does_not_mutate_original() {
        let origin = InstanceId::new();
        let widget = Widget { name: "gadget".into() };
        let envelope = Envelope::new("test.widget", origin, &widget).unwrap();
        let next_hop = MessageHop::origin(InstanceId::new());
        let extended = envelope.with_hop(next_hop);

        assert_eq!(envelope.hops.len(), 1);
        assert_eq!(extended.hops.len(), 2);
        assert_eq!(extended.message_id, envelope.message_id);
    }

    #[test]
    fn correlation_id_defaults_to_message_id() {
        let origin = InstanceId::new();
        let widget = Widget { name: "gadget".into() };
        let envelope = Envelope::new("test.widget", origin, &widget).unwrap();
        assert_eq!(envelope.correlation_id(), envelope.message_id);
    }
}
