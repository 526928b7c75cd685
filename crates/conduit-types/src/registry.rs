//! Registration tables that replace the reflection/attribute-driven dispatch of the source system
//! (SPEC_FULL.md §4.9 and §9's "Runtime patterns that need re-architecture").
//!
//! Instead of `[FireAt(stage)]`/`[StreamKey]` attributes resolved via reflection, applications
//! build one `EventRegistry` at startup, register stream-key resolvers and handlers explicitly,
//! and hand the finished, immutable table to [`conduit_runtime::Runtime`](../conduit_runtime/struct.Runtime.html).

use std::collections::HashMap;
use std::sync::Arc;

use crate::ids::StreamId;

/// Implemented by every event payload type that can resolve its own stream key.
///
/// This is the preferred mechanism from SPEC_FULL §9: a mandatory trait method rather than an
/// attribute resolved via reflection. Payloads that cannot implement this directly (e.g. types
/// owned by a crate the application does not control) can instead register a resolver function
/// with [`EventRegistry::register_resolver`].
pub trait StreamKeyed {
    /// Compute the stream id this event belongs to.
    fn stream_key(&self) -> StreamId;
}

/// One entry in the handler dispatch table: a named handler plus the lifecycle stage it runs at.
#[derive(Clone)]
pub struct RegisteredHandler {
    /// Stable name identifying this handler (used as the inbox's `HandlerName`).
    pub name: &'static str,
    /// Lifecycle stage this handler fires at (application-defined ordering hint).
    pub stage: u32,
}

/// Dispatch table mapping a stable event-type identifier to the handlers that run for it.
///
/// Built once at startup and never mutated afterward — this is the explicit replacement for
/// reflection-based handler resolution. The event-type identifier is part of the wire contract
/// (see SPEC_FULL §9) and must remain stable across versions.
#[derive(Clone, Default)]
pub struct HandlerDispatchTable {
    handlers: HashMap<&'static str, Vec<RegisteredHandler>>,
}

impl HandlerDispatchTable {
    /// Create an empty dispatch table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` to run for `event_type`, at `stage`.
    pub fn register(&mut self, event_type: &'static str, handler: &'static str, stage: u32) -> &mut Self {
        self.handlers
            .entry(event_type)
            .or_default()
            .push(RegisteredHandler { name: handler, stage });
        self
    }

    /// List the handlers registered for `event_type`, in stage order.
    pub fn handlers_for(&self, event_type: &str) -> Vec<RegisteredHandler> {
        let mut handlers = self.handlers.get(event_type).cloned().unwrap_or_default();
        handlers.sort_by_key(|h| h.stage);
        handlers
    }
}

/// Table recording which `(EventType, PerspectiveName)` pairs this service instance maintains.
///
/// Consulted by the perspective worker's claim step (SPEC_FULL §4.2 step 10): a perspective
/// checkpoint is only claimable if an association exists for the event's type.
#[derive(Clone, Default)]
pub struct MessageAssociationTable {
    associations: HashMap<(&'static str, &'static str), ()>,
}

impl MessageAssociationTable {
    /// Create an empty association table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that this service maintains `perspective_name` for `event_type`.
    pub fn associate(&mut self, event_type: &'static str, perspective_name: &'static str) -> &mut Self {
        self.associations.insert((event_type, perspective_name), ());
        self
    }

    /// True if this service maintains `perspective_name` for `event_type`.
    pub fn is_associated(&self, event_type: &str, perspective_name: &str) -> bool {
        self.associations.contains_key(&(event_type, perspective_name))
    }

    /// Iterate all registered `(event_type, perspective_name)` pairs.
    ///
    /// Used by a storage backend's perspective-checkpoint discovery step, which needs to know
    /// every perspective a freshly-seen event type should spawn a checkpoint for.
    pub fn pairs(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.associations.keys().copied()
    }
}

/// Resolver function for event types that cannot implement [`StreamKeyed`] directly.
pub type StreamKeyResolver = Arc<dyn Fn(&serde_json::Value) -> Option<StreamId> + Send + Sync>;

/// The application's composition-root registry: stream-key resolvers, handler dispatch, and
/// perspective associations, assembled once at startup.
///
/// This is the explicit singleton SPEC_FULL §9 calls for in place of global static registries
/// (`JsonContextRegistry`, `WhizbangIdProviderRegistry` in the source system): an application
/// builds one `EventRegistry`, passes it into `conduit_runtime::Runtime::new`, and nothing else
/// touches global mutable state.
#[derive(Clone, Default)]
pub struct EventRegistry {
    resolvers: HashMap<&'static str, StreamKeyResolver>,
    dispatch: HandlerDispatchTable,
    associations: MessageAssociationTable,
}

impl EventRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an explicit stream-key resolver for `event_type`.
    pub fn register_resolver(&mut self, event_type: &'static str, resolver: StreamKeyResolver) -> &mut Self {
        self.resolvers.insert(event_type, resolver);
        self
    }

    /// Resolve the stream key for a JSON-encoded payload of the given event type, if a resolver
    /// was registered for it.
    pub fn resolve_stream_key(&self, event_type: &str, payload: &serde_json::Value) -> Option<StreamId> {
        self.resolvers.get(event_type).and_then(|resolver| resolver(payload))
    }

    /// Register `handler` to run for `event_type`, at `stage`.
    pub fn register_handler(&mut self, event_type: &'static str, handler: &'static str, stage: u32) -> &mut Self {
        self.dispatch.register(event_type, handler, stage);
        self
    }

    /// List the handlers registered for `event_type`, in stage order.
    pub fn handlers_for(&self, event_type: &str) -> Vec<RegisteredHandler> {
        self.dispatch.handlers_for(event_type)
    }

    /// Declare that this service maintains `perspective_name` for `event_type`.
    pub fn associate_perspective(&mut self, event_type: &'static str, perspective_name: &'static str) -> &mut Self {
        self.associations.associate(event_type, perspective_name);
        self
    }

    /// True if this service maintains `perspective_name` for `event_type`.
    pub fn is_associated(&self, event_type: &str, perspective_name: &str) -> bool {
        self.associations.is_associated(event_type, perspective_name)
    }

    /// The underlying association table, handed to a storage backend at construction time so its
    /// checkpoint-discovery step observes the same `(EventType, PerspectiveName)` pairs this
    /// registry declares.
    pub fn associations(&self) -> &MessageAssociationTable {
        &self.associations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_orders_by_stage() {
        let mut table = HandlerDispatchTable::new();
        table.register("product.created", "index_search", 10);
        table.register("product.created", "update_inventory", 0);

        let handlers = table.handlers_for("product.created");
        assert_eq!(handlers[0].name, "update_inventory");
        assert_eq!(handlers[1].name, "index_search");
    }

    #[test]
    fn association_table_round_trips() {
        let mut table = MessageAssociationTable::new();
        table.associate("product.created", "product_catalog");
        assert!(table.is_associated("product.created", "product_catalog"));
        assert!(!table.is_associated("product.created", "inventory"));
    }

    #[test]
    fn registry_resolves_stream_key_via_closure() {
        let mut registry = EventRegistry::new();
        registry.register_resolver(
            "product.created",
            Arc::new(|payload| {
                payload
                    .get("product_id")
                    .and_then(|v| v.as_str())
                    .map(StreamId::from_key)
            }),
        );

        let payload = serde_json::json!({ "product_id": "p1" });
        let resolved = registry.resolve_stream_key("product.created", &payload);
        assert_eq!(resolved, Some(StreamId::from_key("p1")));
    }
}
