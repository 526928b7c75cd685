//! Perspective materialisation primitives (SPEC_FULL.md §3.1, §4.8).
//!
//! Kept separate from `conduit-store-core` because, unlike the outbox/inbox/event tables, a
//! perspective's materialised row is application-defined read-model shape rather than part of the
//! work-batch transaction — the same pattern `Transport` uses at the C6/C7 boundary: the engine
//! defines the seam, the application brings the implementation.

use async_trait::async_trait;
use conduit_types::{ConduitError, StreamId};
use serde_json::{Map, Value};

use conduit_store_core::EventRecord;

/// What a projection handler decided to do with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelAction {
    /// Replace the materialised model with `value`; `IndexedColumns` are re-derived from it.
    Upsert(Value),
    /// Remove the row (ordinary soft removal — checkpoint history is kept).
    Delete,
    /// Remove the row and all checkpoint history for this stream/perspective pair (GDPR-style
    /// erasure).
    Purge,
    /// Leave the row untouched; the checkpoint still advances past this event.
    Noop,
}

/// One materialised perspective row.
#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveRow {
    /// The stream this row projects.
    pub stream_id: StreamId,
    /// The perspective (read model) name.
    pub perspective_name: String,
    /// Small set of fields a store query layer indexes on.
    pub indexed_columns: Map<String, Value>,
    /// The full JSON-encoded projection.
    pub model: Value,
    /// Monotonically increasing version, bumped on every successful apply.
    pub version: u64,
}

/// Extracts the fields of `model` worth indexing for `perspective_name`. Registered once per
/// perspective at startup, mirroring how `EventRegistry` registers one resolver per event type.
pub type IndexExtractor = std::sync::Arc<dyn Fn(&Value) -> Map<String, Value> + Send + Sync>;

/// Applies projection handler output to application-owned perspective storage.
#[async_trait]
pub trait PerspectiveMaterializer: Send + Sync {
    /// Apply `action` to the `(stream_id, perspective_name)` row.
    async fn apply(&self, stream_id: StreamId, perspective_name: &str, action: ModelAction) -> Result<(), ConduitError>;

    /// Read the current materialised row, if any.
    async fn read(&self, stream_id: StreamId, perspective_name: &str) -> Result<Option<PerspectiveRow>, ConduitError>;
}

/// Runs the application's projection logic for one perspective: given an event, decide what
/// should happen to the materialised model.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    /// Project `event` into a [`ModelAction`].
    async fn project(&self, event: &EventRecord) -> Result<ModelAction, ConduitError>;
}

/// Reference [`PerspectiveMaterializer`] backed by an in-process map, analogous to
/// `conduit-store-memory`'s role for the durable store traits. Suitable for tests and the demo
/// app; production deployments back perspectives with their own query-optimised storage.
pub struct InMemoryPerspectiveMaterializer {
    rows: tokio::sync::RwLock<std::collections::HashMap<(StreamId, String), PerspectiveRow>>,
    extractor: IndexExtractor,
}

impl InMemoryPerspectiveMaterializer {
    /// Build a materializer using `extractor` to derive indexed columns from each upserted model.
    pub fn new(extractor: IndexExtractor) -> Self {
        Self { rows: tokio::sync::RwLock::new(std::collections::HashMap::new()), extractor }
    }
}

#[async_trait]
impl PerspectiveMaterializer for InMemoryPerspectiveMaterializer {
    async fn apply(&self, stream_id: StreamId, perspective_name: &str, action: ModelAction) -> Result<(), ConduitError> {
        let key = (stream_id, perspective_name.to_string());
        let mut rows = self.rows.write().await;
        match action {
            ModelAction::Upsert(model) => {
                let indexed_columns = (self.extractor)(&model);
                let version = rows.get(&key).map(|row| row.version + 1).unwrap_or(1);
                rows.insert(key.clone(), PerspectiveRow { stream_id, perspective_name: key.1.clone(), indexed_columns, model, version });
            }
            // Both remove the materialised row here; `Purge`'s distinguishing behaviour — erasing
            // the perspective checkpoint itself, not just this row — is carried out by the
            // perspective worker against the store after this call returns (`perspective.rs`).
            ModelAction::Delete | ModelAction::Purge => {
                rows.remove(&key);
            }
            ModelAction::Noop => {}
        }
        Ok(())
    }

    async fn read(&self, stream_id: StreamId, perspective_name: &str) -> Result<Option<PerspectiveRow>, ConduitError> {
        Ok(self.rows.read().await.get(&(stream_id, perspective_name.to_string())).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> IndexExtractor {
        std::sync::Arc::new(|model: &Value| {
            let mut map = Map::new();
            if let Some(name) = model.get("name") {
                map.insert("name".to_string(), name.clone());
            }
            map
        })
    }

    #[tokio::test]
    async fn upsert_then_read_round_trips() {
        let materializer = InMemoryPerspectiveMaterializer::new(extractor());
        let stream = StreamId::from_key("Product:p1");
        materializer
            .apply(stream, "catalog", ModelAction::Upsert(serde_json::json!({"name": "Widget"})))
            .await
            .unwrap();

        let row = materializer.read(stream, "catalog").await.unwrap().unwrap();
        assert_eq!(row.model["name"], "Widget");
        assert_eq!(row.indexed_columns["name"], "Widget");
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let materializer = InMemoryPerspectiveMaterializer::new(extractor());
        let stream = StreamId::from_key("Product:p1");
        materializer.apply(stream, "catalog", ModelAction::Upsert(serde_json::json!({"name": "Widget"}))).await.unwrap();
        materializer.apply(stream, "catalog", ModelAction::Delete).await.unwrap();
        assert!(materializer.read(stream, "catalog").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn noop_leaves_row_untouched() {
        let materializer = InMemoryPerspectiveMaterializer::new(extractor());
        let stream = StreamId::from_key("Product:p1");
        materializer.apply(stream, "catalog", ModelAction::Upsert(serde_json::json!({"name": "Widget"}))).await.unwrap();
        materializer.apply(stream, "catalog", ModelAction::Noop).await.unwrap();
        let row = materializer.read(stream, "catalog").await.unwrap().unwrap();
        assert_eq!(row.version, 1);
    }
}
