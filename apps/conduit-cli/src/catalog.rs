//! Product/inventory catalog: the sample domain this CLI drives through the runtime to exercise
//! create-and-project, partial update, and zero-stock scenarios end to end.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_store_core::{EventRecord, NewOutboxItem};
use conduit_types::{ConduitError, EventRegistry, StreamId};
use conduit_workers::{ModelAction, PerspectiveMaterializer, ProjectionHandler};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Transport destination every catalog event is staged under.
pub const DESTINATION: &str = "catalog-events";

pub const PRODUCT_CREATED: &str = "catalog.product_created";
pub const PRODUCT_UPDATED: &str = "catalog.product_updated";
pub const INVENTORY_RESTOCKED: &str = "catalog.inventory_restocked";

pub const PRODUCT_CATALOG_PERSPECTIVE: &str = "product_catalog";
pub const INVENTORY_PERSPECTIVE: &str = "inventory";

fn product_stream(product_id: &str) -> StreamId {
    StreamId::from_key(&format!("Product:{product_id}"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub initial_stock: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductUpdated {
    pub product_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryRestocked {
    pub product_id: String,
    pub qty: u32,
}

/// Register the stream-key resolvers and perspective associations this domain needs. Applications
/// build one of these at startup and hand it to `conduit_runtime::Runtime::new`.
pub fn build_registry() -> EventRegistry {
    let mut registry = EventRegistry::new();

    registry.register_resolver(
        PRODUCT_CREATED,
        Arc::new(|payload| payload.get("product_id").and_then(|v| v.as_str()).map(product_stream)),
    );
    registry.register_resolver(
        PRODUCT_UPDATED,
        Arc::new(|payload| payload.get("product_id").and_then(|v| v.as_str()).map(product_stream)),
    );
    registry.register_resolver(
        INVENTORY_RESTOCKED,
        Arc::new(|payload| payload.get("product_id").and_then(|v| v.as_str()).map(product_stream)),
    );

    registry.associate_perspective(PRODUCT_CREATED, PRODUCT_CATALOG_PERSPECTIVE);
    registry.associate_perspective(PRODUCT_UPDATED, PRODUCT_CATALOG_PERSPECTIVE);
    registry.associate_perspective(PRODUCT_CREATED, INVENTORY_PERSPECTIVE);
    registry.associate_perspective(INVENTORY_RESTOCKED, INVENTORY_PERSPECTIVE);

    registry
}

/// Build the two outbox rows a `create_product` command queues: the `ProductCreated` event
/// itself, and — when stock was supplied — an `InventoryRestocked` event on the same stream
/// (SPEC_FULL.md's S1/S3 scenarios).
pub fn create_product(product_id: &str, name: &str, price: f64, initial_stock: u32) -> Vec<NewOutboxItem> {
    let stream_id = product_stream(product_id);
    let created = ProductCreated { product_id: product_id.to_string(), name: name.to_string(), price, initial_stock };

    let mut items = vec![NewOutboxItem {
        message_id: None,
        destination: DESTINATION.to_string(),
        message_type: PRODUCT_CREATED.to_string(),
        payload: serde_json::to_value(&created).expect("ProductCreated always serializes"),
        metadata: json!({}),
        scope: None,
        stream_id: Some(stream_id),
        carries_event: true,
        scheduled_for: None,
    }];

    if initial_stock > 0 {
        let restocked = InventoryRestocked { product_id: product_id.to_string(), qty: initial_stock };
        items.push(NewOutboxItem {
            message_id: None,
            destination: DESTINATION.to_string(),
            message_type: INVENTORY_RESTOCKED.to_string(),
            payload: serde_json::to_value(&restocked).expect("InventoryRestocked always serializes"),
            metadata: json!({}),
            scope: None,
            stream_id: Some(stream_id),
            carries_event: true,
            scheduled_for: None,
        });
    }

    items
}

/// Build the single outbox row an `update_product` command queues. Fields left `None` are not
/// touched by the projection (SPEC_FULL's "update-name-only" scenario).
pub fn update_product(product_id: &str, name: Option<String>, description: Option<String>, price: Option<f64>, image_url: Option<String>) -> NewOutboxItem {
    let stream_id = product_stream(product_id);
    let updated = ProductUpdated { product_id: product_id.to_string(), name, description, price, image_url };

    NewOutboxItem {
        message_id: None,
        destination: DESTINATION.to_string(),
        message_type: PRODUCT_UPDATED.to_string(),
        payload: serde_json::to_value(&updated).expect("ProductUpdated always serializes"),
        metadata: json!({}),
        scope: None,
        stream_id: Some(stream_id),
        carries_event: true,
        scheduled_for: None,
    }
}

/// Projects `product.created`/`product.updated` events into the `product_catalog` perspective.
/// Holds its own handle on the materializer so a partial update can read the current model before
/// merging fields into it — `ProjectionHandler::project` only sees one event at a time.
pub struct ProductCatalogProjection {
    materializer: Arc<dyn PerspectiveMaterializer>,
}

impl ProductCatalogProjection {
    pub fn new(materializer: Arc<dyn PerspectiveMaterializer>) -> Self {
        Self { materializer }
    }
}

#[async_trait]
impl ProjectionHandler for ProductCatalogProjection {
    async fn project(&self, event: &EventRecord) -> Result<ModelAction, ConduitError> {
        match event.event_type.as_str() {
            PRODUCT_CREATED => {
                let created: ProductCreated = event.envelope.deserialize_payload().map_err(|err| ConduitError::Unknown(err.to_string()))?;
                Ok(ModelAction::Upsert(json!({
                    "product_id": created.product_id,
                    "name": created.name,
                    "description": Option::<String>::None,
                    "price": created.price,
                    "image_url": Option::<String>::None,
                })))
            }
            PRODUCT_UPDATED => {
                let update: ProductUpdated = event.envelope.deserialize_payload().map_err(|err| ConduitError::Unknown(err.to_string()))?;
                let mut model = match self.materializer.read(event.stream_id, PRODUCT_CATALOG_PERSPECTIVE).await? {
                    Some(row) => row.model,
                    None => json!({"product_id": update.product_id}),
                };
                let map = model.as_object_mut().expect("product_catalog model is always a JSON object");
                if let Some(name) = update.name {
                    map.insert("name".to_string(), json!(name));
                }
                if let Some(description) = update.description {
                    map.insert("description".to_string(), json!(description));
                }
                if let Some(price) = update.price {
                    map.insert("price".to_string(), json!(price));
                }
                if let Some(image_url) = update.image_url {
                    map.insert("image_url".to_string(), json!(image_url));
                }
                Ok(ModelAction::Upsert(model))
            }
            _ => Ok(ModelAction::Noop),
        }
    }
}

/// Projects `product.created`/`inventory.restocked` events into the `inventory` perspective: a
/// running stock count per product (SPEC_FULL's "zero-stock" scenario leaves this at zero rather
/// than never materialising a row).
pub struct InventoryProjection {
    materializer: Arc<dyn PerspectiveMaterializer>,
}

impl InventoryProjection {
    pub fn new(materializer: Arc<dyn PerspectiveMaterializer>) -> Self {
        Self { materializer }
    }
}

#[async_trait]
impl ProjectionHandler for InventoryProjection {
    async fn project(&self, event: &EventRecord) -> Result<ModelAction, ConduitError> {
        let qty_delta = match event.event_type.as_str() {
            PRODUCT_CREATED => {
                let created: ProductCreated = event.envelope.deserialize_payload().map_err(|err| ConduitError::Unknown(err.to_string()))?;
                if created.initial_stock == 0 {
                    let model = json!({"product_id": created.product_id, "qty_on_hand": 0});
                    return Ok(ModelAction::Upsert(model));
                }
                return Ok(ModelAction::Noop);
            }
            INVENTORY_RESTOCKED => {
                let restocked: InventoryRestocked = event.envelope.deserialize_payload().map_err(|err| ConduitError::Unknown(err.to_string()))?;
                (restocked.product_id, restocked.qty as i64)
            }
            _ => return Ok(ModelAction::Noop),
        };

        let (product_id, qty) = qty_delta;
        let current = match self.materializer.read(event.stream_id, INVENTORY_PERSPECTIVE).await? {
            Some(row) => row.model["qty_on_hand"].as_i64().unwrap_or(0),
            None => 0,
        };
        Ok(ModelAction::Upsert(json!({"product_id": product_id, "qty_on_hand": current + qty})))
    }
}
