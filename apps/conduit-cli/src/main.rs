#![forbid(unsafe_code)]

//! **conduit-cli** – Demo CLI driving a product/inventory catalog through the conduit Work
//! Coordination Engine. Mirrors the structure of the teacher's own CLI: a `clap` command tree,
//! one runtime built in `main`, one async handler per subcommand.

mod catalog;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conduit_runtime::{CoordinatorStrategyConfig, Runtime, RuntimeConfig, RuntimeDeps};
use conduit_store_core::NewOutboxItem;
use conduit_transport_core::InMemoryTransport;
use conduit_types::StreamId;
use conduit_workers::{InMemoryPerspectiveMaterializer, PerspectiveMaterializer};

use catalog::{InventoryProjection, ProductCatalogProjection, INVENTORY_PERSPECTIVE, PRODUCT_CATALOG_PERSPECTIVE};

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Demo CLI for the conduit Work Coordination Engine")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a product and, if given nonzero stock, restock its inventory in the same command.
    CreateProduct {
        #[arg(long)]
        product_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        price: f64,
        #[arg(long, default_value_t = 0)]
        initial_stock: u32,
    },
    /// Update one or more fields of an existing product. Omitted fields are left untouched.
    UpdateProduct {
        #[arg(long)]
        product_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        image_url: Option<String>,
    },
    /// Print the materialised catalog and inventory perspectives for a product.
    Show {
        #[arg(long)]
        product_id: String,
    },
    /// Run the create-and-project, update-name-only, and zero-stock scenarios end to end.
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    info!("starting conduit CLI v{}", env!("CARGO_PKG_VERSION"));

    let materializer = Arc::new(InMemoryPerspectiveMaterializer::new(Arc::new(product_catalog_index)));
    let mut projection_handlers: HashMap<String, Arc<dyn conduit_workers::ProjectionHandler>> = HashMap::new();
    projection_handlers.insert(PRODUCT_CATALOG_PERSPECTIVE.to_string(), Arc::new(ProductCatalogProjection::new(materializer.clone())));
    projection_handlers.insert(INVENTORY_PERSPECTIVE.to_string(), Arc::new(InventoryProjection::new(materializer.clone())));

    let deps = RuntimeDeps {
        registry: catalog::build_registry(),
        transport: Arc::new(InMemoryTransport::new(1024)),
        subscribe_destinations: vec![catalog::DESTINATION.to_string()],
        receptors: HashMap::new(),
        projection_handlers,
        materializer: materializer.clone(),
    };

    // Immediate strategy so a CLI invocation's queued work is visible by the time the process
    // would otherwise exit, rather than waiting on the interval strategy's next tick.
    let config = RuntimeConfig { service_name: "conduit-cli".to_string(), coordinator_strategy: CoordinatorStrategyConfig::Immediate, ..RuntimeConfig::default() };

    let runtime = Runtime::new(config, deps).await.context("failed to initialize conduit runtime")?;

    match cli.command {
        Commands::CreateProduct { product_id, name, price, initial_stock } => {
            handle_create_product(&runtime, &product_id, &name, price, initial_stock).await?;
        }
        Commands::UpdateProduct { product_id, name, description, price, image_url } => {
            handle_update_product(&runtime, &product_id, name, description, price, image_url).await?;
        }
        Commands::Show { product_id } => {
            handle_show(&materializer, &product_id).await?;
        }
        Commands::Demo => {
            handle_demo(&runtime, &materializer).await?;
        }
    }

    runtime.shutdown().await.context("runtime shutdown failed")?;
    info!("conduit CLI shutting down");

    Ok(())
}

fn product_catalog_index(model: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    if let Some(name) = model.get("name") {
        map.insert("name".to_string(), name.clone());
    }
    map
}

async fn queue_and_flush(runtime: &Runtime, items: Vec<NewOutboxItem>) -> Result<()> {
    let coordinator = runtime.coordinator();
    for item in items {
        coordinator.queue_new_outbox(item).await;
    }
    coordinator.flush().await.context("work-batch flush failed")?;
    Ok(())
}

async fn handle_create_product(runtime: &Runtime, product_id: &str, name: &str, price: f64, initial_stock: u32) -> Result<()> {
    info!(product_id, name, price, initial_stock, "creating product");
    queue_and_flush(runtime, catalog::create_product(product_id, name, price, initial_stock)).await?;
    // The perspective worker claims and advances the checkpoint created by the flush above on its
    // own task; give it a moment before reporting done.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    println!("created product {product_id}");
    Ok(())
}

async fn handle_update_product(runtime: &Runtime, product_id: &str, name: Option<String>, description: Option<String>, price: Option<f64>, image_url: Option<String>) -> Result<()> {
    info!(product_id, "updating product");
    queue_and_flush(runtime, vec![catalog::update_product(product_id, name, description, price, image_url)]).await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    println!("updated product {product_id}");
    Ok(())
}

async fn handle_show(materializer: &Arc<InMemoryPerspectiveMaterializer>, product_id: &str) -> Result<()> {
    let stream_id = StreamId::from_key(&format!("Product:{product_id}"));
    let catalog_row = materializer.read(stream_id, PRODUCT_CATALOG_PERSPECTIVE).await?;
    let inventory_row = materializer.read(stream_id, INVENTORY_PERSPECTIVE).await?;

    match catalog_row {
        Some(row) => println!("product_catalog[{product_id}] = {}", row.model),
        None => println!("product_catalog[{product_id}] = <not projected>"),
    }
    match inventory_row {
        Some(row) => println!("inventory[{product_id}] = {}", row.model),
        None => println!("inventory[{product_id}] = <not projected>"),
    }
    Ok(())
}

async fn handle_demo(runtime: &Runtime, materializer: &Arc<InMemoryPerspectiveMaterializer>) -> Result<()> {
    println!("-- S1: create-and-project --");
    handle_create_product(runtime, "P1", "Widget", 10.00, 50).await?;
    handle_show(materializer, "P1").await?;

    println!("-- S2: update-name-only --");
    handle_update_product(runtime, "P1", Some("Widget Pro".to_string()), None, None, None).await?;
    handle_show(materializer, "P1").await?;

    println!("-- S3: zero-stock --");
    handle_create_product(runtime, "P2", "Gadget", 4.50, 0).await?;
    handle_show(materializer, "P2").await?;

    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    Ok(())
}
