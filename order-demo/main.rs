mod pipeline;

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use pipeline::{InventoryManager, OrderDispatcher, OrderGenerator, OrderProcessor};
use serde_json::json;
use tokio_genserver::{ServerConfig, ServerRef};

const REPORT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    let run_for = env::var("ORDER_DEMO_SECS")
        .ok()
        .and_then(|secs| secs.parse::<u64>().ok())
        .unwrap_or(10);

    let inventory = ServerRef::builder(InventoryManager)
        .name("inventory")
        .config(config.clone())
        .build();
    let dispatcher = ServerRef::builder(OrderDispatcher)
        .name("dispatcher")
        .config(config.clone())
        .build();
    let processor = ServerRef::builder(OrderProcessor::default())
        .name("processor")
        .config(config.clone())
        .build();
    let generator = ServerRef::builder(OrderGenerator::default())
        .name("generator")
        .config(config)
        .build();

    inventory.start(HashMap::from([
        ("item_a".to_string(), 20),
        ("item_b".to_string(), 15),
        ("item_c".to_string(), 25),
    ]))?;
    dispatcher.start(())?;
    processor.start((inventory.clone(), dispatcher.clone()))?;
    generator.start((generator.clone(), processor.clone()))?;

    // Restock before the first order to show state changing under load.
    tokio::time::sleep(Duration::from_secs(2)).await;
    inventory.cast(json!({"command": "add_stock", "item_name": "item_b", "quantity": 10}))?;

    generator.cast(json!({"command": "generate_order"}))?;
    log::info!(
        "Order processing system started. Letting it run for {}s...",
        run_for
    );
    tokio::time::sleep(Duration::from_secs(run_for)).await;

    let generated = generator
        .call_timeout(json!({"command": "get_order_count"}), REPORT_TIMEOUT)
        .await??;
    let dispatched = dispatcher
        .call_timeout(json!({"command": "get_dispatched_count"}), REPORT_TIMEOUT)
        .await??;
    let stock_a = inventory
        .call_timeout(
            json!({"command": "get_stock", "item_name": "item_a"}),
            REPORT_TIMEOUT,
        )
        .await??;

    println!();
    println!("--- System Report ---");
    println!("Total Generated Orders: {}", generated);
    println!("Total Dispatched Orders: {}", dispatched);
    println!("Remaining item_a: {}", stock_a);

    log::info!("Stopping servers...");
    generator.stop().await?;
    processor.stop().await?;
    inventory.stop().await?;
    dispatcher.stop().await?;
    log::info!("Order processing system stopped.");

    Ok(())
}
