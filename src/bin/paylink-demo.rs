//! Walks one order through purchase, delivery, revision and completion
//! against the database and object root configured in the environment.
use anyhow::Context;
use paylink::config::MarketConfig;
use paylink::files::FileUpload;
use paylink::order::{NewOrder, OrderStatus};
use paylink::types::Price;
use paylink::{OrderService, telemetry, utils};

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let config = MarketConfig::from_env()?;
    let service = OrderService::open(&config).context("opening order service")?;

    let buyer = utils::new_uuid_to_bech32("user_")?;
    let seller = utils::new_uuid_to_bech32("user_")?;

    let order = service.create_order(
        NewOrder::new(&buyer, &seller, Price::from_minor(5000, 2)?)
            .set_service("logo-design")
            .set_tier("basic")
            .set_requirements("a fox, orange, minimal"),
    )?;

    service.upload_order_file(&order.id, FileUpload::new("logo.svg", b"<svg/>".to_vec()), &seller)?;
    service.update_order_status(&order.id, OrderStatus::Delivered)?;
    service.update_order_status(&order.id, OrderStatus::InRevision)?;
    service.upload_order_file(&order.id, FileUpload::new("logo.svg", b"<svg></svg>".to_vec()), &seller)?;
    service.update_order_status(&order.id, OrderStatus::Delivered)?;
    let order = service.update_order_status(&order.id, OrderStatus::Completed)?;

    let escrow = service.get_transaction(&order.id)?;
    let metrics = service.get_seller_metrics(&seller)?;
    println!("order {} is {}, escrow {} ({})", order.id, order.status, escrow.status, escrow.amount);
    println!(
        "seller has {} completed of {} orders",
        metrics.completed_orders, metrics.total_orders
    );
    for file in service.get_vault_files(&buyer)? {
        println!("vault: {} v{} -> {}", file.file_name, file.version, file.file_url);
    }
    service.flush()?;

    Ok(())
}
