use polystore::entity::{GuidIdentifierFactory, IdentifierFactory};
use polystore::query::ConditionOperator;
use polystore::{
    handler, Capabilities, DataStore, EntityMetadata, EventEnvelope, EventStore, FileStore, FileStoreConfig,
    MessageBusStore, OrderDirection, PropertyBag, Query, StoreError, ValueKind,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,polystore=debug")))
        .init();

    let root = std::env::var("POLYSTORE_ROOT").unwrap_or_else(|_| "./polystore-data".to_string());
    tracing::info!("🚀 Starting polystore demo at {}", root);

    // Every run writes under its own names, so nothing already under `root` is touched.
    let store = FileStore::open(FileStoreConfig::new(&root).with_capabilities(Capabilities::default())).await?;
    let cancel = CancellationToken::new();
    let ids = GuidIdentifierFactory;
    let run = ids.create();
    let customers = format!("customers-{}", run);
    let orders = format!("orders-{}", run);
    let ledger = format!("ledger-{}", run);
    let topic = format!("notifications-{}", run);
    tracing::info!(%run, "🏷️  Demo run");

    // === 1. Entities ===
    let customer = store
        .add(&customers, PropertyBag::new(&ids).with("Name", "Ana"), &cancel)
        .await?;
    for total in [12.5, 40.0, 7.25] {
        let order = PropertyBag::new(&ids)
            .with("CustomerId", customer.id.as_str())
            .with("Total", total);
        store.add(&orders, order, &cancel).await?;
    }

    let metadata = EntityMetadata::new()
        .property("Total", ValueKind::Double)
        .property("CustomerName", ValueKind::String);
    let query = Query::new()
        .where_field("Total", ConditionOperator::GreaterThan, 10.0)
        .inner_join(&customers, "CustomerId", "Id")
        .select(["Total"])
        .select_from_join(&customers, "Name", "CustomerName")
        .order_by("Total", OrderDirection::Descending);
    for row in store.query(&orders, &query, &metadata, &cancel).await? {
        tracing::info!(id = %row.id, total = ?row.get("Total"), customer = ?row.get("CustomerName"), "📦 Order");
    }

    // === 2. Event stream ===
    let stream_id = ids.create();
    store
        .add_events(
            &ledger,
            &stream_id,
            vec![
                EventEnvelope::new(1, "Opened", r#"{"owner":"Ana"}"#, "demo.Opened"),
                EventEnvelope::new(2, "Deposited", r#"{"amount":25}"#, "demo.Deposited"),
            ],
            &cancel,
        )
        .await?;
    let stale = vec![EventEnvelope::new(2, "Deposited", r#"{"amount":5}"#, "demo.Deposited")];
    match store.add_events(&ledger, &stream_id, stale, &cancel).await {
        Err(StoreError::Concurrency(conflict)) => tracing::info!("🔁 Stale writer rejected: {}", conflict),
        other => anyhow::bail!("stale append was not rejected: {:?}", other),
    }

    // === 3. Messaging ===
    store.subscribe(&topic, "email", &cancel).await?;
    store.send(&topic, "order shipped", &cancel).await?;

    let failed = store
        .receive_single(
            &topic,
            "email",
            handler(|_| async { Err(anyhow::anyhow!("smtp unavailable").into()) }),
            &cancel,
        )
        .await;
    tracing::info!("⚠️  First delivery failed: {:?}", failed.err());

    let processed = store
        .receive_single(
            &topic,
            "email",
            handler(|message| async move {
                tracing::info!(body = %message.body, delivery = message.delivery_count, "📨 Delivered");
                Ok(())
            }),
            &cancel,
        )
        .await?;
    let pending = store.pending_count(&topic, "email", &cancel).await?;
    tracing::info!(processed, pending, "✅ Message cycle complete");

    println!("{}", polystore::metrics::render_text(store.metrics().registry())?);
    Ok(())
}
