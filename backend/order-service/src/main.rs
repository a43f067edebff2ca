//! Order service - owns the order aggregate.
//!
//! Consumes the create command and the payment/inventory answers, applies
//! them to the orders table and emits the order lifecycle events through
//! the transactional outbox.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use bus_consumer::{ConsumerRuntime, KafkaConfig};
use idempotent_consumer::IdempotencyLedger;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use transactional_outbox::{
    metrics::OutboxMetrics, KafkaEventSink, OutboxPublisher, PublisherConfig, SqlxOutboxStore,
};

use order_service::config::Config;
use order_service::consumers::saga_events::SagaEventHandler;
use order_service::db::orders::OrderRepository;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().expect("Failed to load configuration from environment");
    let kafka = KafkaConfig::from_env().expect("Failed to load Kafka configuration");

    tracing::info!(
        "Starting order service on {}:{}",
        config.server_host,
        config.server_port
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection pool initialized");

    let outbox = Arc::new(SqlxOutboxStore::new(pool.clone()));
    let producer = kafka.producer_client_config().create()?;
    let sink = Arc::new(KafkaEventSink::new(producer));
    let publisher = OutboxPublisher::new(
        Arc::clone(&outbox),
        sink,
        PublisherConfig::default(),
    )
    .with_metrics(OutboxMetrics::new("order-service"));
    tokio::spawn(async move { publisher.run().await });

    let ledger = IdempotencyLedger::new(
        pool.clone(),
        Duration::from_secs(config.ledger_retention_secs),
    );
    let cleanup_ledger = ledger.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            if let Err(e) = cleanup_ledger.cleanup_older_than().await {
                tracing::warn!(error = %e, "Ledger cleanup failed");
            }
        }
    });

    let handler = Arc::new(SagaEventHandler::new(
        pool.clone(),
        OrderRepository::new(pool.clone()),
        ledger,
        Arc::clone(&outbox),
    ));
    let topics = [
        kafka.topics.order_create_command.clone(),
        kafka.topics.payment_events.clone(),
        kafka.topics.inventory_events.clone(),
    ];
    let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
    let consumer = ConsumerRuntime::new(&kafka, &config.consumer_group, &topic_refs)?;
    let consumer_handle = tokio::spawn(async move { consumer.run(handler).await });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/readiness", get(readiness_check))
        .layer(TraceLayer::new_for_http());
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Health endpoints listening on {}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            tracing::error!("HTTP server stopped: {:?}", result);
        }
        result = consumer_handle => {
            tracing::error!("Saga consumer stopped: {:?}", result);
        }
    }

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn readiness_check() -> &'static str {
    "READY"
}
