//! API gateway - client HTTP, token issuance, saga registry.

use std::sync::Arc;
use std::time::Duration;

use auth_core::{keys, AuthzConfig, JwtConfig, KeyManager, KeyManagerConfig, TokenIssuer, TokenVerifier};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use bus_consumer::{ConsumerRuntime, KafkaConfig};
use idempotent_consumer::IdempotencyLedger;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use transactional_outbox::{
    metrics::OutboxMetrics, KafkaEventSink, OutboxPublisher, PublisherConfig, SqlxOutboxStore,
};

use gateway_service::config::Config;
use gateway_service::consumers::saga_events::SagaRegistryHandler;
use gateway_service::db::login_attempts::LoginAttemptRepository;
use gateway_service::db::sagas::SagaRepository;
use gateway_service::db::users::UserRepository;
use gateway_service::handlers::{discovery, orders, token};
use gateway_service::middleware::correlation;
use gateway_service::watchdog::Watchdog;
use gateway_service::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::from_env().expect("Failed to load configuration from environment"));
    let kafka = KafkaConfig::from_env().expect("Failed to load Kafka configuration");
    let jwt: Arc<JwtConfig> = Arc::new(
        envy::prefixed("SECURITY_JWT_")
            .from_env()
            .expect("Failed to load JWT configuration"),
    );
    let key_config: KeyManagerConfig = envy::prefixed("SECURITY_JWT_KEY_")
        .from_env()
        .expect("Failed to load key manager configuration");
    let authz = Arc::new(AuthzConfig::from_env().expect("Failed to load authz configuration"));

    tracing::info!(
        "Starting gateway on {}:{}",
        config.server_host,
        config.server_port
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection pool initialized");

    // Signing keys: bootstrap now, rotate in the background.
    let key_manager = Arc::new(KeyManager::bootstrap(key_config)?);
    tokio::spawn(keys::rotation_task(Arc::clone(&key_manager)));
    let issuer = Arc::new(TokenIssuer::new(Arc::clone(&key_manager), (*jwt).clone()));
    let verifier = Arc::new(TokenVerifier::new(Arc::clone(&key_manager), (*jwt).clone()));
    tracing::info!("JWT keys initialized");

    let outbox = Arc::new(SqlxOutboxStore::new(pool.clone()));
    let producer = kafka.producer_client_config().create()?;
    let sink = Arc::new(KafkaEventSink::new(producer));
    let publisher = OutboxPublisher::new(Arc::clone(&outbox), sink, PublisherConfig::default())
        .with_metrics(OutboxMetrics::new("gateway-service"));
    tokio::spawn(async move { publisher.run().await });

    let ledger = IdempotencyLedger::new(
        pool.clone(),
        Duration::from_secs(config.ledger_retention_secs),
    );
    let sagas = SagaRepository::new(pool.clone());

    // Housekeeping: ledger retention and idempotency-key window.
    let cleanup_ledger = ledger.clone();
    let cleanup_sagas = sagas.clone();
    let key_window = config.create_key_window_secs;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if let Err(e) = cleanup_sagas.cleanup_create_keys(key_window).await {
                tracing::warn!(error = %e, "Create-key cleanup failed");
            }
        }
    });
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            if let Err(e) = cleanup_ledger.cleanup_older_than().await {
                tracing::warn!(error = %e, "Ledger cleanup failed");
            }
        }
    });

    // Saga registry consumer over all event topics.
    let registry_handler = Arc::new(SagaRegistryHandler::new(
        pool.clone(),
        sagas.clone(),
        ledger.clone(),
    ));
    let topics = [
        kafka.topics.order_events.clone(),
        kafka.topics.payment_events.clone(),
        kafka.topics.inventory_events.clone(),
    ];
    let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
    let consumer = ConsumerRuntime::new(&kafka, &config.consumer_group, &topic_refs)?;
    let consumer_handle = tokio::spawn(async move { consumer.run(registry_handler).await });

    // Timeout watchdog.
    let watchdog = Watchdog::new(
        pool.clone(),
        sagas.clone(),
        Arc::clone(&outbox),
        Duration::from_secs(config.watchdog_interval_secs),
    );
    tokio::spawn(async move { watchdog.run().await });

    let state = AppState {
        db: pool.clone(),
        users: UserRepository::new(pool.clone()),
        login_attempts: LoginAttemptRepository::new(pool.clone()),
        sagas,
        outbox,
        keys: Arc::clone(&key_manager),
        issuer,
        verifier,
        authz,
        jwt,
        config: Arc::clone(&config),
    };

    let app = Router::new()
        .route("/oauth/token", post(token::issue_token))
        .route(
            "/.well-known/openid-configuration",
            get(discovery::openid_configuration),
        )
        .route("/.well-known/jwks.json", get(discovery::jwks))
        .route("/orders", post(orders::create_order))
        .route("/orders/:saga_id", get(orders::get_saga))
        .route("/health", get(health_check))
        .route("/readiness", get(readiness_check))
        .layer(middleware::from_fn(correlation::propagate))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Gateway listening on {}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            tracing::error!("HTTP server stopped: {:?}", result);
        }
        result = consumer_handle => {
            tracing::error!("Saga registry consumer stopped: {:?}", result);
        }
    }

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

/// Readiness follows key-manager liveness: two consecutive rotation
/// failures take the gateway out of rotation.
async fn readiness_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> (axum::http::StatusCode, &'static str) {
    if state.keys.is_healthy() {
        (axum::http::StatusCode::OK, "READY")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY")
    }
}
