use settlement_service::auth::AuthKeys;
use settlement_service::config::AppConfig;
use settlement_service::handlers::AppState;
use settlement_service::kafka::{EventPublisher, KafkaProducer, NoopPublisher};
use settlement_service::repository::PgStore;
use settlement_service::service::SettlementService;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "settlement_service=debug,tower_http=debug".into());
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("Starting Settlement Service");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Migrations completed successfully");

    let events: Arc<dyn EventPublisher> = match &config.kafka_brokers {
        Some(brokers) => {
            tracing::info!(brokers = %brokers, topic = %config.kafka_topic, "Initializing Kafka producer");
            Arc::new(KafkaProducer::new(brokers, config.kafka_topic.clone())?)
        }
        None => {
            tracing::warn!("KAFKA_BROKERS not set, settlement events will not be published");
            Arc::new(NoopPublisher)
        }
    };

    let service = SettlementService::new(Arc::new(PgStore::new(pool)), events, config.bank.clone());
    let state = AppState {
        service,
        auth: Arc::new(AuthKeys::new(&config.jwt_secret, &config.bank_hook_secret)),
    };

    let app = settlement_service::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Settlement Service listening on {}", addr);
    tracing::info!("  POST   /orders/wallet                   - Place order paid from wallet");
    tracing::info!("  POST   /orders                          - Checkout (pending order)");
    tracing::info!("  GET    /wallet                          - Wallet balance and ledger");
    tracing::info!("  GET    /wallet/topup                    - Top-up reference and QR");
    tracing::info!("  POST   /webhooks/bank                   - Bank transfer webhook");
    tracing::info!("  POST   /admin/orders/:order_id/mark-paid  - Mark order paid");
    tracing::info!("  POST   /admin/orders/:order_id/wallet-pay - Settle order from wallet");
    tracing::info!("  POST   /admin/users/:user_id/deposit      - Credit a wallet");
    tracing::info!("  POST   /admin/users/:user_id/withdraw     - Debit a wallet");

    axum::serve(listener, app).await?;

    Ok(())
}
