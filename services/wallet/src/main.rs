use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use karigo_common::{connect_event_bus, shutdown_signal, EventBusBackend, RedisService, RetryPolicy, ServerConfig};
use karigo_database::{create_pool, run_migrations};
use karigo_wallet::{
    config::WalletConfig, consumers, create_router, postgres::PgHoldStore, service::WalletService, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "karigo_wallet=debug,karigo_common=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = WalletConfig::from_env();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create database connection pool and run migrations
    let db_pool = create_pool(&config.app.database).await?;
    run_migrations(&db_pool).await?;

    // Event bus
    let redis = match config.app.event_bus.backend {
        EventBusBackend::Redis => Some(RedisService::new(&config.app.redis).await?),
        EventBusBackend::Memory => None,
    };
    let bus = connect_event_bus(&config.app.event_bus, redis.as_ref(), shutdown_rx)?;

    let service = Arc::new(WalletService::new(
        Arc::new(PgHoldStore::new(db_pool.clone())),
        config.default_currency.clone(),
    ));

    // Consumers
    let subscriptions =
        consumers::subscribe_all(bus, service.clone(), RetryPolicy::from(&config.app.retry)).await?;

    let app = create_router(AppState { service }).layer(cors_layer(&config.app.server));

    let listener = tokio::net::TcpListener::bind(config.app.server.bind_address()).await?;
    tracing::info!("Wallet Service listening on {}", config.app.server.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    for subscription in subscriptions {
        subscription.join().await;
    }

    tracing::info!("Wallet Service stopped");
    Ok(())
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(origins)
}
