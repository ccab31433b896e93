use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use karigo_booking::{
    config::BookingConfig, consumers, create_router, postgres::PgBookingStore, rides::RideClient,
    service::BookingService, AppState,
};
use karigo_common::{
    connect_event_bus, shutdown_signal, EventBusBackend, PeerClient, RedisService, RetryPolicy, ServerConfig,
};
use karigo_database::{create_pool, run_migrations, OutboxRelay, PgOutboxStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "karigo_booking=debug,karigo_common=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = BookingConfig::from_env();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create database connection pool and run migrations
    let db_pool = create_pool(&config.app.database).await?;
    run_migrations(&db_pool).await?;

    // Event bus
    let redis = match config.app.event_bus.backend {
        EventBusBackend::Redis => Some(RedisService::new(&config.app.redis).await?),
        EventBusBackend::Memory => None,
    };
    let bus = connect_event_bus(&config.app.event_bus, redis.as_ref(), shutdown_rx.clone())?;

    let rides = RideClient::new(PeerClient::new("ride-service", config.ride_service.clone())?);
    let service = Arc::new(BookingService::new(
        Arc::new(PgBookingStore::new(db_pool.clone())),
        rides,
        config.default_currency.clone(),
    ));

    // Outbox relay
    let relay = OutboxRelay::new(
        Arc::new(PgOutboxStore::new(db_pool.clone())),
        bus.clone(),
        config.app.outbox.clone(),
    );
    let relay_task = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { relay.run(shutdown).await }
    });

    // Consumers
    let subscriptions =
        consumers::subscribe_all(bus.clone(), service.clone(), RetryPolicy::from(&config.app.retry)).await?;

    let app = create_router(AppState { service }).layer(cors_layer(&config.app.server));

    let listener = tokio::net::TcpListener::bind(config.app.server.bind_address()).await?;
    tracing::info!("Booking Service listening on {}", config.app.server.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    if let Err(e) = relay_task.await {
        tracing::error!(error = %e, "Outbox relay task failed");
    }
    for subscription in subscriptions {
        subscription.join().await;
    }

    tracing::info!("Booking Service stopped");
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
