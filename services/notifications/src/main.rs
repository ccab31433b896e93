use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use karigo_common::{
    connect_event_bus, shutdown_signal, DedupStore, EventBusBackend, InMemoryDedupStore, RedisDedupStore,
    RedisService, RetryPolicy, ServerConfig,
};
use karigo_notifications::{
    config::NotificationConfig, consumers, create_router, notifier::LogNotifier, service::NotificationService,
    templates::TemplateEngine, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "karigo_notifications=debug,karigo_common=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = NotificationConfig::from_env();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let redis = match config.app.event_bus.backend {
        EventBusBackend::Redis => Some(RedisService::new(&config.app.redis).await?),
        EventBusBackend::Memory => None,
    };
    let bus = connect_event_bus(&config.app.event_bus, redis.as_ref(), shutdown_rx.clone())?;

    let mut sweeper = None;
    let dedup: Arc<dyn DedupStore> = match &redis {
        Some(redis) => Arc::new(RedisDedupStore::new(redis.clone())),
        None => {
            let store = Arc::new(InMemoryDedupStore::new());
            sweeper = Some(
                store
                    .clone()
                    .spawn_sweeper(Duration::from_secs(config.dedup_sweep_secs), shutdown_rx.clone()),
            );
            store
        }
    };

    let service = Arc::new(NotificationService::new(
        TemplateEngine::new()?,
        Arc::new(LogNotifier),
        dedup,
        config.dedup_ttl(),
    ));

    // Consumers
    let subscriptions =
        consumers::subscribe_all(bus, service.clone(), RetryPolicy::from(&config.app.retry)).await?;

    let app = create_router(AppState { service }).layer(cors_layer(&config.app.server));

    let listener = tokio::net::TcpListener::bind(config.app.server.bind_address()).await?;
    tracing::info!("Notification Service listening on {}", config.app.server.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    for subscription in subscriptions {
        subscription.join().await;
    }
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    tracing::info!("Notification Service stopped");
    Ok(())
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(origins)
}
