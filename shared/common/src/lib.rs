pub mod types;
pub mod error;
pub mod config;
pub mod redis;
pub mod events;
pub mod event_bus;
pub mod stream_bus;
pub mod retry;
pub mod dedup;
pub mod circuit_breaker;
pub mod peer;
pub mod shutdown;
pub mod extract;

pub use types::*;
pub use error::*;
pub use config::*;
pub use self::redis::{RedisKeys, RedisService};
pub use event_bus::{publish_best_effort, publish_event, EventBus, EventHandler, InMemoryEventBus, Subscription};
pub use stream_bus::RedisStreamEventBus;
pub use retry::{subscribe_with_retry, RetryPolicy, RetryingHandler};
pub use dedup::{DedupStore, InMemoryDedupStore, RedisDedupStore};
pub use peer::PeerClient;
pub use shutdown::shutdown_signal;
pub use extract::JsonBody;

use std::sync::Arc;

use tokio::sync::watch;

/// Builds the event bus selected by `EVENT_BUS_BACKEND`.
pub fn connect_event_bus(
    config: &EventBusConfig,
    redis: Option<&RedisService>,
    shutdown: watch::Receiver<bool>,
) -> Result<Arc<dyn EventBus>, AppError> {
    match (config.backend, redis) {
        (EventBusBackend::Memory, _) => {
            tracing::warn!("Using in-memory event bus; events stay inside this process");
            Ok(Arc::new(InMemoryEventBus::with_history_limit(0)))
        }
        (EventBusBackend::Redis, Some(redis)) => Ok(Arc::new(RedisStreamEventBus::new(
            redis.clone(),
            config.clone(),
            shutdown,
        ))),
        (EventBusBackend::Redis, None) => Err(AppError::Internal(
            "Redis event bus selected but no Redis connection is available".to_string(),
        )),
    }
}
