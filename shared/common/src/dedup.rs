use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::redis::RedisKeys;
use crate::{AppError, RedisService};

/// Atomic "have we seen this key?" marker with expiry.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// True exactly once per key until the marker expires or is forgotten.
    async fn first_time(&self, key: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Drops the marker so the next `first_time` for `key` succeeds again.
    async fn forget(&self, key: &str) -> Result<(), AppError>;
}

pub struct RedisDedupStore {
    redis: RedisService,
}

impl RedisDedupStore {
    pub fn new(redis: RedisService) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn first_time(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        self.redis
            .set_if_absent(&RedisKeys::first_time(key), "1", ttl.as_secs().max(1))
            .await
    }

    async fn forget(&self, key: &str) -> Result<(), AppError> {
        self.redis.cache_delete(&RedisKeys::first_time(key)).await
    }
}

/// Process-local store; expired markers are removed by [`sweep_expired`].
///
/// [`sweep_expired`]: InMemoryDedupStore::sweep_expired
#[derive(Default)]
pub struct InMemoryDedupStore {
    markers: DashMap<String, Instant>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.markers.len();
        self.markers.retain(|_, expires_at| *expires_at > now);
        before - self.markers.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired dedup markers");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn first_time(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let now = Instant::now();
        let expires_at = now + ttl;

        match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut marker) => {
                if *marker.get() > now {
                    return Ok(false);
                }
                marker.insert(expires_at);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn forget(&self, key: &str) -> Result<(), AppError> {
        self.markers.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_time_is_true_once() {
        let store = InMemoryDedupStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.first_time("ride.published:1", ttl).await.unwrap());
        assert!(!store.first_time("ride.published:1", ttl).await.unwrap());
        assert!(store.first_time("ride.published:2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn forget_and_expiry_reopen_the_key() {
        let store = InMemoryDedupStore::new();

        assert!(store.first_time("k", Duration::from_secs(60)).await.unwrap());
        store.forget("k").await.unwrap();
        assert!(store.first_time("k", Duration::from_secs(60)).await.unwrap());

        assert!(store.first_time("short", Duration::from_millis(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.first_time("short", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_callers_get_one_winner() {
        let store = Arc::new(InMemoryDedupStore::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.first_time("notify:evt-1", Duration::from_secs(60)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
