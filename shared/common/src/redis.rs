use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};

use crate::{AppError, RedisConfig};

#[derive(Clone)]
pub struct RedisService {
    manager: ConnectionManager,
    client: Client,
}

impl RedisService {
    pub async fn new(config: &RedisConfig) -> Result<Self, AppError> {
        let client = Client::open(config.connection_string())?;
        let manager = ConnectionManager::new(client.clone()).await?;

        // Test connection
        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        tracing::info!("Redis connection established");

        Ok(Self { manager, client })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// A connection of its own, for commands that block (stream reads).
    pub async fn dedicated_connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        Ok(self.client.get_multiplexed_tokio_connection().await?)
    }

    /// `SET key value NX EX ttl`; true when this call created the key.
    pub async fn set_if_absent(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let created: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    // Caching
    pub async fn cache_set<T>(&self, key: &str, value: &T, expiry_seconds: u64) -> Result<(), AppError>
    where
        T: Serialize,
    {
        let mut conn = self.manager.clone();
        let serialized = serde_json::to_string(value)?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(serialized)
            .arg("EX")
            .arg(expiry_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn cache_get<T>(&self, key: &str) -> Result<Option<T>, AppError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut conn = self.manager.clone();
        let result: Option<String> = conn.get(key).await?;

        match result {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn cache_delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    // Health check
    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

// Redis key builders
pub struct RedisKeys;

impl RedisKeys {
    pub fn first_time(key: &str) -> String {
        format!("dedup:{}", key)
    }
}
