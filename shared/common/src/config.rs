use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Reads an environment variable, falling back to `default` when unset.
pub fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads and parses an environment variable, falling back to `default` when
/// unset or unparsable.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("DATABASE_HOST", "localhost"),
            port: env_parse("DATABASE_PORT", 5432),
            username: env_or("DATABASE_USERNAME", "karigo"),
            password: env_or("DATABASE_PASSWORD", "karigo"),
            database: env_or("DATABASE_NAME", "karigo"),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u8,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("REDIS_HOST", "localhost"),
            port: env_parse("REDIS_PORT", 6379),
            password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            database: env_parse("REDIS_DATABASE", 0),
        }
    }

    pub fn connection_string(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.database),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    /// `prefix` selects the per-service variables, e.g. `PAYMENT` reads
    /// `PAYMENT_HOST` and `PAYMENT_PORT`.
    pub fn from_env(prefix: &str, default_port: u16) -> Self {
        Self {
            host: env_or(&format!("{prefix}_HOST"), "0.0.0.0"),
            port: env_parse(&format!("{prefix}_PORT"), default_port),
            cors_origins: env_or("CORS_ORIGINS", "http://localhost:3000")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventBusBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    pub backend: EventBusBackend,
    /// Approximate upper bound on entries kept per stream.
    pub stream_max_len: usize,
    pub read_batch_size: usize,
    pub block_ms: usize,
    /// Identifies this process inside a consumer group.
    pub consumer_name: String,
}

impl EventBusConfig {
    pub fn from_env(service: &str) -> Self {
        let backend = match env_or("EVENT_BUS_BACKEND", "redis").to_lowercase().as_str() {
            "memory" => EventBusBackend::Memory,
            _ => EventBusBackend::Redis,
        };

        Self {
            backend,
            stream_max_len: env_parse("EVENT_BUS_STREAM_MAX_LEN", 100_000),
            read_batch_size: env_parse("EVENT_BUS_READ_BATCH", 32),
            block_ms: env_parse("EVENT_BUS_BLOCK_MS", 5_000),
            consumer_name: std::env::var("EVENT_BUS_CONSUMER_NAME")
                .unwrap_or_else(|_| format!("{}-{}", service, uuid::Uuid::new_v4())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_parse("CONSUMER_MAX_ATTEMPTS", 3),
            base_delay_ms: env_parse("CONSUMER_RETRY_BASE_DELAY_MS", 500),
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
}

impl OutboxConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval_ms: env_parse("OUTBOX_POLL_INTERVAL_MS", 250),
            batch_size: env_parse("OUTBOX_BATCH_SIZE", 100),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub internal_key: String,
}

impl PeerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings every service binary loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub event_bus: EventBusConfig,
    pub retry: RetryConfig,
    pub outbox: OutboxConfig,
    pub internal_key: String,
    pub environment: String,
}

impl AppConfig {
    pub fn from_env(service: &str, prefix: &str, default_port: u16) -> Self {
        Self {
            server: ServerConfig::from_env(prefix, default_port),
            database: DatabaseConfig::from_env(),
            redis: RedisConfig::from_env(),
            event_bus: EventBusConfig::from_env(service),
            retry: RetryConfig::from_env(),
            outbox: OutboxConfig::from_env(),
            internal_key: env_or("INTERNAL_API_KEY", "dev-internal-key-change-in-production"),
            environment: env_or("ENVIRONMENT", "development"),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_connection_string_includes_password_when_present() {
        let config = RedisConfig {
            host: "cache".to_string(),
            port: 6380,
            password: Some("secret".to_string()),
            database: 2,
        };
        assert_eq!(config.connection_string(), "redis://:secret@cache:6380/2");
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("KARIGO_TEST_ENV_PARSE", "not-a-number");
        assert_eq!(env_parse("KARIGO_TEST_ENV_PARSE", 7u32), 7);
        std::env::set_var("KARIGO_TEST_ENV_PARSE", "12");
        assert_eq!(env_parse("KARIGO_TEST_ENV_PARSE", 7u32), 12);
    }
}
