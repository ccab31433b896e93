use serde::{Deserialize, Serialize};

use karigo_common::{env_or, env_parse, AppConfig, PeerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfig {
    pub app: AppConfig,
    pub ride_service: PeerConfig,
    pub default_currency: String,
}

impl BookingConfig {
    pub fn from_env() -> Self {
        let app = AppConfig::from_env("booking-service", "BOOKING", 8012);
        let ride_service = PeerConfig {
            base_url: env_or("RIDE_SERVICE_URL", "http://localhost:8011"),
            timeout_ms: env_parse("PEER_TIMEOUT_MS", 3_000),
            internal_key: app.internal_key.clone(),
        };

        Self {
            app,
            ride_service,
            default_currency: env_or("DEFAULT_CURRENCY", "EUR").to_uppercase(),
        }
    }
}
