use serde::{Deserialize, Serialize};

use karigo_common::{env_or, AppConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideConfig {
    pub app: AppConfig,
    pub default_currency: String,
}

impl RideConfig {
    pub fn from_env() -> Self {
        Self {
            app: AppConfig::from_env("ride-service", "RIDE", 8011),
            default_currency: env_or("DEFAULT_CURRENCY", "EUR").to_uppercase(),
        }
    }
}
