use serde::{Deserialize, Serialize};

use karigo_common::{env_or, env_parse, AppConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    pub app: AppConfig,
    pub payment: PaymentServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentServiceConfig {
    pub velocity_window_minutes: i64,
    pub velocity_max_attempts: i64,
    pub default_currency: String,
    /// Enables webhook signature checks when set.
    pub webhook_secret: Option<String>,
    pub mock_capture_enabled: bool,
}

impl Default for PaymentServiceConfig {
    fn default() -> Self {
        Self {
            velocity_window_minutes: 10,
            velocity_max_attempts: 5,
            default_currency: "EUR".to_string(),
            webhook_secret: None,
            mock_capture_enabled: true,
        }
    }
}

impl PaymentConfig {
    pub fn from_env() -> Self {
        let app = AppConfig::from_env("payment-service", "PAYMENT", 8005);
        let mock_capture_enabled = env_parse("MOCK_CAPTURE_ENABLED", !app.is_production());
        Self {
            app,
            payment: PaymentServiceConfig {
                velocity_window_minutes: env_parse("VELOCITY_WINDOW_MINUTES", 10),
                velocity_max_attempts: env_parse("VELOCITY_MAX_ATTEMPTS", 5),
                default_currency: env_or("DEFAULT_CURRENCY", "EUR").to_uppercase(),
                webhook_secret: std::env::var("PAYMENT_WEBHOOK_SECRET")
                    .ok()
                    .filter(|secret| !secret.is_empty()),
                mock_capture_enabled,
            },
        }
    }
}
