use std::time::Duration;

use serde::{Deserialize, Serialize};

use karigo_common::{env_parse, AppConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub app: AppConfig,
    pub dedup_ttl_secs: u64,
    pub dedup_sweep_secs: u64,
}

impl NotificationConfig {
    pub fn from_env() -> Self {
        Self {
            app: AppConfig::from_env("notification-service", "NOTIFICATION", 8006),
            dedup_ttl_secs: env_parse("NOTIFICATION_DEDUP_TTL_SECS", 7 * 24 * 60 * 60),
            dedup_sweep_secs: env_parse("DEDUP_SWEEP_SECS", 60),
        }
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}
