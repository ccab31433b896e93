use std::time::Duration;

use serde::{Deserialize, Serialize};

use karigo_common::{env_parse, AppConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub app: AppConfig,
    /// How long a processed event stays marked as seen.
    pub dedup_ttl_secs: u64,
    /// Sweep interval for the in-memory dedup store.
    pub dedup_sweep_secs: u64,
}

impl SearchConfig {
    pub fn from_env() -> Self {
        Self {
            app: AppConfig::from_env("search-service", "SEARCH", 8014),
            dedup_ttl_secs: env_parse("SEARCH_DEDUP_TTL_SECS", 7 * 24 * 60 * 60),
            dedup_sweep_secs: env_parse("DEDUP_SWEEP_SECS", 60),
        }
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }
}
