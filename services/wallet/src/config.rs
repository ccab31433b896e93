use serde::{Deserialize, Serialize};

use karigo_common::{env_or, AppConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub app: AppConfig,
    pub default_currency: String,
}

impl WalletConfig {
    pub fn from_env() -> Self {
        Self {
            app: AppConfig::from_env("wallet-service", "WALLET", 8013),
            default_currency: env_or("DEFAULT_CURRENCY", "EUR").to_uppercase(),
        }
    }
}
