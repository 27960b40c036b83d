// exchange-core/src/config.rs
// Per-exchange endpoint configuration. Code defaults point at production;
// an optional `config` file and EXCHANGE__-prefixed environment variables
// override them. There is no other persisted configuration.

use config::{Config, ConfigError, Environment, File};
use exchange_common::types::ExchangeId;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct VenueEndpoints {
    pub public_api_url: String,
    pub private_api_url: String,
    pub ws_public_url: String,
    pub ws_private_url: String,
    #[serde(default)]
    pub broker_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub bybit: VenueEndpoints,
    pub binance: VenueEndpoints,
    pub hyperliquid: VenueEndpoints,
    /// Seconds a façade waits for a worker response before resolving the
    /// pending call as a timeout error.
    pub bridge_timeout_secs: u64,
    /// Attempts for transient REST failures before surfacing the error.
    pub http_retries: u32,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .set_default("bybit.public_api_url", "https://api.bybit.com")?
            .set_default("bybit.private_api_url", "https://api.bybit.com")?
            .set_default("bybit.ws_public_url", "wss://stream.bybit.com/v5/public/linear")?
            .set_default("bybit.ws_private_url", "wss://stream.bybit.com/v5/private")?
            .set_default("binance.public_api_url", "https://fapi.binance.com")?
            .set_default("binance.private_api_url", "https://fapi.binance.com")?
            .set_default("binance.ws_public_url", "wss://fstream.binance.com/stream")?
            .set_default("binance.ws_private_url", "wss://fstream.binance.com/ws")?
            .set_default("hyperliquid.public_api_url", "https://api.hyperliquid.xyz")?
            .set_default("hyperliquid.private_api_url", "https://api.hyperliquid.xyz")?
            .set_default("hyperliquid.ws_public_url", "wss://api.hyperliquid.xyz/ws")?
            .set_default("hyperliquid.ws_private_url", "wss://api.hyperliquid.xyz/ws")?
            .set_default("bridge_timeout_secs", 30)?
            .set_default("http_retries", 3)?
            .add_source(File::with_name("config").required(false))
            .add_source(Environment::with_prefix("EXCHANGE").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn endpoints(&self, exchange: ExchangeId) -> &VenueEndpoints {
        match exchange {
            ExchangeId::Bybit => &self.bybit,
            ExchangeId::Binance => &self.binance,
            ExchangeId::Hyperliquid => &self.hyperliquid,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        // Defaults never fail: every key has a set_default above.
        Self::new().expect("default settings")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_venue() {
        let settings = Settings::new().unwrap();
        for exchange in [ExchangeId::Bybit, ExchangeId::Binance, ExchangeId::Hyperliquid] {
            let ep = settings.endpoints(exchange);
            assert!(ep.public_api_url.starts_with("https://"));
            assert!(ep.ws_public_url.starts_with("wss://"));
        }
        assert_eq!(settings.bridge_timeout_secs, 30);
    }
}
