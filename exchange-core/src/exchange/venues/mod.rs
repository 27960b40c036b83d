// exchange/venues/mod.rs

pub mod binance;
pub mod bybit;
pub mod hyperliquid;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use exchange_common::types::ExchangeId;

use crate::config::Settings;

use super::errors::ExchangeError;
use super::traits::ExchangeAdapter;

pub use binance::Binance;
pub use bybit::Bybit;
pub use hyperliquid::Hyperliquid;

/// Builds the production adapter for one venue.
pub fn build_adapter(settings: &Settings, exchange: ExchangeId) -> Arc<dyn ExchangeAdapter> {
    match exchange {
        ExchangeId::Bybit => Arc::new(Bybit::new(
            settings.endpoints(exchange).clone(),
            settings.http_retries,
        )),
        ExchangeId::Binance => Arc::new(Binance::new(
            settings.endpoints(exchange).clone(),
            settings.http_retries,
        )),
        ExchangeId::Hyperliquid => Arc::new(Hyperliquid::new(
            settings.endpoints(exchange).clone(),
            settings.http_retries,
        )),
    }
}

/// Bounded retry for transient request failures; venue rejections pass
/// through untouched.
pub(crate) async fn with_retries<T, F, Fut>(attempts: u32, op: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(
                e @ (ExchangeError::Network(_) | ExchangeError::Timeout | ExchangeError::Parse(_)),
            ) => {
                last = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt + 1))).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| ExchangeError::Network("retries exhausted".to_string())))
}

/// "BTCUSDT" with quote "USDT" reads as "BTC".
pub(crate) fn clean_symbol(symbol: &str, quote: &str) -> String {
    symbol
        .strip_suffix(quote)
        .unwrap_or(symbol)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_symbol() {
        assert_eq!(clean_symbol("BTCUSDT", "USDT"), "BTC");
        assert_eq!(clean_symbol("BTC", "USD"), "BTC");
    }

    #[tokio::test]
    async fn test_with_retries_passes_business_errors_through() {
        let result: Result<(), _> = with_retries(3, || async {
            Err(ExchangeError::Api("rejected".to_string()))
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Api(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retries_retries_transient_errors() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Timeout) }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
