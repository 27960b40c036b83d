// exchange/testkit.rs
// In-process mock venue for worker/orchestrator tests. No network: REST
// calls answer from canned data and the WebSocket URLs point at a dead
// local port the transport retries against harmlessly.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use exchange_common::types::{
    Account, AmountLimits, Balance, Candle, ExchangeId, Fill, LeverageLimits, Market,
    MarketLimits, MarketPrecision, Order, Position, Ticker,
};

use super::errors::ExchangeError;
use super::traits::{ExchangeAdapter, OrderPayload, PrivatePush, PublicPush};

pub fn market(symbol: &str, max_amount: Decimal) -> Market {
    Market {
        id: symbol.to_string(),
        exchange: ExchangeId::Bybit,
        symbol: symbol.to_string(),
        base: symbol.trim_end_matches("USDT").to_string(),
        quote: "USDT".to_string(),
        active: true,
        precision: MarketPrecision {
            amount: dec!(0.001),
            price: dec!(0.1),
        },
        limits: MarketLimits {
            amount: AmountLimits {
                min: dec!(0.001),
                max: max_amount,
                max_market: max_amount,
            },
            leverage: LeverageLimits {
                min: Decimal::ONE,
                max: dec!(100),
            },
        },
    }
}

pub fn ticker(symbol: &str, last: Decimal) -> Ticker {
    Ticker {
        id: symbol.to_string(),
        symbol: symbol.to_string(),
        exchange: Some(ExchangeId::Bybit),
        clean_symbol: symbol.trim_end_matches("USDT").to_string(),
        bid: last - dec!(0.1),
        ask: last + dec!(0.1),
        last,
        ..Ticker::default()
    }
}

pub fn mock_account(id: &str) -> Account {
    Account {
        id: id.to_string(),
        exchange: ExchangeId::Bybit,
        api_key: "key".to_string(),
        api_secret: "secret".to_string(),
    }
}

#[derive(Default)]
pub struct MockAdapter {
    placed: AtomicU64,
}

#[async_trait]
impl ExchangeAdapter for MockAdapter {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    fn rate_per_second(&self) -> f64 {
        1000.0
    }

    fn supports_order_update(&self) -> bool {
        true
    }

    fn attaches_protection_to_entry(&self) -> bool {
        true
    }

    async fn fetch_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        Ok(vec![
            market("BTCUSDT", dec!(100)),
            market("ETHUSDT", dec!(1000)),
            market("SOLUSDT", dec!(10000)),
        ])
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        // The fourth symbol has no market and must be dropped by the worker.
        Ok(vec![
            ticker("BTCUSDT", dec!(100)),
            ticker("ETHUSDT", dec!(10)),
            ticker("SOLUSDT", dec!(1)),
            ticker("XRPUSDT", dec!(0.5)),
        ])
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        Ok((0..limit.min(5) as i64)
            .map(|i| Candle {
                timestamp: i * 60_000,
                open: dec!(1),
                high: dec!(2),
                low: dec!(0.5),
                close: dec!(1.5),
                volume: dec!(10),
            })
            .collect())
    }

    async fn fetch_balance(&self, _account: &Account) -> Result<Balance, ExchangeError> {
        Ok(Balance {
            total: dec!(1000),
            upnl: Decimal::ZERO,
            used: dec!(100),
            free: dec!(900),
        })
    }

    async fn fetch_positions(&self, _account: &Account) -> Result<Vec<Position>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn fetch_open_orders(&self, _account: &Account) -> Result<Vec<Order>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn fetch_fills_page(
        &self,
        _account: &Account,
        _cursor: Option<String>,
        _page_size: u32,
    ) -> Result<(Vec<Fill>, Option<String>), ExchangeError> {
        Ok((Vec::new(), None))
    }

    async fn place_order(
        &self,
        _account: &Account,
        _payload: &OrderPayload,
    ) -> Result<String, ExchangeError> {
        let n = self.placed.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("mock-{}", n))
    }

    async fn amend_order(
        &self,
        _account: &Account,
        _payload: &super::traits::AmendPayload,
    ) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn cancel_order(
        &self,
        _account: &Account,
        _symbol: &str,
        _order_id: &str,
    ) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn set_leverage(
        &self,
        _account: &Account,
        _symbol: &str,
        _leverage: Decimal,
    ) -> Result<(), ExchangeError> {
        Ok(())
    }

    fn ws_public_url(&self) -> String {
        "ws://127.0.0.1:9".to_string()
    }

    async fn ws_private_url(&self, _account: &Account) -> Result<String, ExchangeError> {
        Ok("ws://127.0.0.1:9".to_string())
    }

    fn public_subscriptions(&self, _symbols: &[String]) -> Vec<String> {
        Vec::new()
    }

    fn kline_subscription(
        &self,
        _symbol: &str,
        _timeframe: &str,
        _subscribe: bool,
    ) -> Option<String> {
        None
    }

    fn book_subscription(&self, _symbol: &str, _subscribe: bool) -> Option<String> {
        None
    }

    async fn private_subscriptions(
        &self,
        _account: &Account,
    ) -> Result<Vec<String>, ExchangeError> {
        Ok(Vec::new())
    }

    fn parse_public(&self, _raw: &str) -> Vec<PublicPush> {
        Vec::new()
    }

    fn parse_private(&self, _raw: &str) -> Vec<PrivatePush> {
        Vec::new()
    }
}
