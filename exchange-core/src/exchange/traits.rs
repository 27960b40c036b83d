// exchange/traits.rs
// ====
// The per-venue adapter seam
// ====
// Everything venue-specific (endpoint paths, field names, status words,
// auth handshakes) lives behind this trait. The worker is written once
// against it.
// ====

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use exchange_common::types::{
    Account, Balance, Candle, ExchangeId, Fill, Market, Order, OrderSide, OrderType, Position,
    PositionSide, Ticker,
};

use super::errors::ExchangeError;

/// Exchange-native order status, normalized to a closed set before any
/// lifecycle decision is made. Mapping tables live in the venue adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl RawOrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RawOrderStatus::Filled
                | RawOrderStatus::Canceled
                | RawOrderStatus::Rejected
                | RawOrderStatus::Expired
        )
    }
}

/// One order-status push from a private stream.
#[derive(Debug, Clone)]
pub struct OrderPush {
    pub id: String,
    pub symbol: String,
    pub status: RawOrderStatus,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Decimal,
    pub amount: Decimal,
    /// Cumulative executed amount as reported by the venue.
    pub executed: Decimal,
    pub reduce_only: bool,
    pub timestamp: i64,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// One position push. Zero contracts means the position is gone.
#[derive(Debug, Clone)]
pub struct PositionPush {
    pub symbol: String,
    pub side: PositionSide,
    pub contracts: Decimal,
    pub entry_price: Decimal,
    pub notional: Decimal,
    pub leverage: Decimal,
    pub upnl: Decimal,
    pub rpnl: Decimal,
    pub liquidation_price: Decimal,
    pub is_hedged: bool,
}

#[derive(Debug, Clone)]
pub enum PrivatePush {
    Order(OrderPush),
    Position(PositionPush),
    Balance(Balance),
}

#[derive(Debug, Clone)]
pub enum PublicPush {
    /// Full ticker replace.
    TickerSnapshot(Ticker),
    /// Partial merge: only the listed fields change, values already in
    /// store encoding.
    TickerDelta {
        symbol: String,
        fields: BTreeMap<String, Value>,
    },
    BookSnapshot {
        symbol: String,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    },
    BookDelta {
        symbol: String,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    },
    Candle {
        symbol: String,
        timeframe: String,
        candle: Candle,
    },
    /// Venue answered our application-level ping.
    Pong,
}

/// A venue-ready order payload: one exchange-submitted order, produced by
/// the worker after validation, hedge tagging, and lot splitting.
#[derive(Debug, Clone)]
pub struct OrderPayload {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub reduce_only: bool,
    /// 0 = one-way, 1 = hedge long, 2 = hedge short.
    pub position_idx: u8,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Targets one live order for venue-side amendment.
#[derive(Debug, Clone)]
pub struct AmendPayload {
    pub order_id: String,
    pub symbol: String,
    pub price: Option<Decimal>,
    pub amount: Option<Decimal>,
}

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// Steady-state ceiling for the account's outbound operation queue.
    fn rate_per_second(&self) -> f64 {
        10.0
    }

    /// False degrades `update_orders` to cancel-then-replace.
    fn supports_order_update(&self) -> bool {
        false
    }

    /// True when the venue attaches SL/TP as fields on an entry order
    /// instead of accepting standalone protection orders.
    fn attaches_protection_to_entry(&self) -> bool {
        false
    }

    // ---- REST: public ----

    async fn fetch_markets(&self) -> Result<Vec<Market>, ExchangeError>;
    async fn fetch_tickers(&self) -> Result<Vec<Ticker>, ExchangeError>;
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    // ---- REST: private ----

    async fn fetch_balance(&self, account: &Account) -> Result<Balance, ExchangeError>;
    async fn fetch_positions(&self, account: &Account) -> Result<Vec<Position>, ExchangeError>;
    async fn fetch_open_orders(&self, account: &Account) -> Result<Vec<Order>, ExchangeError>;
    /// One page of filled-order history, newest first. `cursor` is None for
    /// the first page; a None cursor in the result means no further pages.
    async fn fetch_fills_page(
        &self,
        account: &Account,
        cursor: Option<String>,
        page_size: u32,
    ) -> Result<(Vec<Fill>, Option<String>), ExchangeError>;

    async fn place_order(
        &self,
        account: &Account,
        payload: &OrderPayload,
    ) -> Result<String, ExchangeError>;
    async fn amend_order(
        &self,
        account: &Account,
        payload: &AmendPayload,
    ) -> Result<(), ExchangeError> {
        let _ = (account, payload);
        Err(ExchangeError::InvalidRequest(
            "venue does not support order amendment".to_string(),
        ))
    }
    async fn cancel_order(
        &self,
        account: &Account,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), ExchangeError>;
    async fn set_leverage(
        &self,
        account: &Account,
        symbol: &str,
        leverage: Decimal,
    ) -> Result<(), ExchangeError>;

    // ---- WebSocket ----

    fn ws_public_url(&self) -> String;
    /// May require venue I/O (e.g. acquiring a listen key).
    async fn ws_private_url(&self, account: &Account) -> Result<String, ExchangeError>;
    /// Messages to send right after the public socket opens.
    fn public_subscriptions(&self, symbols: &[String]) -> Vec<String>;
    /// Subscribe/unsubscribe message for one kline stream, if the venue
    /// streams klines.
    fn kline_subscription(&self, symbol: &str, timeframe: &str, subscribe: bool) -> Option<String>;
    /// Subscribe/unsubscribe message for one order-book stream.
    fn book_subscription(&self, symbol: &str, subscribe: bool) -> Option<String>;
    /// Messages to send right after the private socket opens (auth
    /// handshake and private subscriptions).
    async fn private_subscriptions(&self, account: &Account) -> Result<Vec<String>, ExchangeError>;
    /// Periodic private-session upkeep (listen-key keepalive). None when
    /// the venue needs none.
    fn session_refresh_interval(&self) -> Option<Duration> {
        None
    }
    async fn refresh_private_session(&self, account: &Account) -> Result<(), ExchangeError> {
        let _ = account;
        Ok(())
    }
    /// Application-level ping, also used for latency sampling.
    fn ping_message(&self) -> Option<String> {
        None
    }

    fn parse_public(&self, raw: &str) -> Vec<PublicPush>;
    fn parse_private(&self, raw: &str) -> Vec<PrivatePush>;
}
