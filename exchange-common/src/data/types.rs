// exchange-common/src/data/types.rs
// ====
// Normalized cross-exchange data model
// ====
// Every venue adapter maps its wire payloads into these types. Field names
// serialize in camelCase because the serialized form doubles as the key set
// of the path-addressed store (`public.tickers.BTCUSDT.fundingRate`).
// ====

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeId {
    Bybit,
    Binance,
    Hyperliquid,
}

impl ExchangeId {
    /// Key under which this venue's memory lives in the root store.
    pub fn key(&self) -> &'static str {
        match self {
            ExchangeId::Bybit => "bybit",
            ExchangeId::Binance => "binance",
            ExchangeId::Hyperliquid => "hyperliquid",
        }
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for ExchangeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bybit" => Ok(ExchangeId::Bybit),
            "binance" => Ok(ExchangeId::Binance),
            "hyperliquid" => Ok(ExchangeId::Hyperliquid),
            other => Err(format!("unknown exchange '{}'", other)),
        }
    }
}

/// One tradable identity on one venue. Immutable after creation.
///
/// For EIP-712 venues `api_secret` holds the hex private key and `api_key`
/// the wallet address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub exchange: ExchangeId,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPrecision {
    pub amount: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmountLimits {
    pub min: Decimal,
    pub max: Decimal,
    pub max_market: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeverageLimits {
    pub min: Decimal,
    pub max: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketLimits {
    pub amount: AmountLimits,
    pub leverage: LeverageLimits,
}

/// Static-ish reference data, keyed by symbol per exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: String,
    pub exchange: ExchangeId,
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub active: bool,
    pub precision: MarketPrecision,
    pub limits: MarketLimits,
}

/// Live top-of-book and venue statistics for one symbol.
///
/// Replaced wholesale on snapshots, merged field-by-field on deltas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub id: String,
    pub symbol: String,
    pub exchange: Option<ExchangeId>,
    pub clean_symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub mark: Decimal,
    pub index: Decimal,
    pub percentage: Decimal,
    pub open_interest: Decimal,
    pub funding_rate: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn flipped(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    StopLoss,
    TakeProfit,
}

/// Suffix appended to a parent order id for the synthetic stop-loss leg.
pub const STOP_LOSS_SUFFIX: &str = "__stop_loss";
/// Suffix appended to a parent order id for the synthetic take-profit leg.
pub const TAKE_PROFIT_SUFFIX: &str = "__take_profit";

/// One live or historical order in normalized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub exchange: ExchangeId,
    pub account_id: String,
    pub status: OrderStatus,
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub reduce_only: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub account_id: String,
    pub exchange: ExchangeId,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub notional: Decimal,
    pub leverage: Decimal,
    pub upnl: Decimal,
    pub rpnl: Decimal,
    pub contracts: Decimal,
    pub liquidation_price: Decimal,
    pub is_hedged: bool,
}

/// Single row per account, replaced wholesale on each fetch/push.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub total: Decimal,
    pub upnl: Decimal,
    pub used: Decimal,
    pub free: Decimal,
}

/// Append-only fill history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub timestamp: i64,
}

/// One OHLCV bar. `fetch_ohlcv` returns these sorted ascending by timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Per-account, per-symbol trading metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionMetadata {
    pub leverage: Decimal,
    pub is_hedged: bool,
}

/// A logical order as submitted by the caller, before venue formatting and
/// lot splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<Decimal>,
    pub amount: Decimal,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

/// Targets one live order for modification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdateRequest {
    pub order_id: String,
    pub symbol: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub amount: Option<Decimal>,
}

/// Targets one live order for cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub order_id: String,
    pub symbol: String,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_id_roundtrip() {
        for id in [ExchangeId::Bybit, ExchangeId::Binance, ExchangeId::Hyperliquid] {
            let parsed: ExchangeId = id.key().parse().unwrap();
            assert_eq!(parsed, id);
        }
        assert!("ftx".parse::<ExchangeId>().is_err());
    }

    #[test]
    fn test_order_serializes_camel_case() {
        let order = Order {
            id: "1".to_string(),
            exchange: ExchangeId::Bybit,
            account_id: "a1".to_string(),
            status: OrderStatus::Open,
            symbol: "BTCUSDT".to_string(),
            order_type: OrderType::Limit,
            side: OrderSide::Buy,
            price: Decimal::ONE,
            amount: Decimal::ONE,
            filled: Decimal::ZERO,
            remaining: Decimal::ONE,
            reduce_only: false,
            timestamp: 0,
        };
        let value = serde_json::to_value(&order).unwrap();
        assert!(value.get("accountId").is_some());
        assert!(value.get("reduceOnly").is_some());
        assert_eq!(value["type"], "Limit");
    }
}
