// exchange/venues/bybit.rs
// ====
// Bybit v5 adapter (USDT perpetuals)
// ====

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use exchange_common::math;
use exchange_common::types::{
    now_millis, Account, Balance, Candle, ExchangeId, Fill, Market, Order, OrderSide, OrderStatus,
    OrderType, Position, PositionSide, Ticker,
};

use crate::config::VenueEndpoints;
use crate::exchange::errors::ExchangeError;
use crate::exchange::hmac::HmacSigner;
use crate::exchange::traits::{
    AmendPayload, ExchangeAdapter, OrderPayload, OrderPush, PositionPush, PrivatePush, PublicPush,
    RawOrderStatus,
};

use super::{clean_symbol, with_retries};

const CATEGORY: &str = "linear";
const RECV_WINDOW: u64 = 5000;
const SUBSCRIPTION_BATCH: usize = 10;

pub struct Bybit {
    endpoints: VenueEndpoints,
    client: Client,
    retries: u32,
    signers: DashMap<String, Arc<HmacSigner>>,
}

impl Bybit {
    pub fn new(endpoints: VenueEndpoints, retries: u32) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            endpoints,
            client,
            retries,
            signers: DashMap::new(),
        }
    }

    fn signer(&self, account: &Account) -> Arc<HmacSigner> {
        self.signers
            .entry(account.id.clone())
            .or_insert_with(|| {
                Arc::new(HmacSigner::new(
                    account.api_key.clone(),
                    account.api_secret.clone(),
                ))
            })
            .clone()
    }

    async fn get_public(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        with_retries(self.retries, || async {
            let url = format!("{}{}?{}", self.endpoints.public_api_url, path, query);
            let value: Value = self.client.get(&url).send().await?.json().await?;
            check_ret(value)
        })
        .await
    }

    async fn get_signed(
        &self,
        account: &Account,
        path: &str,
        query: &str,
    ) -> Result<Value, ExchangeError> {
        with_retries(self.retries, || async {
            let signer = self.signer(account);
            let timestamp = now_millis();
            let signature = signer.sign_v5(timestamp, RECV_WINDOW, query);
            let url = format!("{}{}?{}", self.endpoints.private_api_url, path, query);
            let value: Value = self
                .client
                .get(&url)
                .header("X-BAPI-API-KEY", signer.api_key())
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
                .header("X-BAPI-SIGN", signature)
                .send()
                .await?
                .json()
                .await?;
            check_ret(value)
        })
        .await
    }

    async fn post_signed(
        &self,
        account: &Account,
        path: &str,
        body: &Value,
    ) -> Result<Value, ExchangeError> {
        let body_text = body.to_string();
        with_retries(self.retries, || async {
            let signer = self.signer(account);
            let timestamp = now_millis();
            let signature = signer.sign_v5(timestamp, RECV_WINDOW, &body_text);
            let url = format!("{}{}", self.endpoints.private_api_url, path);
            let value: Value = self
                .client
                .post(&url)
                .header("X-BAPI-API-KEY", signer.api_key())
                .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
                .header("X-BAPI-SIGN", signature.clone())
                .header("Content-Type", "application/json")
                .body(body_text.clone())
                .send()
                .await?
                .json()
                .await?;
            check_ret(value)
        })
        .await
    }
}

fn check_ret(value: Value) -> Result<Value, ExchangeError> {
    let code = value["retCode"].as_i64().unwrap_or(-1);
    if code == 0 {
        return Ok(value["result"].clone());
    }
    let message = format!("{}: {}", code, value["retMsg"].as_str().unwrap_or("unknown"));
    // 110025/10001 report an order tagged for the wrong position mode.
    if code == 110025 || (code == 10001 && message.contains("position idx")) {
        return Err(ExchangeError::PositionModeMismatch(message));
    }
    Err(ExchangeError::Api(message))
}

fn dec_field(value: &Value, key: &str) -> Decimal {
    match &value[key] {
        Value::String(s) => math::parse_or_zero(s),
        Value::Number(n) => n.as_f64().map(math::from_f64).unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

fn map_market(item: &Value) -> Option<Market> {
    let symbol = item["symbol"].as_str()?.to_string();
    let lot = &item["lotSizeFilter"];
    let price_filter = &item["priceFilter"];
    let leverage = &item["leverageFilter"];
    Some(Market {
        id: symbol.clone(),
        exchange: ExchangeId::Bybit,
        symbol: symbol.clone(),
        base: item["baseCoin"].as_str().unwrap_or_default().to_string(),
        quote: item["quoteCoin"].as_str().unwrap_or_default().to_string(),
        active: item["status"].as_str() == Some("Trading"),
        precision: exchange_common::types::MarketPrecision {
            amount: dec_field(lot, "qtyStep"),
            price: dec_field(price_filter, "tickSize"),
        },
        limits: exchange_common::types::MarketLimits {
            amount: exchange_common::types::AmountLimits {
                min: dec_field(lot, "minOrderQty"),
                max: dec_field(lot, "maxOrderQty"),
                max_market: dec_field(lot, "maxMktOrderQty"),
            },
            leverage: exchange_common::types::LeverageLimits {
                min: dec_field(leverage, "minLeverage"),
                max: dec_field(leverage, "maxLeverage"),
            },
        },
    })
}

fn map_ticker(item: &Value) -> Option<Ticker> {
    let symbol = item["symbol"].as_str()?.to_string();
    Some(Ticker {
        id: symbol.clone(),
        symbol: symbol.clone(),
        exchange: Some(ExchangeId::Bybit),
        clean_symbol: clean_symbol(&symbol, "USDT"),
        bid: dec_field(item, "bid1Price"),
        ask: dec_field(item, "ask1Price"),
        last: dec_field(item, "lastPrice"),
        mark: dec_field(item, "markPrice"),
        index: dec_field(item, "indexPrice"),
        percentage: math::multiply(dec_field(item, "price24hPcnt"), Decimal::ONE_HUNDRED),
        open_interest: dec_field(item, "openInterest"),
        funding_rate: dec_field(item, "fundingRate"),
        volume: dec_field(item, "volume24h"),
        quote_volume: dec_field(item, "turnover24h"),
    })
}

fn map_order_status(status: &str) -> RawOrderStatus {
    match status {
        "PartiallyFilled" => RawOrderStatus::PartiallyFilled,
        "Filled" => RawOrderStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" => RawOrderStatus::Canceled,
        "Rejected" => RawOrderStatus::Rejected,
        "Deactivated" | "Expired" => RawOrderStatus::Expired,
        // New / Untriggered / Triggered and anything unknown stay live.
        _ => RawOrderStatus::New,
    }
}

fn map_order_type(item: &Value) -> OrderType {
    match item["stopOrderType"].as_str().unwrap_or_default() {
        "StopLoss" => OrderType::StopLoss,
        "TakeProfit" => OrderType::TakeProfit,
        _ => match item["orderType"].as_str().unwrap_or_default() {
            "Market" => OrderType::Market,
            _ => OrderType::Limit,
        },
    }
}

fn map_side(side: &str) -> OrderSide {
    if side == "Sell" {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

fn map_order(item: &Value, account_id: &str) -> Option<Order> {
    let amount = dec_field(item, "qty");
    let filled = dec_field(item, "cumExecQty");
    Some(Order {
        id: item["orderId"].as_str()?.to_string(),
        exchange: ExchangeId::Bybit,
        account_id: account_id.to_string(),
        status: match map_order_status(item["orderStatus"].as_str().unwrap_or_default()) {
            RawOrderStatus::Filled => OrderStatus::Filled,
            RawOrderStatus::Canceled => OrderStatus::Canceled,
            RawOrderStatus::Rejected | RawOrderStatus::Expired => OrderStatus::Closed,
            _ => OrderStatus::Open,
        },
        symbol: item["symbol"].as_str().unwrap_or_default().to_string(),
        order_type: map_order_type(item),
        side: map_side(item["side"].as_str().unwrap_or_default()),
        price: dec_field(item, "price"),
        amount,
        filled,
        remaining: math::subtract(amount, filled).max(Decimal::ZERO),
        reduce_only: item["reduceOnly"].as_bool().unwrap_or(false),
        timestamp: item["createdTime"]
            .as_str()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0),
    })
}

fn map_position(item: &Value, account_id: &str) -> Option<Position> {
    let contracts = dec_field(item, "size");
    if contracts.is_zero() {
        return None;
    }
    Some(Position {
        account_id: account_id.to_string(),
        exchange: ExchangeId::Bybit,
        symbol: item["symbol"].as_str()?.to_string(),
        side: if item["side"].as_str() == Some("Sell") {
            PositionSide::Short
        } else {
            PositionSide::Long
        },
        entry_price: dec_field(item, "avgPrice"),
        notional: dec_field(item, "positionValue"),
        leverage: dec_field(item, "leverage"),
        upnl: dec_field(item, "unrealisedPnl"),
        rpnl: dec_field(item, "cumRealisedPnl"),
        contracts,
        liquidation_price: dec_field(item, "liqPrice"),
        is_hedged: item["positionIdx"].as_i64().unwrap_or(0) != 0,
    })
}

/// Bybit ticker payloads use the same keys for snapshots and deltas; this
/// table maps the present keys onto store field names.
const TICKER_FIELDS: &[(&str, &str)] = &[
    ("bid1Price", "bid"),
    ("ask1Price", "ask"),
    ("lastPrice", "last"),
    ("markPrice", "mark"),
    ("indexPrice", "index"),
    ("openInterest", "openInterest"),
    ("fundingRate", "fundingRate"),
    ("volume24h", "volume"),
    ("turnover24h", "quoteVolume"),
];

fn ticker_delta_fields(data: &Value) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    for (wire, ours) in TICKER_FIELDS {
        if let Some(raw) = data.get(*wire) {
            if !raw.is_null() {
                fields.insert((*ours).to_string(), raw.clone());
            }
        }
    }
    if let Some(raw) = data.get("price24hPcnt").and_then(Value::as_str) {
        let pct = math::multiply(math::parse_or_zero(raw), Decimal::ONE_HUNDRED);
        fields.insert("percentage".to_string(), json!(pct));
    }
    fields
}

fn parse_levels(raw: &Value) -> Vec<(Decimal, Decimal)> {
    raw.as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    let pair = level.as_array()?;
                    let price = math::parse_or_zero(pair.first()?.as_str()?);
                    let amount = math::parse_or_zero(pair.get(1)?.as_str()?);
                    Some((price, amount))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn interval_of(timeframe: &str) -> &'static str {
    match timeframe {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "4h" => "240",
        "1d" => "D",
        _ => "1",
    }
}

fn timeframe_of(interval: &str) -> String {
    match interval {
        "1" => "1m",
        "3" => "3m",
        "5" => "5m",
        "15" => "15m",
        "30" => "30m",
        "60" => "1h",
        "240" => "4h",
        "D" => "1d",
        other => other,
    }
    .to_string()
}

fn decimal_str(value: Decimal) -> String {
    value.normalize().to_string()
}

#[async_trait]
impl ExchangeAdapter for Bybit {
    fn id(&self) -> ExchangeId {
        ExchangeId::Bybit
    }

    fn rate_per_second(&self) -> f64 {
        10.0
    }

    fn supports_order_update(&self) -> bool {
        true
    }

    fn attaches_protection_to_entry(&self) -> bool {
        true
    }

    async fn fetch_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        let result = self
            .get_public(
                "/v5/market/instruments-info",
                &format!("category={}&limit=1000", CATEGORY),
            )
            .await?;
        Ok(result["list"]
            .as_array()
            .map(|list| list.iter().filter_map(map_market).collect())
            .unwrap_or_default())
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        let result = self
            .get_public("/v5/market/tickers", &format!("category={}", CATEGORY))
            .await?;
        Ok(result["list"]
            .as_array()
            .map(|list| list.iter().filter_map(map_ticker).collect())
            .unwrap_or_default())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let result = self
            .get_public(
                "/v5/market/kline",
                &format!(
                    "category={}&symbol={}&interval={}&limit={}",
                    CATEGORY,
                    symbol,
                    interval_of(timeframe),
                    limit
                ),
            )
            .await?;
        let mut candles: Vec<Candle> = result["list"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|row| {
                        let row = row.as_array()?;
                        Some(Candle {
                            timestamp: row.first()?.as_str()?.parse().ok()?,
                            open: math::parse_or_zero(row.get(1)?.as_str()?),
                            high: math::parse_or_zero(row.get(2)?.as_str()?),
                            low: math::parse_or_zero(row.get(3)?.as_str()?),
                            close: math::parse_or_zero(row.get(4)?.as_str()?),
                            volume: math::parse_or_zero(row.get(5)?.as_str()?),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        // The venue returns newest first; callers get ascending.
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn fetch_balance(&self, account: &Account) -> Result<Balance, ExchangeError> {
        let result = self
            .get_signed(account, "/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let row = &result["list"][0];
        Ok(Balance {
            total: dec_field(row, "totalEquity"),
            upnl: dec_field(row, "totalPerpUPL"),
            used: dec_field(row, "totalInitialMargin"),
            free: dec_field(row, "totalAvailableBalance"),
        })
    }

    async fn fetch_positions(&self, account: &Account) -> Result<Vec<Position>, ExchangeError> {
        let result = self
            .get_signed(
                account,
                "/v5/position/list",
                &format!("category={}&settleCoin=USDT&limit=200", CATEGORY),
            )
            .await?;
        Ok(result["list"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|item| map_position(item, &account.id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_open_orders(&self, account: &Account) -> Result<Vec<Order>, ExchangeError> {
        let result = self
            .get_signed(
                account,
                "/v5/order/realtime",
                &format!("category={}&settleCoin=USDT&limit=50", CATEGORY),
            )
            .await?;
        Ok(result["list"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|item| map_order(item, &account.id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_fills_page(
        &self,
        account: &Account,
        cursor: Option<String>,
        page_size: u32,
    ) -> Result<(Vec<Fill>, Option<String>), ExchangeError> {
        let mut query = format!(
            "category={}&execType=Trade&limit={}",
            CATEGORY,
            page_size.min(100)
        );
        if let Some(cursor) = cursor {
            query.push_str(&format!("&cursor={}", cursor));
        }
        let result = self
            .get_signed(account, "/v5/execution/list", &query)
            .await?;
        let fills = result["list"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|item| {
                        Some(Fill {
                            symbol: item["symbol"].as_str()?.to_string(),
                            side: map_side(item["side"].as_str().unwrap_or_default()),
                            price: dec_field(item, "execPrice"),
                            amount: dec_field(item, "execQty"),
                            timestamp: item["execTime"]
                                .as_str()
                                .and_then(|t| t.parse().ok())
                                .unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let next = result["nextPageCursor"]
            .as_str()
            .filter(|c| !c.is_empty())
            .map(String::from);
        Ok((fills, next))
    }

    async fn place_order(
        &self,
        account: &Account,
        payload: &OrderPayload,
    ) -> Result<String, ExchangeError> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": payload.symbol,
            "side": if payload.side == OrderSide::Buy { "Buy" } else { "Sell" },
            "orderType": if payload.order_type == OrderType::Market { "Market" } else { "Limit" },
            "qty": decimal_str(payload.amount),
            "timeInForce": "GTC",
            "reduceOnly": payload.reduce_only,
            "positionIdx": payload.position_idx,
        });
        if let Some(price) = payload.price {
            body["price"] = json!(decimal_str(price));
        }
        if let Some(stop_loss) = payload.stop_loss {
            body["stopLoss"] = json!(decimal_str(stop_loss));
            body["tpslMode"] = json!("Full");
        }
        if let Some(take_profit) = payload.take_profit {
            body["takeProfit"] = json!(decimal_str(take_profit));
            body["tpslMode"] = json!("Full");
        }
        if let Some(broker) = &self.endpoints.broker_id {
            body["orderLinkId"] = json!(format!("{}{}", broker, now_millis()));
        }
        let result = self.post_signed(account, "/v5/order/create", &body).await?;
        result["orderId"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ExchangeError::Parse("missing orderId in create response".to_string()))
    }

    async fn amend_order(
        &self,
        account: &Account,
        payload: &AmendPayload,
    ) -> Result<(), ExchangeError> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": payload.symbol,
            "orderId": payload.order_id,
        });
        if let Some(price) = payload.price {
            body["price"] = json!(decimal_str(price));
        }
        if let Some(amount) = payload.amount {
            body["qty"] = json!(decimal_str(amount));
        }
        self.post_signed(account, "/v5/order/amend", &body).await?;
        Ok(())
    }

    async fn cancel_order(
        &self,
        account: &Account,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": order_id,
        });
        self.post_signed(account, "/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn set_leverage(
        &self,
        account: &Account,
        symbol: &str,
        leverage: Decimal,
    ) -> Result<(), ExchangeError> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": decimal_str(leverage),
            "sellLeverage": decimal_str(leverage),
        });
        match self
            .post_signed(account, "/v5/position/set-leverage", &body)
            .await
        {
            Ok(_) => Ok(()),
            // 110043: leverage already at the requested value.
            Err(ExchangeError::Api(message)) if message.starts_with("110043") => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ws_public_url(&self) -> String {
        self.endpoints.ws_public_url.clone()
    }

    async fn ws_private_url(&self, _account: &Account) -> Result<String, ExchangeError> {
        Ok(self.endpoints.ws_private_url.clone())
    }

    fn public_subscriptions(&self, symbols: &[String]) -> Vec<String> {
        symbols
            .chunks(SUBSCRIPTION_BATCH)
            .map(|chunk| {
                let args: Vec<String> =
                    chunk.iter().map(|s| format!("tickers.{}", s)).collect();
                json!({ "op": "subscribe", "args": args }).to_string()
            })
            .collect()
    }

    fn kline_subscription(&self, symbol: &str, timeframe: &str, subscribe: bool) -> Option<String> {
        let op = if subscribe { "subscribe" } else { "unsubscribe" };
        Some(
            json!({
                "op": op,
                "args": [format!("kline.{}.{}", interval_of(timeframe), symbol)]
            })
            .to_string(),
        )
    }

    fn book_subscription(&self, symbol: &str, subscribe: bool) -> Option<String> {
        let op = if subscribe { "subscribe" } else { "unsubscribe" };
        Some(
            json!({
                "op": op,
                "args": [format!("orderbook.50.{}", symbol)]
            })
            .to_string(),
        )
    }

    async fn private_subscriptions(
        &self,
        account: &Account,
    ) -> Result<Vec<String>, ExchangeError> {
        let signer = self.signer(account);
        let expires = now_millis() + 10_000;
        let auth = json!({
            "op": "auth",
            "args": [signer.api_key(), expires, signer.sign_ws_auth(expires)]
        });
        let subscribe = json!({
            "op": "subscribe",
            "args": ["order", "position", "wallet"]
        });
        Ok(vec![auth.to_string(), subscribe.to_string()])
    }

    fn ping_message(&self) -> Option<String> {
        Some(json!({ "op": "ping" }).to_string())
    }

    fn parse_public(&self, raw: &str) -> Vec<PublicPush> {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Vec::new();
        };
        if value["op"].as_str() == Some("pong") || value["ret_msg"].as_str() == Some("pong") {
            return vec![PublicPush::Pong];
        }
        let Some(topic) = value["topic"].as_str() else {
            return Vec::new();
        };

        if let Some(symbol) = topic.strip_prefix("tickers.") {
            let data = &value["data"];
            if value["type"].as_str() == Some("snapshot") {
                let mut item = data.clone();
                item["symbol"] = json!(symbol);
                return map_ticker(&item).map(PublicPush::TickerSnapshot).into_iter().collect();
            }
            let fields = ticker_delta_fields(data);
            if fields.is_empty() {
                return Vec::new();
            }
            return vec![PublicPush::TickerDelta {
                symbol: symbol.to_string(),
                fields,
            }];
        }

        if let Some(rest) = topic.strip_prefix("orderbook.") {
            let Some(symbol) = rest.splitn(2, '.').nth(1) else {
                return Vec::new();
            };
            let data = &value["data"];
            let bids = parse_levels(&data["b"]);
            let asks = parse_levels(&data["a"]);
            let push = if value["type"].as_str() == Some("snapshot") {
                PublicPush::BookSnapshot {
                    symbol: symbol.to_string(),
                    bids,
                    asks,
                }
            } else {
                PublicPush::BookDelta {
                    symbol: symbol.to_string(),
                    bids,
                    asks,
                }
            };
            return vec![push];
        }

        if let Some(rest) = topic.strip_prefix("kline.") {
            let mut parts = rest.splitn(2, '.');
            let (Some(interval), Some(symbol)) = (parts.next(), parts.next()) else {
                return Vec::new();
            };
            return value["data"]
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .map(|row| PublicPush::Candle {
                            symbol: symbol.to_string(),
                            timeframe: timeframe_of(interval),
                            candle: Candle {
                                timestamp: row["start"].as_i64().unwrap_or(0),
                                open: dec_field(row, "open"),
                                high: dec_field(row, "high"),
                                low: dec_field(row, "low"),
                                close: dec_field(row, "close"),
                                volume: dec_field(row, "volume"),
                            },
                        })
                        .collect()
                })
                .unwrap_or_default();
        }

        Vec::new()
    }

    fn parse_private(&self, raw: &str) -> Vec<PrivatePush> {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Vec::new();
        };
        let Some(topic) = value["topic"].as_str() else {
            return Vec::new();
        };
        let data = value["data"].as_array().cloned().unwrap_or_default();

        match topic {
            "order" => data
                .iter()
                .filter_map(|item| {
                    Some(PrivatePush::Order(OrderPush {
                        id: item["orderId"].as_str()?.to_string(),
                        symbol: item["symbol"].as_str().unwrap_or_default().to_string(),
                        status: map_order_status(item["orderStatus"].as_str().unwrap_or_default()),
                        side: map_side(item["side"].as_str().unwrap_or_default()),
                        order_type: map_order_type(item),
                        price: dec_field(item, "price"),
                        amount: dec_field(item, "qty"),
                        executed: dec_field(item, "cumExecQty"),
                        reduce_only: item["reduceOnly"].as_bool().unwrap_or(false),
                        timestamp: item["updatedTime"]
                            .as_str()
                            .and_then(|t| t.parse().ok())
                            .unwrap_or(0),
                        stop_loss: item["stopLoss"]
                            .as_str()
                            .filter(|s| !s.is_empty())
                            .map(math::parse_or_zero),
                        take_profit: item["takeProfit"]
                            .as_str()
                            .filter(|s| !s.is_empty())
                            .map(math::parse_or_zero),
                    }))
                })
                .collect(),
            "position" => data
                .iter()
                .filter_map(|item| {
                    let symbol = item["symbol"].as_str()?.to_string();
                    Some(PrivatePush::Position(PositionPush {
                        symbol,
                        side: if item["side"].as_str() == Some("Sell") {
                            PositionSide::Short
                        } else {
                            PositionSide::Long
                        },
                        contracts: dec_field(item, "size"),
                        entry_price: dec_field(item, "entryPrice"),
                        notional: dec_field(item, "positionValue"),
                        leverage: dec_field(item, "leverage"),
                        upnl: dec_field(item, "unrealisedPnl"),
                        rpnl: dec_field(item, "cumRealisedPnl"),
                        liquidation_price: dec_field(item, "liqPrice"),
                        is_hedged: item["positionIdx"].as_i64().unwrap_or(0) != 0,
                    }))
                })
                .collect(),
            "wallet" => data
                .first()
                .map(|row| {
                    vec![PrivatePush::Balance(Balance {
                        total: dec_field(row, "totalEquity"),
                        upnl: dec_field(row, "totalPerpUPL"),
                        used: dec_field(row, "totalInitialMargin"),
                        free: dec_field(row, "totalAvailableBalance"),
                    })]
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter() -> Bybit {
        Bybit::new(
            VenueEndpoints {
                public_api_url: "https://api.bybit.com".to_string(),
                private_api_url: "https://api.bybit.com".to_string(),
                ws_public_url: "wss://stream.bybit.com/v5/public/linear".to_string(),
                ws_private_url: "wss://stream.bybit.com/v5/private".to_string(),
                broker_id: None,
            },
            1,
        )
    }

    #[test]
    fn test_ticker_snapshot_parsing() {
        let raw = json!({
            "topic": "tickers.BTCUSDT",
            "type": "snapshot",
            "data": {
                "symbol": "BTCUSDT",
                "bid1Price": "100.5",
                "ask1Price": "100.6",
                "lastPrice": "100.55",
                "price24hPcnt": "0.0123",
                "volume24h": "5000"
            }
        })
        .to_string();
        let pushes = adapter().parse_public(&raw);
        assert_eq!(pushes.len(), 1);
        match &pushes[0] {
            PublicPush::TickerSnapshot(ticker) => {
                assert_eq!(ticker.bid, dec!(100.5));
                assert_eq!(ticker.clean_symbol, "BTC");
                assert_eq!(ticker.percentage, dec!(1.23));
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_ticker_delta_keeps_only_present_fields() {
        let raw = json!({
            "topic": "tickers.BTCUSDT",
            "type": "delta",
            "data": { "symbol": "BTCUSDT", "bid1Price": "99.9" }
        })
        .to_string();
        let pushes = adapter().parse_public(&raw);
        match &pushes[0] {
            PublicPush::TickerDelta { symbol, fields } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(fields.len(), 1);
                assert_eq!(fields["bid"], json!("99.9"));
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_order_status_mapping() {
        assert_eq!(map_order_status("New"), RawOrderStatus::New);
        assert_eq!(map_order_status("Untriggered"), RawOrderStatus::New);
        assert_eq!(map_order_status("PartiallyFilled"), RawOrderStatus::PartiallyFilled);
        assert_eq!(map_order_status("Filled"), RawOrderStatus::Filled);
        assert_eq!(map_order_status("Cancelled"), RawOrderStatus::Canceled);
        assert_eq!(map_order_status("Deactivated"), RawOrderStatus::Expired);
    }

    #[test]
    fn test_private_order_parsing() {
        let raw = json!({
            "topic": "order",
            "data": [{
                "orderId": "o-1",
                "symbol": "BTCUSDT",
                "orderStatus": "PartiallyFilled",
                "side": "Buy",
                "orderType": "Limit",
                "price": "100",
                "qty": "2",
                "cumExecQty": "0.5",
                "reduceOnly": false,
                "updatedTime": "1700000000000"
            }]
        })
        .to_string();
        let pushes = adapter().parse_private(&raw);
        assert_eq!(pushes.len(), 1);
        match &pushes[0] {
            PrivatePush::Order(order) => {
                assert_eq!(order.status, RawOrderStatus::PartiallyFilled);
                assert_eq!(order.executed, dec!(0.5));
                assert_eq!(order.timestamp, 1700000000000);
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_subscription_batching() {
        let symbols: Vec<String> = (0..25).map(|i| format!("SYM{}USDT", i)).collect();
        let messages = adapter().public_subscriptions(&symbols);
        assert_eq!(messages.len(), 3);
        let first: Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(first["args"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn test_position_mode_mismatch_detection() {
        let rejected = json!({ "retCode": 110025, "retMsg": "position mode not modified" });
        assert!(matches!(
            check_ret(rejected),
            Err(ExchangeError::PositionModeMismatch(_))
        ));
        let ok = json!({ "retCode": 0, "retMsg": "OK", "result": { "orderId": "1" } });
        assert_eq!(check_ret(ok).unwrap()["orderId"], "1");
    }

    #[test]
    fn test_book_delta_parsing() {
        let raw = json!({
            "topic": "orderbook.50.BTCUSDT",
            "type": "delta",
            "data": {
                "s": "BTCUSDT",
                "b": [["100", "1.5"], ["99", "0"]],
                "a": [["101", "2"]]
            }
        })
        .to_string();
        let pushes = adapter().parse_public(&raw);
        match &pushes[0] {
            PublicPush::BookDelta { bids, asks, .. } => {
                assert_eq!(bids.len(), 2);
                assert_eq!(bids[1], (dec!(99), Decimal::ZERO));
                assert_eq!(asks.len(), 1);
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }
}
