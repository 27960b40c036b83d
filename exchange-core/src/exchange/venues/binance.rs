// exchange/venues/binance.rs
// ====
// Binance USDT-margined futures adapter
// ====

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

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
    ExchangeAdapter, OrderPayload, OrderPush, PositionPush, PrivatePush, PublicPush,
    RawOrderStatus,
};

use super::{clean_symbol, with_retries};

const RECV_WINDOW: u64 = 5000;
const SUBSCRIPTION_BATCH: usize = 30;
const LISTEN_KEY_REFRESH: Duration = Duration::from_secs(30 * 60);

pub struct Binance {
    endpoints: VenueEndpoints,
    client: Client,
    retries: u32,
    signers: DashMap<String, Arc<HmacSigner>>,
}

impl Binance {
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
            let mut url = format!("{}{}", self.endpoints.public_api_url, path);
            if !query.is_empty() {
                url = format!("{}?{}", url, query);
            }
            let value: Value = self.client.get(&url).send().await?.json().await?;
            check_error(value)
        })
        .await
    }

    /// Signed request: `&timestamp=...&recvWindow=...&signature=...` is
    /// appended to the caller's query string. The signature itself comes
    /// from the per-account cache.
    async fn request_signed(
        &self,
        method: reqwest::Method,
        account: &Account,
        path: &str,
        query: &str,
    ) -> Result<Value, ExchangeError> {
        with_retries(self.retries, || async {
            let signer = self.signer(account);
            let mut canonical = query.to_string();
            if !canonical.is_empty() {
                canonical.push('&');
            }
            canonical.push_str(&format!(
                "timestamp={}&recvWindow={}",
                now_millis(),
                RECV_WINDOW
            ));
            let signature = signer.sign_query(&canonical);
            let url = format!(
                "{}{}?{}&signature={}",
                self.endpoints.private_api_url, path, canonical, signature
            );
            let value: Value = self
                .client
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", signer.api_key())
                .send()
                .await?
                .json()
                .await?;
            check_error(value)
        })
        .await
    }

    /// Listen-key endpoints are keyed, not signed.
    async fn request_keyed(
        &self,
        method: reqwest::Method,
        account: &Account,
        path: &str,
    ) -> Result<Value, ExchangeError> {
        with_retries(self.retries, || async {
            let url = format!("{}{}", self.endpoints.private_api_url, path);
            let value: Value = self
                .client
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", account.api_key.as_str())
                .send()
                .await?
                .json()
                .await?;
            check_error(value)
        })
        .await
    }
}

fn check_error(value: Value) -> Result<Value, ExchangeError> {
    if let (Some(code), Some(message)) = (value["code"].as_i64(), value["msg"].as_str()) {
        if code < 0 {
            let text = format!("{}: {}", code, message);
            // -4061: order's position side does not match account setting.
            if code == -4061 {
                return Err(ExchangeError::PositionModeMismatch(text));
            }
            return Err(ExchangeError::Api(text));
        }
    }
    Ok(value)
}

fn dec_field(value: &Value, key: &str) -> Decimal {
    match &value[key] {
        Value::String(s) => math::parse_or_zero(s),
        Value::Number(n) => n.as_f64().map(math::from_f64).unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

fn order_id_of(value: &Value) -> Option<String> {
    match &value["orderId"] {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn filter_of<'a>(item: &'a Value, filter_type: &str) -> Option<&'a Value> {
    item["filters"]
        .as_array()?
        .iter()
        .find(|f| f["filterType"].as_str() == Some(filter_type))
}

fn map_market(item: &Value) -> Option<Market> {
    let symbol = item["symbol"].as_str()?.to_string();
    let lot = filter_of(item, "LOT_SIZE");
    let market_lot = filter_of(item, "MARKET_LOT_SIZE");
    let price_filter = filter_of(item, "PRICE_FILTER");
    Some(Market {
        id: symbol.clone(),
        exchange: ExchangeId::Binance,
        symbol: symbol.clone(),
        base: item["baseAsset"].as_str().unwrap_or_default().to_string(),
        quote: item["quoteAsset"].as_str().unwrap_or_default().to_string(),
        active: item["status"].as_str() == Some("TRADING"),
        precision: exchange_common::types::MarketPrecision {
            amount: lot.map(|f| dec_field(f, "stepSize")).unwrap_or_default(),
            price: price_filter
                .map(|f| dec_field(f, "tickSize"))
                .unwrap_or_default(),
        },
        limits: exchange_common::types::MarketLimits {
            amount: exchange_common::types::AmountLimits {
                min: lot.map(|f| dec_field(f, "minQty")).unwrap_or_default(),
                max: lot.map(|f| dec_field(f, "maxQty")).unwrap_or_default(),
                max_market: market_lot
                    .map(|f| dec_field(f, "maxQty"))
                    .unwrap_or_default(),
            },
            // The exchange info payload carries no leverage bracket data.
            leverage: exchange_common::types::LeverageLimits {
                min: Decimal::ONE,
                max: Decimal::from(125),
            },
        },
    })
}

fn map_order_status(status: &str) -> RawOrderStatus {
    match status {
        "PARTIALLY_FILLED" => RawOrderStatus::PartiallyFilled,
        "FILLED" => RawOrderStatus::Filled,
        "CANCELED" => RawOrderStatus::Canceled,
        "REJECTED" => RawOrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => RawOrderStatus::Expired,
        _ => RawOrderStatus::New,
    }
}

fn map_order_type(raw: &str) -> OrderType {
    match raw {
        "MARKET" => OrderType::Market,
        "STOP" | "STOP_MARKET" => OrderType::StopLoss,
        "TAKE_PROFIT" | "TAKE_PROFIT_MARKET" => OrderType::TakeProfit,
        _ => OrderType::Limit,
    }
}

fn map_side(raw: &str) -> OrderSide {
    if raw == "SELL" {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

fn position_side_of(item: &Value, amount: Decimal) -> (PositionSide, bool) {
    match item["positionSide"].as_str() {
        Some("LONG") => (PositionSide::Long, true),
        Some("SHORT") => (PositionSide::Short, true),
        _ => (
            if amount < Decimal::ZERO {
                PositionSide::Short
            } else {
                PositionSide::Long
            },
            false,
        ),
    }
}

#[async_trait]
impl ExchangeAdapter for Binance {
    fn id(&self) -> ExchangeId {
        ExchangeId::Binance
    }

    fn rate_per_second(&self) -> f64 {
        10.0
    }

    async fn fetch_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        let value = self.get_public("/fapi/v1/exchangeInfo", "").await?;
        Ok(value["symbols"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter(|item| item["contractType"].as_str() == Some("PERPETUAL"))
                    .filter_map(map_market)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        let day = self.get_public("/fapi/v1/ticker/24hr", "").await?;
        let book = self.get_public("/fapi/v1/ticker/bookTicker", "").await?;
        let premium = self.get_public("/fapi/v1/premiumIndex", "").await?;

        let mut by_symbol: HashMap<String, Ticker> = HashMap::new();
        for item in day.as_array().into_iter().flatten() {
            let Some(symbol) = item["symbol"].as_str() else {
                continue;
            };
            by_symbol.insert(
                symbol.to_string(),
                Ticker {
                    id: symbol.to_string(),
                    symbol: symbol.to_string(),
                    exchange: Some(ExchangeId::Binance),
                    clean_symbol: clean_symbol(symbol, "USDT"),
                    last: dec_field(item, "lastPrice"),
                    percentage: dec_field(item, "priceChangePercent"),
                    volume: dec_field(item, "volume"),
                    quote_volume: dec_field(item, "quoteVolume"),
                    ..Ticker::default()
                },
            );
        }
        for item in book.as_array().into_iter().flatten() {
            if let Some(ticker) = item["symbol"]
                .as_str()
                .and_then(|s| by_symbol.get_mut(s))
            {
                ticker.bid = dec_field(item, "bidPrice");
                ticker.ask = dec_field(item, "askPrice");
            }
        }
        for item in premium.as_array().into_iter().flatten() {
            if let Some(ticker) = item["symbol"]
                .as_str()
                .and_then(|s| by_symbol.get_mut(s))
            {
                ticker.mark = dec_field(item, "markPrice");
                ticker.index = dec_field(item, "indexPrice");
                ticker.funding_rate = dec_field(item, "lastFundingRate");
            }
        }
        Ok(by_symbol.into_values().collect())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let value = self
            .get_public(
                "/fapi/v1/klines",
                &format!("symbol={}&interval={}&limit={}", symbol, timeframe, limit),
            )
            .await?;
        Ok(value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let row = row.as_array()?;
                        Some(Candle {
                            timestamp: row.first()?.as_i64()?,
                            open: math::parse_or_zero(row.get(1)?.as_str()?),
                            high: math::parse_or_zero(row.get(2)?.as_str()?),
                            low: math::parse_or_zero(row.get(3)?.as_str()?),
                            close: math::parse_or_zero(row.get(4)?.as_str()?),
                            volume: math::parse_or_zero(row.get(5)?.as_str()?),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_balance(&self, account: &Account) -> Result<Balance, ExchangeError> {
        let value = self
            .request_signed(reqwest::Method::GET, account, "/fapi/v2/account", "")
            .await?;
        Ok(Balance {
            total: dec_field(&value, "totalMarginBalance"),
            upnl: dec_field(&value, "totalUnrealizedProfit"),
            used: dec_field(&value, "totalInitialMargin"),
            free: dec_field(&value, "availableBalance"),
        })
    }

    async fn fetch_positions(&self, account: &Account) -> Result<Vec<Position>, ExchangeError> {
        let value = self
            .request_signed(reqwest::Method::GET, account, "/fapi/v2/positionRisk", "")
            .await?;
        Ok(value
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|item| {
                        let signed_amount = dec_field(item, "positionAmt");
                        if signed_amount.is_zero() {
                            return None;
                        }
                        let (side, is_hedged) = position_side_of(item, signed_amount);
                        Some(Position {
                            account_id: account.id.clone(),
                            exchange: ExchangeId::Binance,
                            symbol: item["symbol"].as_str()?.to_string(),
                            side,
                            entry_price: dec_field(item, "entryPrice"),
                            notional: dec_field(item, "notional").abs(),
                            leverage: dec_field(item, "leverage"),
                            upnl: dec_field(item, "unRealizedProfit"),
                            rpnl: Decimal::ZERO,
                            contracts: signed_amount.abs(),
                            liquidation_price: dec_field(item, "liquidationPrice"),
                            is_hedged,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_open_orders(&self, account: &Account) -> Result<Vec<Order>, ExchangeError> {
        let value = self
            .request_signed(reqwest::Method::GET, account, "/fapi/v1/openOrders", "")
            .await?;
        Ok(value
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|item| {
                        let amount = dec_field(item, "origQty");
                        let filled = dec_field(item, "executedQty");
                        Some(Order {
                            id: order_id_of(item)?,
                            exchange: ExchangeId::Binance,
                            account_id: account.id.clone(),
                            status: OrderStatus::Open,
                            symbol: item["symbol"].as_str()?.to_string(),
                            order_type: map_order_type(item["type"].as_str().unwrap_or_default()),
                            side: map_side(item["side"].as_str().unwrap_or_default()),
                            price: dec_field(item, "price"),
                            amount,
                            filled,
                            remaining: math::subtract(amount, filled).max(Decimal::ZERO),
                            reduce_only: item["reduceOnly"].as_bool().unwrap_or(false),
                            timestamp: item["time"].as_i64().unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_fills_page(
        &self,
        account: &Account,
        _cursor: Option<String>,
        page_size: u32,
    ) -> Result<(Vec<Fill>, Option<String>), ExchangeError> {
        let value = self
            .request_signed(
                reqwest::Method::GET,
                account,
                "/fapi/v1/userTrades",
                &format!("limit={}", page_size.min(1000)),
            )
            .await?;
        let mut fills: Vec<Fill> = value
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|item| {
                        Some(Fill {
                            symbol: item["symbol"].as_str()?.to_string(),
                            side: map_side(item["side"].as_str().unwrap_or_default()),
                            price: dec_field(item, "price"),
                            amount: dec_field(item, "qty"),
                            timestamp: item["time"].as_i64().unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        // The venue returns ascending; the history view wants newest first.
        fills.reverse();
        Ok((fills, None))
    }

    async fn place_order(
        &self,
        account: &Account,
        payload: &OrderPayload,
    ) -> Result<String, ExchangeError> {
        let mut query = format!(
            "symbol={}&side={}",
            payload.symbol,
            if payload.side == OrderSide::Buy { "BUY" } else { "SELL" }
        );
        match payload.order_type {
            OrderType::Market => query.push_str("&type=MARKET"),
            OrderType::Limit => {
                let price = payload.price.unwrap_or_default().normalize();
                query.push_str(&format!("&type=LIMIT&timeInForce=GTC&price={}", price));
            }
            OrderType::StopLoss => {
                let stop = payload.price.unwrap_or_default().normalize();
                query.push_str(&format!("&type=STOP_MARKET&stopPrice={}", stop));
            }
            OrderType::TakeProfit => {
                let stop = payload.price.unwrap_or_default().normalize();
                query.push_str(&format!("&type=TAKE_PROFIT_MARKET&stopPrice={}", stop));
            }
        }
        query.push_str(&format!("&quantity={}", payload.amount.normalize()));
        match payload.position_idx {
            // Hedge mode forbids the reduceOnly flag; the side carries it.
            1 => query.push_str("&positionSide=LONG"),
            2 => query.push_str("&positionSide=SHORT"),
            _ => {
                if payload.reduce_only {
                    query.push_str("&reduceOnly=true");
                }
            }
        }
        if let Some(broker) = &self.endpoints.broker_id {
            query.push_str(&format!("&newClientOrderId={}{}", broker, now_millis()));
        }
        let value = self
            .request_signed(reqwest::Method::POST, account, "/fapi/v1/order", &query)
            .await?;
        order_id_of(&value)
            .ok_or_else(|| ExchangeError::Parse("missing orderId in order response".to_string()))
    }

    async fn cancel_order(
        &self,
        account: &Account,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), ExchangeError> {
        self.request_signed(
            reqwest::Method::DELETE,
            account,
            "/fapi/v1/order",
            &format!("symbol={}&orderId={}", symbol, order_id),
        )
        .await?;
        Ok(())
    }

    async fn set_leverage(
        &self,
        account: &Account,
        symbol: &str,
        leverage: Decimal,
    ) -> Result<(), ExchangeError> {
        let leverage = leverage.trunc().normalize();
        self.request_signed(
            reqwest::Method::POST,
            account,
            "/fapi/v1/leverage",
            &format!("symbol={}&leverage={}", symbol, leverage),
        )
        .await?;
        Ok(())
    }

    fn ws_public_url(&self) -> String {
        self.endpoints.ws_public_url.clone()
    }

    async fn ws_private_url(&self, account: &Account) -> Result<String, ExchangeError> {
        let value = self
            .request_keyed(reqwest::Method::POST, account, "/fapi/v1/listenKey")
            .await?;
        let listen_key = value["listenKey"]
            .as_str()
            .ok_or_else(|| ExchangeError::Parse("missing listenKey".to_string()))?;
        Ok(format!(
            "{}/{}",
            self.endpoints.ws_private_url.trim_end_matches('/'),
            listen_key
        ))
    }

    fn public_subscriptions(&self, symbols: &[String]) -> Vec<String> {
        let params: Vec<String> = symbols
            .iter()
            .flat_map(|symbol| {
                let lower = symbol.to_lowercase();
                [
                    format!("{}@ticker", lower),
                    format!("{}@bookTicker", lower),
                    format!("{}@markPrice", lower),
                ]
            })
            .collect();
        params
            .chunks(SUBSCRIPTION_BATCH)
            .map(|chunk| {
                json!({ "method": "SUBSCRIBE", "params": chunk, "id": 1 }).to_string()
            })
            .collect()
    }

    fn kline_subscription(&self, symbol: &str, timeframe: &str, subscribe: bool) -> Option<String> {
        let method = if subscribe { "SUBSCRIBE" } else { "UNSUBSCRIBE" };
        Some(
            json!({
                "method": method,
                "params": [format!("{}@kline_{}", symbol.to_lowercase(), timeframe)],
                "id": 1
            })
            .to_string(),
        )
    }

    fn book_subscription(&self, symbol: &str, subscribe: bool) -> Option<String> {
        let method = if subscribe { "SUBSCRIBE" } else { "UNSUBSCRIBE" };
        Some(
            json!({
                "method": method,
                "params": [format!("{}@depth20@100ms", symbol.to_lowercase())],
                "id": 1
            })
            .to_string(),
        )
    }

    async fn private_subscriptions(
        &self,
        _account: &Account,
    ) -> Result<Vec<String>, ExchangeError> {
        // The listen key in the URL is the whole handshake.
        Ok(Vec::new())
    }

    fn session_refresh_interval(&self) -> Option<Duration> {
        Some(LISTEN_KEY_REFRESH)
    }

    async fn refresh_private_session(&self, account: &Account) -> Result<(), ExchangeError> {
        self.request_keyed(reqwest::Method::PUT, account, "/fapi/v1/listenKey")
            .await?;
        Ok(())
    }

    fn parse_public(&self, raw: &str) -> Vec<PublicPush> {
        let Ok(envelope) = serde_json::from_str::<Value>(raw) else {
            return Vec::new();
        };
        let data = if envelope["data"].is_object() {
            &envelope["data"]
        } else {
            &envelope
        };
        let Some(symbol) = data["s"].as_str().map(String::from) else {
            return Vec::new();
        };

        match data["e"].as_str().unwrap_or_default() {
            "24hrTicker" => {
                let mut fields = BTreeMap::new();
                fields.insert("last".to_string(), data["c"].clone());
                fields.insert("percentage".to_string(), data["P"].clone());
                fields.insert("volume".to_string(), data["v"].clone());
                fields.insert("quoteVolume".to_string(), data["q"].clone());
                vec![PublicPush::TickerDelta { symbol, fields }]
            }
            "bookTicker" => {
                let mut fields = BTreeMap::new();
                fields.insert("bid".to_string(), data["b"].clone());
                fields.insert("ask".to_string(), data["a"].clone());
                vec![PublicPush::TickerDelta { symbol, fields }]
            }
            "markPriceUpdate" => {
                let mut fields = BTreeMap::new();
                fields.insert("mark".to_string(), data["p"].clone());
                fields.insert("index".to_string(), data["i"].clone());
                fields.insert("fundingRate".to_string(), data["r"].clone());
                vec![PublicPush::TickerDelta { symbol, fields }]
            }
            "depthUpdate" => {
                // Partial depth streams replay the full top-N book.
                let levels = |key: &str| -> Vec<(Decimal, Decimal)> {
                    data[key]
                        .as_array()
                        .map(|rows| {
                            rows.iter()
                                .filter_map(|pair| {
                                    let pair = pair.as_array()?;
                                    Some((
                                        math::parse_or_zero(pair.first()?.as_str()?),
                                        math::parse_or_zero(pair.get(1)?.as_str()?),
                                    ))
                                })
                                .collect()
                        })
                        .unwrap_or_default()
                };
                vec![PublicPush::BookSnapshot {
                    symbol,
                    bids: levels("b"),
                    asks: levels("a"),
                }]
            }
            "kline" => {
                let k = &data["k"];
                vec![PublicPush::Candle {
                    symbol,
                    timeframe: k["i"].as_str().unwrap_or("1m").to_string(),
                    candle: Candle {
                        timestamp: k["t"].as_i64().unwrap_or(0),
                        open: dec_field(k, "o"),
                        high: dec_field(k, "h"),
                        low: dec_field(k, "l"),
                        close: dec_field(k, "c"),
                        volume: dec_field(k, "v"),
                    },
                }]
            }
            _ => Vec::new(),
        }
    }

    fn parse_private(&self, raw: &str) -> Vec<PrivatePush> {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Vec::new();
        };
        match value["e"].as_str().unwrap_or_default() {
            "ORDER_TRADE_UPDATE" => {
                let o = &value["o"];
                let Some(id) = order_id_of(&json!({ "orderId": o["i"] })) else {
                    return Vec::new();
                };
                let price = dec_field(o, "p");
                let last_price = dec_field(o, "L");
                vec![PrivatePush::Order(OrderPush {
                    id,
                    symbol: o["s"].as_str().unwrap_or_default().to_string(),
                    status: map_order_status(o["X"].as_str().unwrap_or_default()),
                    side: map_side(o["S"].as_str().unwrap_or_default()),
                    order_type: map_order_type(o["o"].as_str().unwrap_or_default()),
                    price: if price > Decimal::ZERO { price } else { last_price },
                    amount: dec_field(o, "q"),
                    executed: dec_field(o, "z"),
                    reduce_only: o["R"].as_bool().unwrap_or(false),
                    timestamp: value["T"].as_i64().unwrap_or(0),
                    stop_loss: None,
                    take_profit: None,
                })]
            }
            "ACCOUNT_UPDATE" => {
                let a = &value["a"];
                let mut pushes = Vec::new();
                let upnl: Decimal = a["P"]
                    .as_array()
                    .map(|positions| {
                        positions
                            .iter()
                            .map(|p| dec_field(p, "up"))
                            .fold(Decimal::ZERO, math::add)
                    })
                    .unwrap_or_default();
                if let Some(wallet) = a["B"]
                    .as_array()
                    .and_then(|balances| {
                        balances
                            .iter()
                            .find(|b| b["a"].as_str() == Some("USDT"))
                    })
                {
                    let total = dec_field(wallet, "wb");
                    let free = dec_field(wallet, "cw");
                    pushes.push(PrivatePush::Balance(Balance {
                        total,
                        upnl,
                        used: math::subtract(total, free).max(Decimal::ZERO),
                        free,
                    }));
                }
                for item in a["P"].as_array().into_iter().flatten() {
                    let Some(symbol) = item["s"].as_str() else {
                        continue;
                    };
                    let signed_amount = dec_field(item, "pa");
                    let (side, is_hedged) = position_side_of(
                        &json!({ "positionSide": item["ps"] }),
                        signed_amount,
                    );
                    pushes.push(PrivatePush::Position(PositionPush {
                        symbol: symbol.to_string(),
                        side,
                        contracts: signed_amount.abs(),
                        entry_price: dec_field(item, "ep"),
                        notional: Decimal::ZERO,
                        leverage: Decimal::ZERO,
                        upnl: dec_field(item, "up"),
                        rpnl: dec_field(item, "cr"),
                        liquidation_price: Decimal::ZERO,
                        is_hedged,
                    }));
                }
                pushes
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter() -> Binance {
        Binance::new(
            VenueEndpoints {
                public_api_url: "https://fapi.binance.com".to_string(),
                private_api_url: "https://fapi.binance.com".to_string(),
                ws_public_url: "wss://fstream.binance.com/stream".to_string(),
                ws_private_url: "wss://fstream.binance.com/ws".to_string(),
                broker_id: None,
            },
            1,
        )
    }

    #[test]
    fn test_order_trade_update_parsing() {
        let raw = json!({
            "e": "ORDER_TRADE_UPDATE",
            "T": 1700000000000i64,
            "o": {
                "i": 4242,
                "s": "BTCUSDT",
                "S": "SELL",
                "o": "LIMIT",
                "X": "FILLED",
                "p": "101.5",
                "q": "1",
                "z": "1",
                "R": true
            }
        })
        .to_string();
        let pushes = adapter().parse_private(&raw);
        match &pushes[0] {
            PrivatePush::Order(order) => {
                assert_eq!(order.id, "4242");
                assert_eq!(order.status, RawOrderStatus::Filled);
                assert_eq!(order.side, OrderSide::Sell);
                assert!(order.reduce_only);
                assert_eq!(order.executed, dec!(1));
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_account_update_yields_balance_and_positions() {
        let raw = json!({
            "e": "ACCOUNT_UPDATE",
            "a": {
                "B": [{ "a": "USDT", "wb": "1000", "cw": "900" }],
                "P": [{ "s": "BTCUSDT", "pa": "-2", "ep": "100", "up": "5", "cr": "1", "ps": "BOTH" }]
            }
        })
        .to_string();
        let pushes = adapter().parse_private(&raw);
        assert_eq!(pushes.len(), 2);
        match &pushes[0] {
            PrivatePush::Balance(balance) => {
                assert_eq!(balance.total, dec!(1000));
                assert_eq!(balance.used, dec!(100));
                assert_eq!(balance.upnl, dec!(5));
            }
            other => panic!("unexpected push: {:?}", other),
        }
        match &pushes[1] {
            PrivatePush::Position(position) => {
                assert_eq!(position.side, PositionSide::Short);
                assert_eq!(position.contracts, dec!(2));
                assert!(!position.is_hedged);
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_combined_stream_ticker_delta() {
        let raw = json!({
            "stream": "btcusdt@bookTicker",
            "data": { "e": "bookTicker", "s": "BTCUSDT", "b": "100.1", "a": "100.2" }
        })
        .to_string();
        let pushes = adapter().parse_public(&raw);
        match &pushes[0] {
            PublicPush::TickerDelta { symbol, fields } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(fields["bid"], json!("100.1"));
                assert_eq!(fields["ask"], json!("100.2"));
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_position_side_mismatch_maps_to_typed_error() {
        let rejected = json!({ "code": -4061, "msg": "Order's position side does not match" });
        assert!(matches!(
            check_error(rejected),
            Err(ExchangeError::PositionModeMismatch(_))
        ));
    }

    #[test]
    fn test_market_mapping_reads_filters() {
        let item = json!({
            "symbol": "BTCUSDT",
            "baseAsset": "BTC",
            "quoteAsset": "USDT",
            "status": "TRADING",
            "contractType": "PERPETUAL",
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.10" },
                { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000" },
                { "filterType": "MARKET_LOT_SIZE", "maxQty": "120" }
            ]
        });
        let market = map_market(&item).unwrap();
        assert_eq!(market.precision.price, dec!(0.10));
        assert_eq!(market.limits.amount.max, dec!(1000));
        assert_eq!(market.limits.amount.max_market, dec!(120));
        assert!(market.active);
    }
}
