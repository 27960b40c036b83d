// exchange/venues/hyperliquid.rs
// ====
// HyperLiquid adapter
// ====
// REST via the /info and /exchange endpoints, actions signed with the
// EIP-712 wallet. No separate private stream: account subscriptions are
// keyed by wallet address on the shared WebSocket.
// ====

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use exchange_common::math;
use exchange_common::types::{
    now_millis, Account, Balance, Candle, ExchangeId, Fill, Market, Order, OrderSide, OrderStatus,
    OrderType, Position, PositionSide, Ticker,
};

use crate::config::VenueEndpoints;
use crate::exchange::errors::ExchangeError;
use crate::exchange::traits::{
    ExchangeAdapter, OrderPayload, OrderPush, PositionPush, PrivatePush, PublicPush,
    RawOrderStatus,
};
use crate::exchange::wallet::{action_hash, Wallet};

use super::with_retries;

/// Perp prices carry at most `6 - szDecimals` decimal places.
const MAX_PRICE_DECIMALS: u32 = 6;

#[derive(Debug, Clone)]
struct AssetMeta {
    index: u32,
    sz_decimals: u32,
}

pub struct Hyperliquid {
    endpoints: VenueEndpoints,
    client: Client,
    retries: u32,
    /// Asset info cache, filled on first use.
    assets: RwLock<HashMap<String, AssetMeta>>,
    wallets: DashMap<String, Arc<Wallet>>,
}

impl Hyperliquid {
    pub fn new(endpoints: VenueEndpoints, retries: u32) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            endpoints,
            client,
            retries,
            assets: RwLock::new(HashMap::new()),
            wallets: DashMap::new(),
        }
    }

    fn is_testnet(&self) -> bool {
        self.endpoints.public_api_url.contains("testnet")
    }

    fn wallet(&self, account: &Account) -> Result<Arc<Wallet>, ExchangeError> {
        if let Some(wallet) = self.wallets.get(&account.id) {
            return Ok(wallet.clone());
        }
        let wallet = Arc::new(Wallet::from_private_key(&account.api_secret)?);
        self.wallets.insert(account.id.clone(), wallet.clone());
        Ok(wallet)
    }

    async fn info(&self, body: Value) -> Result<Value, ExchangeError> {
        with_retries(self.retries, || async {
            let url = format!("{}/info", self.endpoints.public_api_url);
            let value: Value = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await?
                .json()
                .await?;
            Ok(value)
        })
        .await
    }

    /// Signs and submits one action to /exchange.
    async fn send_action(
        &self,
        account: &Account,
        action: Value,
    ) -> Result<Value, ExchangeError> {
        let wallet = self.wallet(account)?;
        let nonce = now_millis() as u64;
        let hash = action_hash(&action, None, nonce, None)?;
        let signature = wallet.sign_action(hash, self.is_testnet())?;

        let url = format!("{}/exchange", self.endpoints.private_api_url);
        let value: Value = self
            .client
            .post(&url)
            .json(&json!({
                "action": action,
                "nonce": nonce,
                "signature": signature,
                "vaultAddress": null,
            }))
            .send()
            .await?
            .json()
            .await?;

        if value["status"].as_str() != Some("ok") {
            return Err(ExchangeError::Api(value.to_string()));
        }
        Ok(value)
    }

    async fn asset_meta(&self, symbol: &str) -> Result<AssetMeta, ExchangeError> {
        {
            let cache = self.assets.read().await;
            if let Some(meta) = cache.get(symbol) {
                return Ok(meta.clone());
            }
        }
        self.refresh_assets().await?;
        let cache = self.assets.read().await;
        cache
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn refresh_assets(&self) -> Result<(), ExchangeError> {
        let meta = self.info(json!({ "type": "meta" })).await?;
        let mut cache = self.assets.write().await;
        cache.clear();
        for (index, asset) in meta["universe"].as_array().into_iter().flatten().enumerate() {
            let Some(name) = asset["name"].as_str() else {
                continue;
            };
            cache.insert(
                name.to_string(),
                AssetMeta {
                    index: index as u32,
                    sz_decimals: asset["szDecimals"].as_u64().unwrap_or(0) as u32,
                },
            );
        }
        Ok(())
    }
}

fn dec_field(value: &Value, key: &str) -> Decimal {
    match &value[key] {
        Value::String(s) => math::parse_or_zero(s),
        Value::Number(n) => n.as_f64().map(math::from_f64).unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

fn step_of(decimals: u32) -> Decimal {
    Decimal::new(1, decimals)
}

fn decimal_str(value: Decimal) -> String {
    value.normalize().to_string()
}

fn map_side(raw: &str) -> OrderSide {
    if raw == "A" {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

fn map_order_status(raw: &str) -> RawOrderStatus {
    match raw {
        "filled" => RawOrderStatus::Filled,
        "canceled" | "marginCanceled" | "reduceOnlyCanceled" | "liquidatedCanceled" => {
            RawOrderStatus::Canceled
        }
        "rejected" => RawOrderStatus::Rejected,
        // open / triggered stay live.
        _ => RawOrderStatus::New,
    }
}

fn map_universe_market(index_asset: (usize, &Value)) -> Option<Market> {
    let (_, asset) = index_asset;
    let name = asset["name"].as_str()?.to_string();
    let sz_decimals = asset["szDecimals"].as_u64().unwrap_or(0) as u32;
    let price_decimals = MAX_PRICE_DECIMALS.saturating_sub(sz_decimals);
    Some(Market {
        id: name.clone(),
        exchange: ExchangeId::Hyperliquid,
        symbol: name.clone(),
        base: name.clone(),
        quote: "USD".to_string(),
        active: !asset["isDelisted"].as_bool().unwrap_or(false),
        precision: exchange_common::types::MarketPrecision {
            amount: step_of(sz_decimals),
            price: step_of(price_decimals),
        },
        limits: exchange_common::types::MarketLimits {
            amount: exchange_common::types::AmountLimits {
                min: step_of(sz_decimals),
                // No per-order size cap; lot splitting is a no-op here.
                max: Decimal::ZERO,
                max_market: Decimal::ZERO,
            },
            leverage: exchange_common::types::LeverageLimits {
                min: Decimal::ONE,
                max: dec_field(asset, "maxLeverage").max(Decimal::ONE),
            },
        },
    })
}

fn ticker_from_ctx(symbol: &str, ctx: &Value) -> Ticker {
    let mark = dec_field(ctx, "markPx");
    let prev = dec_field(ctx, "prevDayPx");
    let percentage = if prev > Decimal::ZERO {
        math::multiply(
            math::subtract(mark, prev) / prev,
            Decimal::ONE_HUNDRED,
        )
    } else {
        Decimal::ZERO
    };
    let impact = ctx["impactPxs"].as_array();
    let impact_px = |i: usize| {
        impact
            .and_then(|pxs| pxs.get(i))
            .and_then(Value::as_str)
            .map(math::parse_or_zero)
            .unwrap_or(Decimal::ZERO)
    };
    Ticker {
        id: symbol.to_string(),
        symbol: symbol.to_string(),
        exchange: Some(ExchangeId::Hyperliquid),
        clean_symbol: symbol.to_string(),
        bid: impact_px(0),
        ask: impact_px(1),
        last: dec_field(ctx, "midPx"),
        mark,
        index: dec_field(ctx, "oraclePx"),
        percentage,
        open_interest: dec_field(ctx, "openInterest"),
        funding_rate: dec_field(ctx, "funding"),
        volume: dec_field(ctx, "dayBaseVlm"),
        quote_volume: dec_field(ctx, "dayNtlVlm"),
    }
}

fn ctx_delta_fields(ctx: &Value) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    for (wire, ours) in [
        ("markPx", "mark"),
        ("oraclePx", "index"),
        ("midPx", "last"),
        ("funding", "fundingRate"),
        ("openInterest", "openInterest"),
        ("dayNtlVlm", "quoteVolume"),
    ] {
        if let Some(raw) = ctx.get(wire) {
            if !raw.is_null() {
                fields.insert(ours.to_string(), raw.clone());
            }
        }
    }
    if let Some(impact) = ctx["impactPxs"].as_array() {
        if let Some(bid) = impact.first() {
            fields.insert("bid".to_string(), bid.clone());
        }
        if let Some(ask) = impact.get(1) {
            fields.insert("ask".to_string(), ask.clone());
        }
    }
    fields
}

fn map_position(item: &Value, account_id: &str) -> Option<Position> {
    let position = &item["position"];
    let signed_size = dec_field(position, "szi");
    if signed_size.is_zero() {
        return None;
    }
    Some(Position {
        account_id: account_id.to_string(),
        exchange: ExchangeId::Hyperliquid,
        symbol: position["coin"].as_str()?.to_string(),
        side: if signed_size < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Long
        },
        entry_price: dec_field(position, "entryPx"),
        notional: dec_field(position, "positionValue"),
        leverage: dec_field(&position["leverage"], "value"),
        upnl: dec_field(position, "unrealizedPnl"),
        rpnl: Decimal::ZERO,
        contracts: signed_size.abs(),
        liquidation_price: dec_field(position, "liquidationPx"),
        // One-way only; hedge mode does not exist on this venue.
        is_hedged: false,
    })
}

fn balance_from_state(state: &Value) -> Balance {
    let summary = &state["marginSummary"];
    let upnl = state["assetPositions"]
        .as_array()
        .map(|positions| {
            positions
                .iter()
                .map(|p| dec_field(&p["position"], "unrealizedPnl"))
                .fold(Decimal::ZERO, math::add)
        })
        .unwrap_or_default();
    Balance {
        total: dec_field(summary, "accountValue"),
        upnl,
        used: dec_field(summary, "totalMarginUsed"),
        free: dec_field(state, "withdrawable"),
    }
}

fn order_wire_type(payload: &OrderPayload) -> Value {
    match payload.order_type {
        OrderType::Market => json!({ "limit": { "tif": "Ioc" } }),
        OrderType::Limit => json!({ "limit": { "tif": "Gtc" } }),
        OrderType::StopLoss => json!({
            "trigger": {
                "isMarket": true,
                "triggerPx": decimal_str(payload.price.unwrap_or_default()),
                "tpsl": "sl"
            }
        }),
        OrderType::TakeProfit => json!({
            "trigger": {
                "isMarket": true,
                "triggerPx": decimal_str(payload.price.unwrap_or_default()),
                "tpsl": "tp"
            }
        }),
    }
}

#[async_trait]
impl ExchangeAdapter for Hyperliquid {
    fn id(&self) -> ExchangeId {
        ExchangeId::Hyperliquid
    }

    fn rate_per_second(&self) -> f64 {
        10.0
    }

    async fn fetch_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        let meta = self.info(json!({ "type": "meta" })).await?;
        let markets: Vec<Market> = meta["universe"]
            .as_array()
            .map(|universe| {
                universe
                    .iter()
                    .enumerate()
                    .filter_map(map_universe_market)
                    .collect()
            })
            .unwrap_or_default();

        // Refresh the asset index cache from the same payload.
        let mut cache = self.assets.write().await;
        cache.clear();
        for (index, asset) in meta["universe"].as_array().into_iter().flatten().enumerate() {
            if let Some(name) = asset["name"].as_str() {
                cache.insert(
                    name.to_string(),
                    AssetMeta {
                        index: index as u32,
                        sz_decimals: asset["szDecimals"].as_u64().unwrap_or(0) as u32,
                    },
                );
            }
        }
        Ok(markets)
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        let value = self.info(json!({ "type": "metaAndAssetCtxs" })).await?;
        let universe = value[0]["universe"].as_array().cloned().unwrap_or_default();
        let ctxs = value[1].as_array().cloned().unwrap_or_default();
        Ok(universe
            .iter()
            .zip(ctxs.iter())
            .filter_map(|(asset, ctx)| {
                let name = asset["name"].as_str()?;
                Some(ticker_from_ctx(name, ctx))
            })
            .collect())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let interval_ms: i64 = match timeframe {
            "1m" => 60_000,
            "5m" => 300_000,
            "15m" => 900_000,
            "30m" => 1_800_000,
            "1h" => 3_600_000,
            "4h" => 14_400_000,
            "1d" => 86_400_000,
            _ => 60_000,
        };
        let end = now_millis();
        let start = end - interval_ms * i64::from(limit);
        let value = self
            .info(json!({
                "type": "candleSnapshot",
                "req": { "coin": symbol, "interval": timeframe, "startTime": start, "endTime": end }
            }))
            .await?;
        let mut candles: Vec<Candle> = value
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| Candle {
                        timestamp: row["t"].as_i64().unwrap_or(0),
                        open: dec_field(row, "o"),
                        high: dec_field(row, "h"),
                        low: dec_field(row, "l"),
                        close: dec_field(row, "c"),
                        volume: dec_field(row, "v"),
                    })
                    .collect()
            })
            .unwrap_or_default();
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn fetch_balance(&self, account: &Account) -> Result<Balance, ExchangeError> {
        let wallet = self.wallet(account)?;
        let state = self
            .info(json!({ "type": "clearinghouseState", "user": wallet.address }))
            .await?;
        Ok(balance_from_state(&state))
    }

    async fn fetch_positions(&self, account: &Account) -> Result<Vec<Position>, ExchangeError> {
        let wallet = self.wallet(account)?;
        let state = self
            .info(json!({ "type": "clearinghouseState", "user": wallet.address }))
            .await?;
        Ok(state["assetPositions"]
            .as_array()
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|item| map_position(item, &account.id))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_open_orders(&self, account: &Account) -> Result<Vec<Order>, ExchangeError> {
        let wallet = self.wallet(account)?;
        let value = self
            .info(json!({ "type": "frontendOpenOrders", "user": wallet.address }))
            .await?;
        Ok(value
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|item| {
                        let amount = dec_field(item, "origSz");
                        let remaining = dec_field(item, "sz");
                        let filled = math::subtract(amount, remaining).max(Decimal::ZERO);
                        Some(Order {
                            id: item["oid"].as_u64()?.to_string(),
                            exchange: ExchangeId::Hyperliquid,
                            account_id: account.id.clone(),
                            status: OrderStatus::Open,
                            symbol: item["coin"].as_str()?.to_string(),
                            order_type: match item["orderType"].as_str().unwrap_or("Limit") {
                                "Stop Market" | "Stop Limit" => OrderType::StopLoss,
                                "Take Profit Market" | "Take Profit Limit" => {
                                    OrderType::TakeProfit
                                }
                                "Market" => OrderType::Market,
                                _ => OrderType::Limit,
                            },
                            side: map_side(item["side"].as_str().unwrap_or("B")),
                            price: dec_field(item, "limitPx"),
                            amount,
                            filled,
                            remaining,
                            reduce_only: item["reduceOnly"].as_bool().unwrap_or(false),
                            timestamp: item["timestamp"].as_i64().unwrap_or(0),
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
        let wallet = self.wallet(account)?;
        let value = self
            .info(json!({ "type": "userFills", "user": wallet.address }))
            .await?;
        let fills: Vec<Fill> = value
            .as_array()
            .map(|list| {
                list.iter()
                    .take(page_size as usize)
                    .filter_map(|item| {
                        Some(Fill {
                            symbol: item["coin"].as_str()?.to_string(),
                            side: map_side(item["side"].as_str().unwrap_or("B")),
                            price: dec_field(item, "px"),
                            amount: dec_field(item, "sz"),
                            timestamp: item["time"].as_i64().unwrap_or(0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok((fills, None))
    }

    async fn place_order(
        &self,
        account: &Account,
        payload: &OrderPayload,
    ) -> Result<String, ExchangeError> {
        let meta = self.asset_meta(&payload.symbol).await?;
        let size = math::adjust_down(payload.amount, step_of(meta.sz_decimals));
        let price = match payload.order_type {
            OrderType::Market => Decimal::ZERO,
            _ => payload.price.unwrap_or_default(),
        };
        let action = json!({
            "type": "order",
            "orders": [{
                "a": meta.index,
                "b": payload.side == OrderSide::Buy,
                "p": decimal_str(price),
                "s": decimal_str(size),
                "r": payload.reduce_only,
                "t": order_wire_type(payload),
            }],
            "grouping": "na"
        });
        let response = self.send_action(account, action).await?;
        let status = &response["response"]["data"]["statuses"][0];
        if let Some(error) = status["error"].as_str() {
            return Err(ExchangeError::Api(error.to_string()));
        }
        let oid = status["resting"]["oid"]
            .as_u64()
            .or_else(|| status["filled"]["oid"].as_u64())
            .ok_or_else(|| ExchangeError::Parse("missing oid in order response".to_string()))?;
        Ok(oid.to_string())
    }

    async fn cancel_order(
        &self,
        account: &Account,
        symbol: &str,
        order_id: &str,
    ) -> Result<(), ExchangeError> {
        let meta = self.asset_meta(symbol).await?;
        let oid: u64 = order_id
            .parse()
            .map_err(|_| ExchangeError::InvalidRequest(format!("bad order id '{}'", order_id)))?;
        let action = json!({
            "type": "cancel",
            "cancels": [{ "a": meta.index, "o": oid }]
        });
        self.send_action(account, action).await?;
        Ok(())
    }

    async fn set_leverage(
        &self,
        account: &Account,
        symbol: &str,
        leverage: Decimal,
    ) -> Result<(), ExchangeError> {
        let meta = self.asset_meta(symbol).await?;
        let action = json!({
            "type": "updateLeverage",
            "asset": meta.index,
            "isCross": true,
            "leverage": leverage.trunc().to_u64().unwrap_or(1),
        });
        self.send_action(account, action).await?;
        Ok(())
    }

    fn ws_public_url(&self) -> String {
        self.endpoints.ws_public_url.clone()
    }

    async fn ws_private_url(&self, _account: &Account) -> Result<String, ExchangeError> {
        Ok(self.endpoints.ws_private_url.clone())
    }

    fn public_subscriptions(&self, symbols: &[String]) -> Vec<String> {
        symbols
            .iter()
            .map(|symbol| {
                json!({
                    "method": "subscribe",
                    "subscription": { "type": "activeAssetCtx", "coin": symbol }
                })
                .to_string()
            })
            .collect()
    }

    fn kline_subscription(&self, symbol: &str, timeframe: &str, subscribe: bool) -> Option<String> {
        let method = if subscribe { "subscribe" } else { "unsubscribe" };
        Some(
            json!({
                "method": method,
                "subscription": { "type": "candle", "coin": symbol, "interval": timeframe }
            })
            .to_string(),
        )
    }

    fn book_subscription(&self, symbol: &str, subscribe: bool) -> Option<String> {
        let method = if subscribe { "subscribe" } else { "unsubscribe" };
        Some(
            json!({
                "method": method,
                "subscription": { "type": "l2Book", "coin": symbol }
            })
            .to_string(),
        )
    }

    async fn private_subscriptions(
        &self,
        account: &Account,
    ) -> Result<Vec<String>, ExchangeError> {
        let wallet = self.wallet(account)?;
        Ok(vec![
            json!({
                "method": "subscribe",
                "subscription": { "type": "orderUpdates", "user": wallet.address }
            })
            .to_string(),
            json!({
                "method": "subscribe",
                "subscription": { "type": "webData2", "user": wallet.address }
            })
            .to_string(),
        ])
    }

    fn ping_message(&self) -> Option<String> {
        Some(json!({ "method": "ping" }).to_string())
    }

    fn parse_public(&self, raw: &str) -> Vec<PublicPush> {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return Vec::new();
        };
        match value["channel"].as_str().unwrap_or_default() {
            "pong" => vec![PublicPush::Pong],
            "activeAssetCtx" => {
                let data = &value["data"];
                let Some(symbol) = data["coin"].as_str() else {
                    return Vec::new();
                };
                let fields = ctx_delta_fields(&data["ctx"]);
                if fields.is_empty() {
                    return Vec::new();
                }
                vec![PublicPush::TickerDelta {
                    symbol: symbol.to_string(),
                    fields,
                }]
            }
            "l2Book" => {
                let data = &value["data"];
                let Some(symbol) = data["coin"].as_str() else {
                    return Vec::new();
                };
                let side = |i: usize| -> Vec<(Decimal, Decimal)> {
                    data["levels"][i]
                        .as_array()
                        .map(|levels| {
                            levels
                                .iter()
                                .map(|level| (dec_field(level, "px"), dec_field(level, "sz")))
                                .collect()
                        })
                        .unwrap_or_default()
                };
                vec![PublicPush::BookSnapshot {
                    symbol: symbol.to_string(),
                    bids: side(0),
                    asks: side(1),
                }]
            }
            "candle" => {
                let data = &value["data"];
                let Some(symbol) = data["s"].as_str() else {
                    return Vec::new();
                };
                vec![PublicPush::Candle {
                    symbol: symbol.to_string(),
                    timeframe: data["i"].as_str().unwrap_or("1m").to_string(),
                    candle: Candle {
                        timestamp: data["t"].as_i64().unwrap_or(0),
                        open: dec_field(data, "o"),
                        high: dec_field(data, "h"),
                        low: dec_field(data, "l"),
                        close: dec_field(data, "c"),
                        volume: dec_field(data, "v"),
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
        match value["channel"].as_str().unwrap_or_default() {
            "orderUpdates" => value["data"]
                .as_array()
                .map(|updates| {
                    updates
                        .iter()
                        .filter_map(|update| {
                            let order = &update["order"];
                            let amount = dec_field(order, "origSz");
                            let remaining = dec_field(order, "sz");
                            Some(PrivatePush::Order(OrderPush {
                                id: order["oid"].as_u64()?.to_string(),
                                symbol: order["coin"].as_str().unwrap_or_default().to_string(),
                                status: map_order_status(
                                    update["status"].as_str().unwrap_or_default(),
                                ),
                                side: map_side(order["side"].as_str().unwrap_or("B")),
                                order_type: OrderType::Limit,
                                price: dec_field(order, "limitPx"),
                                amount,
                                executed: math::subtract(amount, remaining).max(Decimal::ZERO),
                                reduce_only: order["reduceOnly"].as_bool().unwrap_or(false),
                                timestamp: update["statusTimestamp"].as_i64().unwrap_or(0),
                                stop_loss: None,
                                take_profit: None,
                            }))
                        })
                        .collect()
                })
                .unwrap_or_default(),
            "webData2" => {
                let state = &value["data"]["clearinghouseState"];
                if !state.is_object() {
                    return Vec::new();
                }
                let mut pushes = vec![PrivatePush::Balance(balance_from_state(state))];
                for item in state["assetPositions"].as_array().into_iter().flatten() {
                    let position = &item["position"];
                    let signed_size = dec_field(position, "szi");
                    let Some(symbol) = position["coin"].as_str() else {
                        continue;
                    };
                    pushes.push(PrivatePush::Position(PositionPush {
                        symbol: symbol.to_string(),
                        side: if signed_size < Decimal::ZERO {
                            PositionSide::Short
                        } else {
                            PositionSide::Long
                        },
                        contracts: signed_size.abs(),
                        entry_price: dec_field(position, "entryPx"),
                        notional: dec_field(position, "positionValue"),
                        leverage: dec_field(&position["leverage"], "value"),
                        upnl: dec_field(position, "unrealizedPnl"),
                        rpnl: Decimal::ZERO,
                        liquidation_price: dec_field(position, "liquidationPx"),
                        is_hedged: false,
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

    fn adapter() -> Hyperliquid {
        Hyperliquid::new(
            VenueEndpoints {
                public_api_url: "https://api.hyperliquid.xyz".to_string(),
                private_api_url: "https://api.hyperliquid.xyz".to_string(),
                ws_public_url: "wss://api.hyperliquid.xyz/ws".to_string(),
                ws_private_url: "wss://api.hyperliquid.xyz/ws".to_string(),
                broker_id: None,
            },
            1,
        )
    }

    #[test]
    fn test_l2_book_snapshot_parsing() {
        let raw = json!({
            "channel": "l2Book",
            "data": {
                "coin": "BTC",
                "levels": [
                    [{ "px": "100", "sz": "1", "n": 2 }, { "px": "99", "sz": "2", "n": 1 }],
                    [{ "px": "101", "sz": "1", "n": 1 }]
                ],
                "time": 1
            }
        })
        .to_string();
        let pushes = adapter().parse_public(&raw);
        match &pushes[0] {
            PublicPush::BookSnapshot { symbol, bids, asks } => {
                assert_eq!(symbol, "BTC");
                assert_eq!(bids.len(), 2);
                assert_eq!(bids[0], (dec!(100), dec!(1)));
                assert_eq!(asks.len(), 1);
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_order_update_executed_is_orig_minus_remaining() {
        let raw = json!({
            "channel": "orderUpdates",
            "data": [{
                "order": { "oid": 77, "coin": "ETH", "side": "A", "limitPx": "2000", "sz": "0.5", "origSz": "2" },
                "status": "open",
                "statusTimestamp": 5
            }]
        })
        .to_string();
        let pushes = adapter().parse_private(&raw);
        match &pushes[0] {
            PrivatePush::Order(order) => {
                assert_eq!(order.id, "77");
                assert_eq!(order.side, OrderSide::Sell);
                assert_eq!(order.executed, dec!(1.5));
                assert_eq!(order.status, RawOrderStatus::New);
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_web_data_yields_balance_then_positions() {
        let raw = json!({
            "channel": "webData2",
            "data": {
                "clearinghouseState": {
                    "marginSummary": { "accountValue": "500", "totalMarginUsed": "50" },
                    "withdrawable": "400",
                    "assetPositions": [
                        { "position": { "coin": "BTC", "szi": "-0.5", "entryPx": "100",
                          "positionValue": "50", "unrealizedPnl": "2",
                          "leverage": { "type": "cross", "value": 5 }, "liquidationPx": "150" } }
                    ]
                }
            }
        })
        .to_string();
        let pushes = adapter().parse_private(&raw);
        assert_eq!(pushes.len(), 2);
        match &pushes[0] {
            PrivatePush::Balance(balance) => {
                assert_eq!(balance.total, dec!(500));
                assert_eq!(balance.upnl, dec!(2));
                assert_eq!(balance.free, dec!(400));
            }
            other => panic!("unexpected push: {:?}", other),
        }
        match &pushes[1] {
            PrivatePush::Position(position) => {
                assert_eq!(position.side, PositionSide::Short);
                assert_eq!(position.contracts, dec!(0.5));
                assert_eq!(position.leverage, dec!(5));
            }
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[test]
    fn test_market_precision_from_sz_decimals() {
        let asset = json!({ "name": "BTC", "szDecimals": 3, "maxLeverage": 50 });
        let market = map_universe_market((0, &asset)).unwrap();
        assert_eq!(market.precision.amount, dec!(0.001));
        assert_eq!(market.precision.price, dec!(0.001));
        assert_eq!(market.limits.leverage.max, dec!(50));
    }

    #[test]
    fn test_order_wire_type_for_protection_orders() {
        let payload = OrderPayload {
            symbol: "BTC".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::StopLoss,
            price: Some(dec!(90)),
            amount: dec!(1),
            reduce_only: true,
            position_idx: 0,
            stop_loss: None,
            take_profit: None,
        };
        let wire = order_wire_type(&payload);
        assert_eq!(wire["trigger"]["tpsl"], "sl");
        assert_eq!(wire["trigger"]["triggerPx"], "90");
    }
}
