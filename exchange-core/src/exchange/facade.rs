// exchange/facade.rs
// ====
// Exchange façade
// ====
// The outward-facing handle the orchestrator holds per venue. Every public
// method mirrors a worker capability 1:1 and resolves through the response
// bridge; the relay task mirrors worker change commands into the shared
// store and dispatches candle/book pushes to registered listeners.
// ====

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use exchange_common::book::OrderBook;
use exchange_common::store::MemoryStore;
use exchange_common::types::{
    Account, Candle, CancelRequest, ExchangeId, OrderRequest, OrderUpdateRequest,
    PositionMetadata,
};

use super::bridge::ResponseBridge;
use super::errors::ExchangeError;
use super::protocol::{WorkerEvent, WorkerRequest};
use super::traits::ExchangeAdapter;
use super::worker::{self, WorkerHandle};

pub type SharedStore = Arc<Mutex<MemoryStore>>;
pub type CandleListener = Arc<dyn Fn(Candle) + Send + Sync>;
pub type OrderBookListener = Arc<dyn Fn(OrderBook) + Send + Sync>;

/// Log/error signals relayed from workers to the orchestrator's pub/sub.
#[derive(Debug, Clone)]
pub enum FacadeSignal {
    Log {
        exchange: ExchangeId,
        message: String,
    },
    Error {
        exchange: ExchangeId,
        message: String,
    },
}

type PendingResult = Result<Value, String>;

pub struct ExchangeFacade {
    exchange: ExchangeId,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    bridge: Arc<ResponseBridge<u64, PendingResult>>,
    candle_listeners: Arc<DashMap<String, CandleListener>>,
    book_listeners: Arc<DashMap<String, OrderBookListener>>,
    relay: JoinHandle<()>,
    timeout: Duration,
}

impl ExchangeFacade {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        store: SharedStore,
        signals: mpsc::UnboundedSender<FacadeSignal>,
        timeout: Duration,
    ) -> Self {
        let exchange = adapter.id();
        let WorkerHandle { requests, events } = worker::spawn(adapter);
        let bridge = Arc::new(ResponseBridge::new());
        let candle_listeners: Arc<DashMap<String, CandleListener>> = Arc::new(DashMap::new());
        let book_listeners: Arc<DashMap<String, OrderBookListener>> = Arc::new(DashMap::new());
        let relay = tokio::spawn(relay_loop(
            exchange,
            events,
            bridge.clone(),
            store,
            signals,
            candle_listeners.clone(),
            book_listeners.clone(),
        ));
        Self {
            exchange,
            requests,
            bridge,
            candle_listeners,
            book_listeners,
            relay,
            timeout,
        }
    }

    pub fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    pub async fn start(&self) -> Result<(), ExchangeError> {
        self.call(|request_id| WorkerRequest::Start { request_id })
            .await
            .map(|_| ())
    }

    pub async fn stop(&self) -> Result<(), ExchangeError> {
        let result = self
            .call(|request_id| WorkerRequest::Stop { request_id })
            .await
            .map(|_| ());
        self.relay.abort();
        result
    }

    pub async fn add_accounts(&self, accounts: Vec<Account>) -> Result<Vec<String>, ExchangeError> {
        self.call_as(|request_id| WorkerRequest::AddAccounts {
            request_id,
            accounts,
        })
        .await
    }

    pub async fn remove_account(&self, account_id: String) -> Result<(), ExchangeError> {
        self.call(|request_id| WorkerRequest::RemoveAccount {
            request_id,
            account_id,
        })
        .await
        .map(|_| ())
    }

    pub async fn place_orders(
        &self,
        account_id: String,
        orders: Vec<OrderRequest>,
        priority: bool,
    ) -> Result<Vec<String>, ExchangeError> {
        self.call_as(|request_id| WorkerRequest::PlaceOrders {
            request_id,
            account_id,
            orders,
            priority,
        })
        .await
    }

    pub async fn update_orders(
        &self,
        account_id: String,
        updates: Vec<OrderUpdateRequest>,
        priority: bool,
    ) -> Result<Vec<String>, ExchangeError> {
        self.call_as(|request_id| WorkerRequest::UpdateOrders {
            request_id,
            account_id,
            updates,
            priority,
        })
        .await
    }

    pub async fn cancel_orders(
        &self,
        account_id: String,
        cancels: Vec<CancelRequest>,
        priority: bool,
    ) -> Result<Vec<String>, ExchangeError> {
        self.call_as(|request_id| WorkerRequest::CancelOrders {
            request_id,
            account_id,
            cancels,
            priority,
        })
        .await
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: String,
        timeframe: String,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.call_as(|request_id| WorkerRequest::FetchOhlcv {
            request_id,
            symbol,
            timeframe,
            limit,
        })
        .await
    }

    pub async fn fetch_position_metadata(
        &self,
        account_id: String,
        symbol: String,
    ) -> Result<PositionMetadata, ExchangeError> {
        self.call_as(|request_id| WorkerRequest::FetchPositionMetadata {
            request_id,
            account_id,
            symbol,
        })
        .await
    }

    pub async fn set_leverage(
        &self,
        account_id: String,
        symbol: String,
        leverage: Decimal,
    ) -> Result<bool, ExchangeError> {
        self.call_as(|request_id| WorkerRequest::SetLeverage {
            request_id,
            account_id,
            symbol,
            leverage,
        })
        .await
    }

    pub async fn listen_ohlcv(
        &self,
        symbol: String,
        timeframe: String,
        listener: CandleListener,
    ) -> Result<(), ExchangeError> {
        self.candle_listeners
            .insert(format!("{}:{}", symbol, timeframe), listener);
        self.call(|request_id| WorkerRequest::ListenOhlcv {
            request_id,
            symbol,
            timeframe,
        })
        .await
        .map(|_| ())
    }

    /// Advisory: unlistening a stream that was never listened to succeeds.
    pub async fn unlisten_ohlcv(
        &self,
        symbol: String,
        timeframe: String,
    ) -> Result<(), ExchangeError> {
        self.candle_listeners
            .remove(&format!("{}:{}", symbol, timeframe));
        self.call(|request_id| WorkerRequest::UnlistenOhlcv {
            request_id,
            symbol,
            timeframe,
        })
        .await
        .map(|_| ())
    }

    pub async fn listen_order_book(
        &self,
        symbol: String,
        listener: OrderBookListener,
    ) -> Result<(), ExchangeError> {
        self.book_listeners.insert(symbol.clone(), listener);
        self.call(|request_id| WorkerRequest::ListenOrderBook { request_id, symbol })
            .await
            .map(|_| ())
    }

    pub async fn unlisten_order_book(&self, symbol: String) -> Result<(), ExchangeError> {
        self.book_listeners.remove(&symbol);
        self.call(|request_id| WorkerRequest::UnlistenOrderBook { request_id, symbol })
            .await
            .map(|_| ())
    }

    async fn call(
        &self,
        build: impl FnOnce(u64) -> WorkerRequest,
    ) -> Result<Value, ExchangeError> {
        let request_id = self.bridge.next_id();
        let rx = self.bridge.register(request_id);
        self.requests
            .send(build(request_id))
            .map_err(|_| ExchangeError::WorkerGone)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(ExchangeError::Api(message)),
            Ok(Err(_)) => Err(ExchangeError::WorkerGone),
            Err(_) => {
                // A response lost past this point is a no-op at the bridge.
                self.bridge.forget(&request_id);
                Err(ExchangeError::Timeout)
            }
        }
    }

    async fn call_as<T: serde::de::DeserializeOwned>(
        &self,
        build: impl FnOnce(u64) -> WorkerRequest,
    ) -> Result<T, ExchangeError> {
        let value = self.call(build).await?;
        serde_json::from_value(value)
            .map_err(|e| ExchangeError::Parse(format!("malformed worker response: {}", e)))
    }
}

impl Drop for ExchangeFacade {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

async fn relay_loop(
    exchange: ExchangeId,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    bridge: Arc<ResponseBridge<u64, PendingResult>>,
    store: SharedStore,
    signals: mpsc::UnboundedSender<FacadeSignal>,
    candle_listeners: Arc<DashMap<String, CandleListener>>,
    book_listeners: Arc<DashMap<String, OrderBookListener>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Response {
                request_id,
                data,
                error,
            } => {
                let result = match error {
                    Some(message) => Err(message),
                    None => Ok(data.unwrap_or(Value::Null)),
                };
                bridge.resolve(&request_id, result);
            }
            WorkerEvent::Update { changes } => {
                store
                    .lock()
                    .expect("shared store lock")
                    .apply_changes(&changes);
            }
            WorkerEvent::Log { message } => {
                let _ = signals.send(FacadeSignal::Log { exchange, message });
            }
            WorkerEvent::Error { error } => {
                let _ = signals.send(FacadeSignal::Error {
                    exchange,
                    message: error,
                });
            }
            WorkerEvent::Candle {
                symbol,
                timeframe,
                candle,
            } => {
                let key = format!("{}:{}", symbol, timeframe);
                let listener = candle_listeners.get(&key).map(|l| l.value().clone());
                match listener {
                    Some(listener) => listener(candle),
                    None => debug!(%key, "candle push with no listener dropped"),
                }
            }
            WorkerEvent::OrderBook { symbol, order_book } => {
                let listener = book_listeners.get(&symbol).map(|l| l.value().clone());
                if let Some(listener) = listener {
                    listener(order_book);
                }
            }
        }
    }
    // Worker gone: every pending call resolves with a structured failure
    // instead of hanging forever.
    bridge.fail_all(|| Err("worker is gone".to_string()));
}
