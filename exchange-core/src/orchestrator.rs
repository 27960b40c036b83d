// exchange-core/src/orchestrator.rs
// ====
// Orchestrator: the top-level API
// ====
// Owns the account set and the shared store, holds one façade per distinct
// exchange, and fans calls out by account → exchange lookup. Aggregates
// log/error signals from every façade into a minimal pub/sub.
// ====

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use exchange_common::store::MemoryStore;
use exchange_common::types::{
    Account, Candle, CancelRequest, ExchangeId, OrderRequest, OrderUpdateRequest,
    PositionMetadata,
};

use crate::config::Settings;
use crate::exchange::facade::{CandleListener, OrderBookListener};
use crate::exchange::venues;
use crate::exchange::{ExchangeAdapter, ExchangeError, ExchangeFacade, FacadeSignal, SharedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Log,
    Error,
}

pub type EventListener = Arc<dyn Fn(&FacadeSignal) + Send + Sync>;
pub type AdapterFactory =
    Arc<dyn Fn(&Settings, ExchangeId) -> Arc<dyn ExchangeAdapter> + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    log: Vec<EventListener>,
    error: Vec<EventListener>,
}

pub struct Orchestrator {
    settings: Settings,
    store: SharedStore,
    accounts: HashMap<String, Account>,
    facades: HashMap<ExchangeId, Arc<ExchangeFacade>>,
    signals_tx: mpsc::UnboundedSender<FacadeSignal>,
    listeners: Arc<Mutex<ListenerSet>>,
    pump: JoinHandle<()>,
    factory: AdapterFactory,
}

impl Orchestrator {
    pub fn new(settings: Settings, accounts: Vec<Account>) -> Self {
        Self::with_adapter_factory(
            settings,
            accounts,
            Arc::new(|settings, exchange| venues::build_adapter(settings, exchange)),
        )
    }

    pub fn with_adapter_factory(
        settings: Settings,
        accounts: Vec<Account>,
        factory: AdapterFactory,
    ) -> Self {
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let listeners: Arc<Mutex<ListenerSet>> = Arc::new(Mutex::new(ListenerSet::default()));
        let pump_listeners = listeners.clone();
        let pump = tokio::spawn(async move {
            while let Some(signal) = signals_rx.recv().await {
                let set = pump_listeners.lock().expect("listener lock");
                match &signal {
                    FacadeSignal::Log { exchange, message } => {
                        info!(%exchange, "{}", message);
                        for listener in &set.log {
                            listener(&signal);
                        }
                    }
                    FacadeSignal::Error { exchange, message } => {
                        warn!(%exchange, "{}", message);
                        for listener in &set.error {
                            listener(&signal);
                        }
                    }
                }
            }
        });

        Self {
            settings,
            store: Arc::new(Mutex::new(MemoryStore::new())),
            accounts: accounts
                .into_iter()
                .map(|account| (account.id.clone(), account))
                .collect(),
            facades: HashMap::new(),
            signals_tx,
            listeners,
            pump,
            factory,
        }
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn on(&self, kind: EventKind, listener: EventListener) {
        let mut set = self.listeners.lock().expect("listener lock");
        match kind {
            EventKind::Log => set.log.push(listener),
            EventKind::Error => set.error.push(listener),
        }
    }

    /// Builds one façade per distinct exchange in the account set, starts
    /// them concurrently, waits for all, then registers the accounts.
    pub async fn start(&mut self) -> Result<(), ExchangeError> {
        let exchanges: HashSet<ExchangeId> =
            self.accounts.values().map(|account| account.exchange).collect();
        let facades: Vec<Arc<ExchangeFacade>> = exchanges
            .iter()
            .map(|&exchange| self.ensure_facade(exchange))
            .collect();

        for result in join_all(facades.iter().map(|facade| facade.start())).await {
            result?;
        }

        for (exchange, group) in group_by_exchange(self.accounts.values().cloned()) {
            let facade = self.ensure_facade(exchange);
            facade.add_accounts(group).await?;
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        for facade in self.facades.values() {
            if let Err(e) = facade.stop().await {
                warn!(error = %e, "facade stop failed");
            }
        }
        self.facades.clear();
    }

    /// Groups new accounts by exchange; unseen exchanges get a fresh,
    /// started façade, existing ones just take the new accounts.
    pub async fn add_accounts(&mut self, new_accounts: Vec<Account>) -> Result<(), ExchangeError> {
        for (exchange, group) in group_by_exchange(new_accounts.iter().cloned()) {
            let existing = self.facades.contains_key(&exchange);
            let facade = self.ensure_facade(exchange);
            if !existing {
                facade.start().await?;
            }
            facade.add_accounts(group).await?;
        }
        for account in new_accounts {
            self.accounts.insert(account.id.clone(), account);
        }
        Ok(())
    }

    pub async fn remove_account(&mut self, account_id: &str) -> Result<(), ExchangeError> {
        let facade = self.facade_for_account(account_id)?;
        facade.remove_account(account_id.to_string()).await?;
        self.accounts.remove(account_id);
        Ok(())
    }

    pub async fn place_order(
        &self,
        account_id: &str,
        order: OrderRequest,
        priority: bool,
    ) -> Result<Vec<String>, ExchangeError> {
        self.place_orders(account_id, vec![order], priority).await
    }

    pub async fn place_orders(
        &self,
        account_id: &str,
        orders: Vec<OrderRequest>,
        priority: bool,
    ) -> Result<Vec<String>, ExchangeError> {
        self.facade_for_account(account_id)?
            .place_orders(account_id.to_string(), orders, priority)
            .await
    }

    pub async fn update_orders(
        &self,
        account_id: &str,
        updates: Vec<OrderUpdateRequest>,
        priority: bool,
    ) -> Result<Vec<String>, ExchangeError> {
        self.facade_for_account(account_id)?
            .update_orders(account_id.to_string(), updates, priority)
            .await
    }

    pub async fn cancel_orders(
        &self,
        account_id: &str,
        cancels: Vec<CancelRequest>,
        priority: bool,
    ) -> Result<Vec<String>, ExchangeError> {
        self.facade_for_account(account_id)?
            .cancel_orders(account_id.to_string(), cancels, priority)
            .await
    }

    pub async fn fetch_position_metadata(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<PositionMetadata, ExchangeError> {
        self.facade_for_account(account_id)?
            .fetch_position_metadata(account_id.to_string(), symbol.to_string())
            .await
    }

    pub async fn set_leverage(
        &self,
        account_id: &str,
        symbol: &str,
        leverage: Decimal,
    ) -> Result<bool, ExchangeError> {
        self.facade_for_account(account_id)?
            .set_leverage(account_id.to_string(), symbol.to_string(), leverage)
            .await
    }

    pub async fn fetch_ohlcv(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.facade_for_exchange(exchange)?
            .fetch_ohlcv(symbol.to_string(), timeframe.to_string(), limit)
            .await
    }

    pub async fn listen_ohlcv(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        timeframe: &str,
        listener: CandleListener,
    ) -> Result<(), ExchangeError> {
        self.facade_for_exchange(exchange)?
            .listen_ohlcv(symbol.to_string(), timeframe.to_string(), listener)
            .await
    }

    pub async fn unlisten_ohlcv(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        timeframe: &str,
    ) -> Result<(), ExchangeError> {
        self.facade_for_exchange(exchange)?
            .unlisten_ohlcv(symbol.to_string(), timeframe.to_string())
            .await
    }

    pub async fn listen_order_book(
        &self,
        exchange: ExchangeId,
        symbol: &str,
        listener: OrderBookListener,
    ) -> Result<(), ExchangeError> {
        self.facade_for_exchange(exchange)?
            .listen_order_book(symbol.to_string(), listener)
            .await
    }

    pub async fn unlisten_order_book(
        &self,
        exchange: ExchangeId,
        symbol: &str,
    ) -> Result<(), ExchangeError> {
        self.facade_for_exchange(exchange)?
            .unlisten_order_book(symbol.to_string())
            .await
    }

    fn ensure_facade(&mut self, exchange: ExchangeId) -> Arc<ExchangeFacade> {
        if let Some(facade) = self.facades.get(&exchange) {
            return facade.clone();
        }
        let adapter = (self.factory)(&self.settings, exchange);
        let facade = Arc::new(ExchangeFacade::new(
            adapter,
            self.store.clone(),
            self.signals_tx.clone(),
            Duration::from_secs(self.settings.bridge_timeout_secs),
        ));
        self.facades.insert(exchange, facade.clone());
        facade
    }

    /// An unknown account id is a reported error, never a silent no-op.
    fn facade_for_account(&self, account_id: &str) -> Result<Arc<ExchangeFacade>, ExchangeError> {
        let account = self
            .accounts
            .get(account_id)
            .ok_or_else(|| ExchangeError::UnknownAccount(account_id.to_string()))?;
        self.facade_for_exchange(account.exchange)
    }

    fn facade_for_exchange(&self, exchange: ExchangeId) -> Result<Arc<ExchangeFacade>, ExchangeError> {
        self.facades
            .get(&exchange)
            .cloned()
            .ok_or(ExchangeError::WorkerGone)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn group_by_exchange(
    accounts: impl IntoIterator<Item = Account>,
) -> HashMap<ExchangeId, Vec<Account>> {
    let mut groups: HashMap<ExchangeId, Vec<Account>> = HashMap::new();
    for account in accounts {
        groups.entry(account.exchange).or_default().push(account);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testkit::{mock_account, MockAdapter};
    use exchange_common::types::{Market, OrderSide, OrderType, Ticker};
    use rust_decimal_macros::dec;
    use std::collections::HashMap as StdHashMap;

    fn mock_orchestrator(accounts: Vec<Account>) -> Orchestrator {
        Orchestrator::with_adapter_factory(
            Settings::default(),
            accounts,
            Arc::new(|_, _| Arc::new(MockAdapter::default()) as Arc<dyn ExchangeAdapter>),
        )
    }

    #[tokio::test]
    async fn test_start_loads_markets_and_filters_tickers() {
        let mut orchestrator = mock_orchestrator(vec![mock_account("a1")]);
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        let store = store.lock().unwrap();
        let markets: StdHashMap<String, Market> =
            store.read_as("bybit.public.markets").unwrap();
        assert_eq!(markets.len(), 3);
        let tickers: StdHashMap<String, Ticker> =
            store.read_as("bybit.public.tickers").unwrap();
        assert_eq!(tickers.len(), 3);
        // The ticker without a market was dropped.
        assert!(!tickers.contains_key("XRPUSDT"));
        assert_eq!(store.read_as::<bool>("bybit.loaded.markets"), Some(true));
        assert_eq!(store.read_as::<bool>("bybit.loaded.tickers"), Some(true));
    }

    #[tokio::test]
    async fn test_account_snapshot_lands_in_store() {
        let mut orchestrator = mock_orchestrator(vec![mock_account("a1")]);
        orchestrator.start().await.unwrap();

        let store = orchestrator.store();
        let store = store.lock().unwrap();
        assert_eq!(
            store.read_as::<Decimal>("bybit.private.a1.balance.total"),
            Some(dec!(1000))
        );
        assert_eq!(
            store
                .read_as::<Vec<serde_json::Value>>("bybit.private.a1.orders")
                .map(|o| o.len()),
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_place_order_end_to_end() {
        let mut orchestrator = mock_orchestrator(vec![mock_account("a1")]);
        orchestrator.start().await.unwrap();

        let order = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(99.95)),
            amount: dec!(1),
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
        };
        let ids = orchestrator.place_order("a1", order, false).await.unwrap();
        assert_eq!(ids, vec!["mock-1".to_string()]);

        let store = orchestrator.store();
        let store = store.lock().unwrap();
        let orders: Vec<serde_json::Value> =
            store.read_as("bybit.private.a1.orders").unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0]["id"], "mock-1");
        // Price snapped to the market's 0.1 tick.
        assert_eq!(orders[0]["price"], "100");
    }

    #[tokio::test]
    async fn test_unknown_account_is_a_reported_error() {
        let orchestrator = mock_orchestrator(vec![]);
        let order = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            price: None,
            amount: dec!(1),
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
        };
        let result = orchestrator.place_order("ghost", order, false).await;
        assert!(matches!(result, Err(ExchangeError::UnknownAccount(_))));
    }

    #[tokio::test]
    async fn test_fetch_ohlcv_returns_ascending_candles() {
        let mut orchestrator = mock_orchestrator(vec![mock_account("a1")]);
        orchestrator.start().await.unwrap();
        let candles = orchestrator
            .fetch_ohlcv(ExchangeId::Bybit, "BTCUSDT", "1m", 5)
            .await
            .unwrap();
        assert_eq!(candles.len(), 5);
        assert!(candles.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_stop_tears_facades_down() {
        let mut orchestrator = mock_orchestrator(vec![mock_account("a1")]);
        orchestrator.start().await.unwrap();
        orchestrator.stop().await;
        // Account-scoped calls now fail because the façade set is empty.
        let result = orchestrator.fetch_position_metadata("a1", "BTCUSDT").await;
        assert!(result.is_err());
    }
}
