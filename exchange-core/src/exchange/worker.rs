// exchange/worker.rs
// ====
// Per-exchange worker
// ====
// The isolated execution unit behind each venue: ingests public and
// private streams, normalizes venue payloads, tracks order/position/
// balance lifecycles, and serves trading operations. All worker-local
// state mutation happens on the single main loop below; sub-tasks
// (stream pumps, pollers, queue jobs) only funnel events into it.
// ====

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use exchange_common::book::{BookSide, OrderBook};
use exchange_common::math;
use exchange_common::store::{ChangeCommand, MemoryStore};
use exchange_common::types::{
    Account, Balance, CancelRequest, ExchangeId, Fill, Market, Order, OrderRequest, OrderSide,
    OrderStatus, OrderType, OrderUpdateRequest, Position, PositionMetadata, now_millis,
    STOP_LOSS_SUFFIX, TAKE_PROFIT_SUFFIX,
};

use super::errors::ExchangeError;
use super::protocol::{WorkerEvent, WorkerRequest};
use super::queue::RateQueue;
use super::traits::{
    AmendPayload, ExchangeAdapter, OrderPayload, OrderPush, PositionPush, PrivatePush, PublicPush,
    RawOrderStatus,
};
use super::transport::{ReconnectingSocket, TransportConfig, TransportEvent};

/// Pragmatic cutoff for the initial fill-history backfill.
pub const FILL_HISTORY_LIMIT: usize = 250;
pub const HISTORY_PAGE_SIZE: u32 = 100;

const BALANCE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const BALANCE_POLL_BACKOFF: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const MAX_PROTECTION_LEGS: usize = 2;

pub struct WorkerHandle {
    pub requests: mpsc::UnboundedSender<WorkerRequest>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Spawns a worker task for one venue and returns its channel pair.
pub fn spawn(adapter: Arc<dyn ExchangeAdapter>) -> WorkerHandle {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut worker = ExchangeWorker::new(adapter, event_tx);
        worker.run(request_rx).await;
    });
    WorkerHandle {
        requests: request_tx,
        events: event_rx,
    }
}

enum InternalEvent {
    Public(TransportEvent),
    PrivateMessage {
        account_id: String,
        text: String,
    },
    BalancePolled {
        account_id: String,
        balance: Balance,
    },
    Placed {
        request_id: u64,
        account_id: String,
        placed: Vec<PlacedOrder>,
        errors: Vec<String>,
    },
    Updated {
        request_id: u64,
        account_id: String,
        outcomes: Vec<UpdateOutcome>,
        errors: Vec<String>,
    },
    Canceled {
        request_id: u64,
        account_id: String,
        canceled: Vec<String>,
        errors: Vec<String>,
    },
    LeverageSet {
        request_id: u64,
        account_id: String,
        symbol: String,
        leverage: Decimal,
        error: Option<String>,
    },
}

struct PlacedOrder {
    id: String,
    payload: OrderPayload,
}

enum UpdateOutcome {
    Amended(OrderUpdateRequest),
    Replaced {
        old_id: String,
        new: PlacedOrder,
    },
}

struct AccountRuntime {
    account: Account,
    socket: Arc<ReconnectingSocket>,
    listening: Arc<AtomicBool>,
    queue: RateQueue,
    tasks: Vec<JoinHandle<()>>,
}

impl AccountRuntime {
    fn teardown(&self) {
        self.socket.close();
        self.queue.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct PublicRuntime {
    socket: Arc<ReconnectingSocket>,
    pump: JoinHandle<()>,
}

pub(crate) struct ExchangeWorker {
    adapter: Arc<dyn ExchangeAdapter>,
    exchange: ExchangeId,
    memory: MemoryStore,
    events: mpsc::UnboundedSender<WorkerEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: Option<mpsc::UnboundedReceiver<InternalEvent>>,
    public: Option<PublicRuntime>,
    books: HashMap<String, OrderBook>,
    book_subs: HashSet<String>,
    kline_subs: HashSet<(String, String)>,
    accounts: HashMap<String, AccountRuntime>,
    started: bool,
    last_ping: Option<Instant>,
}

impl ExchangeWorker {
    pub(crate) fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            exchange: adapter.id(),
            adapter,
            memory: MemoryStore::new(),
            events,
            internal_tx,
            internal_rx: Some(internal_rx),
            public: None,
            books: HashMap::new(),
            book_subs: HashSet::new(),
            kline_subs: HashSet::new(),
            accounts: HashMap::new(),
            started: false,
            last_ping: None,
        }
    }

    pub(crate) async fn run(&mut self, mut requests: mpsc::UnboundedReceiver<WorkerRequest>) {
        let mut internal = self
            .internal_rx
            .take()
            .expect("worker run() called twice");
        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(WorkerRequest::Stop { request_id }) => {
                        self.shutdown();
                        self.respond_ok(request_id, json!(true));
                        return;
                    }
                    Some(request) => self.handle_request(request).await,
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event),
                _ = ping_timer.tick() => self.send_ping(),
            }
        }
    }

    // ================================================================
    // REQUESTS
    // ================================================================

    async fn handle_request(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Start { request_id } => self.handle_start(request_id).await,
            WorkerRequest::AddAccounts {
                request_id,
                accounts,
            } => self.handle_add_accounts(request_id, accounts).await,
            WorkerRequest::RemoveAccount {
                request_id,
                account_id,
            } => self.handle_remove_account(request_id, &account_id),
            WorkerRequest::PlaceOrders {
                request_id,
                account_id,
                orders,
                priority,
            } => self.handle_place_orders(request_id, account_id, orders, priority),
            WorkerRequest::UpdateOrders {
                request_id,
                account_id,
                updates,
                priority,
            } => self.handle_update_orders(request_id, account_id, updates, priority),
            WorkerRequest::CancelOrders {
                request_id,
                account_id,
                cancels,
                priority,
            } => self.handle_cancel_orders(request_id, account_id, cancels, priority),
            WorkerRequest::FetchOhlcv {
                request_id,
                symbol,
                timeframe,
                limit,
            } => match self.adapter.fetch_ohlcv(&symbol, &timeframe, limit).await {
                Ok(candles) => self.respond_ok(request_id, candles),
                Err(e) => self.respond_err(request_id, e),
            },
            WorkerRequest::ListenOhlcv {
                request_id,
                symbol,
                timeframe,
            } => {
                self.kline_subs.insert((symbol.clone(), timeframe.clone()));
                self.send_kline_subscription(&symbol, &timeframe, true);
                self.respond_ok(request_id, json!(true));
            }
            WorkerRequest::UnlistenOhlcv {
                request_id,
                symbol,
                timeframe,
            } => {
                self.kline_subs.remove(&(symbol.clone(), timeframe.clone()));
                self.send_kline_subscription(&symbol, &timeframe, false);
                self.respond_ok(request_id, json!(true));
            }
            WorkerRequest::ListenOrderBook { request_id, symbol } => {
                self.book_subs.insert(symbol.clone());
                self.send_book_subscription(&symbol, true);
                self.respond_ok(request_id, json!(true));
            }
            WorkerRequest::UnlistenOrderBook { request_id, symbol } => {
                self.book_subs.remove(&symbol);
                self.books.remove(&symbol);
                self.send_book_subscription(&symbol, false);
                self.respond_ok(request_id, json!(true));
            }
            WorkerRequest::FetchPositionMetadata {
                request_id,
                account_id,
                symbol,
            } => self.handle_fetch_metadata(request_id, &account_id, &symbol).await,
            WorkerRequest::SetLeverage {
                request_id,
                account_id,
                symbol,
                leverage,
            } => self.handle_set_leverage(request_id, account_id, symbol, leverage),
            WorkerRequest::Stop { .. } => unreachable!("handled by the main loop"),
        }
    }

    async fn handle_start(&mut self, request_id: u64) {
        if self.started {
            self.respond_ok(request_id, json!(true));
            return;
        }
        info!(exchange = %self.exchange, "worker starting");

        let markets = match self.adapter.fetch_markets().await {
            Ok(markets) => markets,
            Err(e) => {
                self.respond_err(request_id, e);
                return;
            }
        };
        let tickers = match self.adapter.fetch_tickers().await {
            Ok(tickers) => tickers,
            Err(e) => {
                self.respond_err(request_id, e);
                return;
            }
        };

        let ex = self.exchange.key();
        self.emit(vec![ChangeCommand::update(
            ex,
            json!({
                "loaded": { "markets": false, "tickers": false },
                "public": { "latency": 0, "markets": {}, "tickers": {} },
                "private": {}
            }),
        )]);

        let mut changes = Vec::new();
        let mut known = HashSet::new();
        for market in &markets {
            known.insert(market.symbol.clone());
            changes.push(ChangeCommand::update(
                format!("{}.public.markets.{}", ex, market.symbol),
                market,
            ));
        }
        // Tickers are filtered to known markets.
        for ticker in tickers
            .into_iter()
            .filter(|t| known.contains(&t.symbol))
        {
            changes.push(ChangeCommand::update(
                format!("{}.public.tickers.{}", ex, ticker.symbol),
                &ticker,
            ));
        }
        self.emit(changes);

        let socket = Arc::new(ReconnectingSocket::connect(TransportConfig::new(
            self.adapter.ws_public_url(),
        )));
        let pump = spawn_public_pump(socket.clone(), self.internal_tx.clone());
        self.public = Some(PublicRuntime { socket, pump });

        self.emit(vec![
            ChangeCommand::update(format!("{}.loaded.markets", ex), true),
            ChangeCommand::update(format!("{}.loaded.tickers", ex), true),
        ]);
        self.started = true;
        info!(exchange = %self.exchange, markets = known.len(), "worker public data ready");
        self.respond_ok(request_id, json!(true));
    }

    async fn handle_add_accounts(&mut self, request_id: u64, accounts: Vec<Account>) {
        let mut added = Vec::new();
        for account in accounts {
            if account.exchange != self.exchange {
                self.emit_error(format!(
                    "account {} belongs to {}, not {}",
                    account.id, account.exchange, self.exchange
                ));
                continue;
            }
            if self.accounts.contains_key(&account.id) {
                continue;
            }
            let account_id = account.id.clone();
            match self.add_account(account).await {
                Ok(()) => added.push(account_id),
                Err(e) => {
                    self.emit_error(format!("failed to add account {}: {}", account_id, e));
                }
            }
        }
        self.respond_ok(request_id, added);
    }

    async fn add_account(&mut self, account: Account) -> Result<(), ExchangeError> {
        let ex = self.exchange.key();
        let account_id = account.id.clone();
        info!(exchange = %self.exchange, account = %account_id, "adding account");

        // Register the account's memory before anything can reference it.
        self.emit(vec![ChangeCommand::update(
            format!("{}.private.{}", ex, account_id),
            json!({
                "balance": Balance::default(),
                "positions": [],
                "orders": [],
                "fills": [],
                "notifications": [],
                "metadata": { "leverage": {}, "hedgedPosition": {} }
            }),
        )]);

        // Private stream with deferred activation: the pump drops pushes
        // until the HTTP snapshot below is fully applied.
        let url = self.adapter.ws_private_url(&account).await?;
        let socket = Arc::new(ReconnectingSocket::connect(TransportConfig::new(url)));
        let listening = Arc::new(AtomicBool::new(false));
        let mut tasks = vec![spawn_private_pump(
            self.adapter.clone(),
            account.clone(),
            socket.clone(),
            listening.clone(),
            self.internal_tx.clone(),
        )];

        // HTTP snapshot: balance, positions (+ metadata), orders, fills.
        let snapshot = self.fetch_account_snapshot(&account).await;
        let (balance, positions, orders, fills) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                socket.close();
                for task in &tasks {
                    task.abort();
                }
                self.emit(vec![ChangeCommand::update(
                    format!("{}.private.{}", ex, account_id),
                    Value::Null,
                )]);
                return Err(e);
            }
        };

        let base = format!("{}.private.{}", ex, account_id);
        let mut changes = vec![ChangeCommand::update(format!("{}.balance", base), &balance)];
        for (i, position) in positions.iter().enumerate() {
            changes.push(ChangeCommand::update(
                format!("{}.positions.{}", base, i),
                position,
            ));
            changes.push(ChangeCommand::update(
                format!("{}.metadata.leverage.{}", base, position.symbol),
                position.leverage,
            ));
            changes.push(ChangeCommand::update(
                format!("{}.metadata.hedgedPosition.{}", base, position.symbol),
                position.is_hedged,
            ));
        }
        for (i, order) in orders.iter().enumerate() {
            changes.push(ChangeCommand::update(format!("{}.orders.{}", base, i), order));
        }
        for (i, fill) in fills.iter().enumerate() {
            changes.push(ChangeCommand::update(format!("{}.fills.{}", base, i), fill));
        }
        self.emit(changes);

        // Baseline applied; pushes are safe to process from here on.
        listening.store(true, Ordering::SeqCst);

        tasks.push(spawn_balance_poller(
            self.adapter.clone(),
            account.clone(),
            self.internal_tx.clone(),
        ));
        if let Some(interval) = self.adapter.session_refresh_interval() {
            tasks.push(spawn_session_refresher(
                self.adapter.clone(),
                account.clone(),
                interval,
            ));
        }

        let queue = RateQueue::new(self.adapter.rate_per_second());
        self.accounts.insert(
            account_id,
            AccountRuntime {
                account,
                socket,
                listening,
                queue,
                tasks,
            },
        );
        Ok(())
    }

    async fn fetch_account_snapshot(
        &self,
        account: &Account,
    ) -> Result<(Balance, Vec<Position>, Vec<Order>, Vec<Fill>), ExchangeError> {
        let balance = self.adapter.fetch_balance(account).await?;
        let positions = self.adapter.fetch_positions(account).await?;
        let orders = self.adapter.fetch_open_orders(account).await?;
        let fills = self.fetch_fill_history(account).await?;
        Ok((balance, positions, orders, fills))
    }

    async fn fetch_fill_history(&self, account: &Account) -> Result<Vec<Fill>, ExchangeError> {
        let mut fills: Vec<Fill> = Vec::new();
        let mut cursor = None;
        loop {
            let (batch, next) = self
                .adapter
                .fetch_fills_page(account, cursor.take(), HISTORY_PAGE_SIZE)
                .await?;
            let short_page = batch.len() < HISTORY_PAGE_SIZE as usize;
            fills.extend(batch);
            if short_page || fills.len() >= FILL_HISTORY_LIMIT || next.is_none() {
                break;
            }
            cursor = next;
        }
        fills.truncate(FILL_HISTORY_LIMIT);
        Ok(fills)
    }

    fn handle_remove_account(&mut self, request_id: u64, account_id: &str) {
        if let Some(runtime) = self.accounts.remove(account_id) {
            runtime.teardown();
            self.emit(vec![ChangeCommand::update(
                format!("{}.private.{}", self.exchange.key(), account_id),
                Value::Null,
            )]);
            info!(exchange = %self.exchange, account = %account_id, "account removed");
        }
        // Idempotent: removing an unknown account is a successful no-op.
        self.respond_ok(request_id, json!(true));
    }

    fn handle_place_orders(
        &mut self,
        request_id: u64,
        account_id: String,
        orders: Vec<OrderRequest>,
        priority: bool,
    ) {
        if !self.accounts.contains_key(&account_id) {
            self.respond_err(request_id, ExchangeError::UnknownAccount(account_id));
            return;
        }
        let payloads = match self.build_payloads(&account_id, &orders) {
            Ok(payloads) => payloads,
            Err(e) => {
                self.respond_err(request_id, e);
                return;
            }
        };

        let runtime = self.accounts.get(&account_id).expect("runtime checked above");
        let weight = payloads.len() as u32;
        let adapter = self.adapter.clone();
        let account = runtime.account.clone();
        let tx = self.internal_tx.clone();
        let job_account_id = account_id.clone();
        let job = async move {
            let mut placed = Vec::new();
            let mut errors = Vec::new();
            for payload in payloads {
                match place_with_retry(adapter.as_ref(), &account, payload).await {
                    Ok(placed_order) => placed.push(placed_order),
                    Err(e) => errors.push(e.to_string()),
                }
            }
            let _ = tx.send(InternalEvent::Placed {
                request_id,
                account_id: job_account_id,
                placed,
                errors,
            });
        };
        if priority {
            runtime.queue.push_priority(weight, job);
        } else {
            runtime.queue.push(weight, job);
        }
    }

    fn handle_update_orders(
        &mut self,
        request_id: u64,
        account_id: String,
        updates: Vec<OrderUpdateRequest>,
        priority: bool,
    ) {
        let Some(runtime) = self.accounts.get(&account_id) else {
            self.respond_err(request_id, ExchangeError::UnknownAccount(account_id));
            return;
        };

        let weight = updates.len() as u32;
        let adapter = self.adapter.clone();
        let account = runtime.account.clone();
        let tx = self.internal_tx.clone();
        let job_account_id = account_id.clone();

        if self.adapter.supports_order_update() {
            let job = async move {
                let mut outcomes = Vec::new();
                let mut errors = Vec::new();
                for update in updates {
                    let payload = AmendPayload {
                        order_id: update.order_id.clone(),
                        symbol: update.symbol.clone(),
                        price: update.price,
                        amount: update.amount,
                    };
                    match adapter.amend_order(&account, &payload).await {
                        Ok(()) => outcomes.push(UpdateOutcome::Amended(update)),
                        Err(e) => errors.push(e.to_string()),
                    }
                }
                let _ = tx.send(InternalEvent::Updated {
                    request_id,
                    account_id: job_account_id,
                    outcomes,
                    errors,
                });
            };
            if priority {
                runtime.queue.push_priority(weight, job);
            } else {
                runtime.queue.push(weight, job);
            }
            return;
        }

        // The venue cannot modify an order in place; degrade to
        // cancel-then-replace using the live order as the template.
        let mut replacements = Vec::new();
        for update in &updates {
            match self.find_order(&account_id, &update.order_id) {
                Some(existing) => {
                    let payload = OrderPayload {
                        symbol: existing.symbol.clone(),
                        side: existing.side,
                        order_type: existing.order_type,
                        price: update.price.or(Some(existing.price)),
                        amount: update.amount.unwrap_or(existing.remaining),
                        reduce_only: existing.reduce_only,
                        position_idx: self.position_idx_for(
                            &account_id,
                            &existing.symbol,
                            existing.side,
                            existing.reduce_only,
                        ),
                        stop_loss: None,
                        take_profit: None,
                    };
                    replacements.push((update.clone(), payload));
                }
                None => {
                    self.respond_err(
                        request_id,
                        ExchangeError::InvalidRequest(format!(
                            "order {} is not live",
                            update.order_id
                        )),
                    );
                    return;
                }
            }
        }

        let job = async move {
            let mut outcomes = Vec::new();
            let mut errors = Vec::new();
            for (update, payload) in replacements {
                if let Err(e) = adapter
                    .cancel_order(&account, &update.symbol, &update.order_id)
                    .await
                {
                    errors.push(e.to_string());
                    continue;
                }
                match place_with_retry(adapter.as_ref(), &account, payload).await {
                    Ok(new) => outcomes.push(UpdateOutcome::Replaced {
                        old_id: update.order_id.clone(),
                        new,
                    }),
                    Err(e) => errors.push(e.to_string()),
                }
            }
            let _ = tx.send(InternalEvent::Updated {
                request_id,
                account_id: job_account_id,
                outcomes,
                errors,
            });
        };
        // Cancel + replace is two operations per update.
        let weight = weight * 2;
        if priority {
            runtime.queue.push_priority(weight, job);
        } else {
            runtime.queue.push(weight, job);
        }
    }

    fn handle_cancel_orders(
        &mut self,
        request_id: u64,
        account_id: String,
        cancels: Vec<CancelRequest>,
        priority: bool,
    ) {
        let Some(runtime) = self.accounts.get(&account_id) else {
            self.respond_err(request_id, ExchangeError::UnknownAccount(account_id));
            return;
        };
        let weight = cancels.len() as u32;
        let adapter = self.adapter.clone();
        let account = runtime.account.clone();
        let tx = self.internal_tx.clone();
        let job_account_id = account_id.clone();
        let job = async move {
            let mut canceled = Vec::new();
            let mut errors = Vec::new();
            for cancel in cancels {
                match adapter
                    .cancel_order(&account, &cancel.symbol, &cancel.order_id)
                    .await
                {
                    Ok(()) => canceled.push(cancel.order_id),
                    Err(e) => errors.push(e.to_string()),
                }
            }
            let _ = tx.send(InternalEvent::Canceled {
                request_id,
                account_id: job_account_id,
                canceled,
                errors,
            });
        };
        if priority {
            runtime.queue.push_priority(weight, job);
        } else {
            runtime.queue.push(weight, job);
        }
    }

    async fn handle_fetch_metadata(&mut self, request_id: u64, account_id: &str, symbol: &str) {
        let Some(runtime) = self.accounts.get(account_id) else {
            self.respond_err(
                request_id,
                ExchangeError::UnknownAccount(account_id.to_string()),
            );
            return;
        };
        if let Some(metadata) = self.read_metadata(account_id, symbol) {
            self.respond_ok(request_id, metadata);
            return;
        }

        // Metadata unknown for this symbol; derive it from a live position
        // fetch and cache the result.
        let account = runtime.account.clone();
        match self.adapter.fetch_positions(&account).await {
            Ok(positions) => {
                let metadata = positions
                    .iter()
                    .find(|p| p.symbol == symbol)
                    .map(|p| PositionMetadata {
                        leverage: p.leverage,
                        is_hedged: p.is_hedged,
                    })
                    .unwrap_or(PositionMetadata {
                        leverage: Decimal::ONE,
                        is_hedged: false,
                    });
                let base = format!("{}.private.{}", self.exchange.key(), account_id);
                self.emit(vec![
                    ChangeCommand::update(
                        format!("{}.metadata.leverage.{}", base, symbol),
                        metadata.leverage,
                    ),
                    ChangeCommand::update(
                        format!("{}.metadata.hedgedPosition.{}", base, symbol),
                        metadata.is_hedged,
                    ),
                ]);
                self.respond_ok(request_id, metadata);
            }
            Err(e) => self.respond_err(request_id, e),
        }
    }

    fn handle_set_leverage(
        &mut self,
        request_id: u64,
        account_id: String,
        symbol: String,
        leverage: Decimal,
    ) {
        let Some(runtime) = self.accounts.get(&account_id) else {
            self.respond_err(request_id, ExchangeError::UnknownAccount(account_id));
            return;
        };
        let Some(market) = self.read_market(&symbol) else {
            self.respond_err(request_id, ExchangeError::UnknownSymbol(symbol));
            return;
        };
        let clamped = leverage
            .max(market.limits.leverage.min)
            .min(market.limits.leverage.max);
        if clamped != leverage {
            debug!(exchange = %self.exchange, %symbol, requested = %leverage, clamped = %clamped,
                "leverage clamped to market limits");
        }

        let adapter = self.adapter.clone();
        let account = runtime.account.clone();
        let tx = self.internal_tx.clone();
        runtime.queue.push(1, async move {
            let error = adapter
                .set_leverage(&account, &symbol, clamped)
                .await
                .err()
                .map(|e| e.to_string());
            let _ = tx.send(InternalEvent::LeverageSet {
                request_id,
                account_id: account.id.clone(),
                symbol,
                leverage: clamped,
                error,
            });
        });
    }

    // ================================================================
    // INTERNAL EVENTS
    // ================================================================

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Public(transport) => self.handle_public_event(transport),
            InternalEvent::PrivateMessage { account_id, text } => {
                self.handle_private_message(&account_id, &text)
            }
            InternalEvent::BalancePolled {
                account_id,
                balance,
            } => {
                if self.accounts.contains_key(&account_id) {
                    self.emit(vec![ChangeCommand::update(
                        format!("{}.private.{}.balance", self.exchange.key(), account_id),
                        balance,
                    )]);
                }
            }
            InternalEvent::Placed {
                request_id,
                account_id,
                placed,
                errors,
            } => self.handle_placed(request_id, &account_id, placed, errors),
            InternalEvent::Updated {
                request_id,
                account_id,
                outcomes,
                errors,
            } => self.handle_updated(request_id, &account_id, outcomes, errors),
            InternalEvent::Canceled {
                request_id,
                account_id,
                canceled,
                errors,
            } => self.handle_canceled(request_id, &account_id, canceled, errors),
            InternalEvent::LeverageSet {
                request_id,
                account_id,
                symbol,
                leverage,
                error,
            } => match error {
                Some(message) => {
                    self.emit_error(format!("set leverage failed for {}: {}", symbol, message));
                    self.respond_ok(request_id, json!(false));
                }
                None => {
                    if self.accounts.contains_key(&account_id) {
                        self.emit(vec![ChangeCommand::update(
                            format!(
                                "{}.private.{}.metadata.leverage.{}",
                                self.exchange.key(),
                                account_id,
                                symbol
                            ),
                            leverage,
                        )]);
                    }
                    self.respond_ok(request_id, json!(true));
                }
            },
        }
    }

    fn handle_public_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                let symbols = self.known_symbols();
                if let Some(public) = &self.public {
                    for message in self.adapter.public_subscriptions(&symbols) {
                        let _ = public.socket.send(message);
                    }
                    // Streams the caller listens to survive reconnects.
                    for (symbol, timeframe) in self.kline_subs.clone() {
                        self.send_kline_subscription(&symbol, &timeframe, true);
                    }
                    for symbol in self.book_subs.clone() {
                        self.send_book_subscription(&symbol, true);
                    }
                }
            }
            TransportEvent::Message(text) => {
                for push in self.adapter.parse_public(&text) {
                    self.handle_public_push(push);
                }
            }
            TransportEvent::Closed => {}
        }
    }

    fn handle_public_push(&mut self, push: PublicPush) {
        let ex = self.exchange.key();
        match push {
            PublicPush::TickerSnapshot(mut ticker) => {
                // Tickers for unknown markets are dropped.
                if self.read_market(&ticker.symbol).is_none() {
                    return;
                }
                ticker.exchange = Some(self.exchange);
                self.emit(vec![ChangeCommand::update(
                    format!("{}.public.tickers.{}", ex, ticker.symbol),
                    &ticker,
                )]);
            }
            PublicPush::TickerDelta { symbol, fields } => {
                // A delta without a baseline snapshot cannot be merged.
                if self
                    .memory
                    .read(&format!("{}.public.tickers.{}", ex, symbol))
                    .is_none()
                {
                    return;
                }
                let changes = fields
                    .into_iter()
                    .map(|(field, value)| {
                        ChangeCommand::Update {
                            path: format!("{}.public.tickers.{}.{}", ex, symbol, field),
                            value,
                        }
                    })
                    .collect();
                self.emit(changes);
            }
            PublicPush::BookSnapshot {
                symbol,
                bids,
                asks,
            } => {
                let book = OrderBook::from_snapshot(bids, asks);
                self.books.insert(symbol.clone(), book.clone());
                if self.book_subs.contains(&symbol) {
                    let _ = self.events.send(WorkerEvent::OrderBook {
                        symbol,
                        order_book: book,
                    });
                }
            }
            PublicPush::BookDelta {
                symbol,
                bids,
                asks,
            } => {
                let book = self.books.entry(symbol.clone()).or_default();
                for (price, amount) in bids {
                    book.apply_delta(BookSide::Bids, price, amount);
                }
                for (price, amount) in asks {
                    book.apply_delta(BookSide::Asks, price, amount);
                }
                if self.book_subs.contains(&symbol) {
                    let book = book.clone();
                    let _ = self.events.send(WorkerEvent::OrderBook {
                        symbol,
                        order_book: book,
                    });
                }
            }
            PublicPush::Candle {
                symbol,
                timeframe,
                candle,
            } => {
                let _ = self.events.send(WorkerEvent::Candle {
                    symbol,
                    timeframe,
                    candle,
                });
            }
            PublicPush::Pong => {
                if let Some(sent) = self.last_ping.take() {
                    let latency = sent.elapsed().as_millis() as u64;
                    self.emit(vec![ChangeCommand::update(
                        format!("{}.public.latency", ex),
                        latency,
                    )]);
                }
            }
        }
    }

    fn handle_private_message(&mut self, account_id: &str, text: &str) {
        if !self.accounts.contains_key(account_id) {
            return;
        }
        for push in self.adapter.parse_private(text) {
            match push {
                PrivatePush::Order(order) => self.reconcile_order_push(account_id, order),
                PrivatePush::Position(position) => {
                    self.reconcile_position_push(account_id, position)
                }
                PrivatePush::Balance(balance) => {
                    self.emit(vec![ChangeCommand::update(
                        format!("{}.private.{}.balance", self.exchange.key(), account_id),
                        balance,
                    )]);
                }
            }
        }
    }

    // ================================================================
    // RECONCILIATION
    // ================================================================

    /// Applies one order-status push to the live-orders view. The most
    /// delicate routine in the worker; see the inline cases.
    fn reconcile_order_push(&mut self, account_id: &str, push: OrderPush) {
        // Replacement echoes arrive as PartiallyFilled with no price and no
        // amount; they are false positives, not fills.
        if push.status == RawOrderStatus::PartiallyFilled
            && push.price <= Decimal::ZERO
            && push.amount <= Decimal::ZERO
        {
            debug!(exchange = %self.exchange, order = %push.id, "discarding zero-value partial fill");
            return;
        }

        let base = format!("{}.private.{}", self.exchange.key(), account_id);
        let orders_path = format!("{}.orders", base);
        let orders: Vec<Order> = self.memory.read_as(&orders_path).unwrap_or_default();
        let known_index = orders.iter().position(|o| o.id == push.id);
        let mut changes = Vec::new();

        // Incremental fill: the venue reports cumulative execution, the
        // notification carries only the newly executed amount.
        if matches!(
            push.status,
            RawOrderStatus::Filled | RawOrderStatus::PartiallyFilled
        ) {
            let previously_filled = known_index
                .map(|i| orders[i].filled)
                .unwrap_or(Decimal::ZERO);
            let increment = math::subtract(push.executed, previously_filled);
            if increment > Decimal::ZERO {
                let notifications_len = self
                    .memory
                    .read_as::<Vec<Value>>(&format!("{}.notifications", base))
                    .map(|n| n.len())
                    .unwrap_or(0);
                changes.push(ChangeCommand::update(
                    format!("{}.notifications.{}", base, notifications_len),
                    json!({
                        "type": "order_fill",
                        "symbol": push.symbol,
                        "side": push.side,
                        "price": push.price,
                        "amount": increment,
                        "timestamp": push.timestamp,
                    }),
                ));
            }
        }

        if push.status.is_terminal() {
            // Remove the order together with its synthetic protection legs,
            // compacting indices as earlier removals in this batch land.
            let stop_loss_id = format!("{}{}", push.id, STOP_LOSS_SUFFIX);
            let take_profit_id = format!("{}{}", push.id, TAKE_PROFIT_SUFFIX);
            let mut doomed: Vec<usize> = orders
                .iter()
                .enumerate()
                .filter(|(_, o)| {
                    o.id == push.id || o.id == stop_loss_id || o.id == take_profit_id
                })
                .map(|(i, _)| i)
                .collect();
            doomed.sort_unstable();
            for (already_removed, index) in doomed.iter().enumerate() {
                changes.push(ChangeCommand::remove_array_element(
                    orders_path.clone(),
                    index - already_removed,
                ));
            }

            if push.status == RawOrderStatus::Filled {
                let fills_len = self
                    .memory
                    .read_as::<Vec<Value>>(&format!("{}.fills", base))
                    .map(|f| f.len())
                    .unwrap_or(0);
                changes.push(ChangeCommand::update(
                    format!("{}.fills.{}", base, fills_len),
                    Fill {
                        symbol: push.symbol.clone(),
                        side: push.side,
                        price: push.price,
                        amount: push.executed,
                        timestamp: push.timestamp,
                    },
                ));
            }
        } else {
            // Non-terminal: update in place or append, decided by id
            // membership, never by blind append.
            let order = self.order_from_push(account_id, &push);
            match known_index {
                Some(index) => changes.push(ChangeCommand::update(
                    format!("{}.{}", orders_path, index),
                    order,
                )),
                None => changes.push(ChangeCommand::update(
                    format!("{}.{}", orders_path, orders.len()),
                    order,
                )),
            }
        }

        self.emit(changes);
    }

    fn reconcile_position_push(&mut self, account_id: &str, push: PositionPush) {
        let base = format!("{}.private.{}", self.exchange.key(), account_id);
        let positions_path = format!("{}.positions", base);
        let positions: Vec<Position> = self.memory.read_as(&positions_path).unwrap_or_default();
        let index = positions.iter().position(|p| {
            p.symbol == push.symbol && (!push.is_hedged || p.side == push.side)
        });

        let mut changes = Vec::new();
        if push.contracts.is_zero() {
            // A flat position is removed, never retained as a zero row.
            if let Some(i) = index {
                changes.push(ChangeCommand::remove_array_element(positions_path, i));
            }
        } else {
            let position = Position {
                account_id: account_id.to_string(),
                exchange: self.exchange,
                symbol: push.symbol.clone(),
                side: push.side,
                entry_price: push.entry_price,
                notional: push.notional,
                leverage: push.leverage,
                upnl: push.upnl,
                rpnl: push.rpnl,
                contracts: push.contracts,
                liquidation_price: push.liquidation_price,
                is_hedged: push.is_hedged,
            };
            let target = index.unwrap_or(positions.len());
            changes.push(ChangeCommand::update(
                format!("{}.{}", positions_path, target),
                position,
            ));
            // Some venues omit leverage on pushes; never wipe known metadata.
            if push.leverage > Decimal::ZERO {
                changes.push(ChangeCommand::update(
                    format!("{}.metadata.leverage.{}", base, push.symbol),
                    push.leverage,
                ));
            }
            changes.push(ChangeCommand::update(
                format!("{}.metadata.hedgedPosition.{}", base, push.symbol),
                push.is_hedged,
            ));
        }
        self.emit(changes);
    }

    fn handle_placed(
        &mut self,
        request_id: u64,
        account_id: &str,
        placed: Vec<PlacedOrder>,
        errors: Vec<String>,
    ) {
        for error in &errors {
            self.emit_error(format!("order placement failed: {}", error));
        }
        if !self.accounts.contains_key(account_id) {
            self.respond_ok(request_id, Vec::<String>::new());
            return;
        }

        let orders_path = format!("{}.private.{}.orders", self.exchange.key(), account_id);
        let mut next = self
            .memory
            .read_as::<Vec<Value>>(&orders_path)
            .map(|o| o.len())
            .unwrap_or(0);
        let mut changes = Vec::new();
        let mut ids = Vec::new();
        for entry in &placed {
            ids.push(entry.id.clone());
            for order in self.materialize_orders(account_id, entry) {
                changes.push(ChangeCommand::update(
                    format!("{}.{}", orders_path, next),
                    order,
                ));
                next += 1;
            }
        }
        self.emit(changes);

        if ids.is_empty() && !errors.is_empty() {
            self.respond_err(request_id, ExchangeError::Api(errors.join("; ")));
        } else {
            self.respond_ok(request_id, ids);
        }
    }

    /// An acked placement becomes up to three logical orders: the base
    /// order plus synthetic legs for protection attached as fields.
    fn materialize_orders(&self, account_id: &str, placed: &PlacedOrder) -> Vec<Order> {
        let payload = &placed.payload;
        let timestamp = now_millis();
        let mut orders = vec![Order {
            id: placed.id.clone(),
            exchange: self.exchange,
            account_id: account_id.to_string(),
            status: OrderStatus::Open,
            symbol: payload.symbol.clone(),
            order_type: payload.order_type,
            side: payload.side,
            price: payload.price.unwrap_or(Decimal::ZERO),
            amount: payload.amount,
            filled: Decimal::ZERO,
            remaining: payload.amount,
            reduce_only: payload.reduce_only,
            timestamp,
        }];
        if let Some(stop_loss) = payload.stop_loss {
            orders.push(Order {
                id: format!("{}{}", placed.id, STOP_LOSS_SUFFIX),
                exchange: self.exchange,
                account_id: account_id.to_string(),
                status: OrderStatus::Open,
                symbol: payload.symbol.clone(),
                order_type: OrderType::StopLoss,
                side: payload.side.flipped(),
                price: stop_loss,
                amount: payload.amount,
                filled: Decimal::ZERO,
                remaining: payload.amount,
                reduce_only: true,
                timestamp,
            });
        }
        if let Some(take_profit) = payload.take_profit {
            orders.push(Order {
                id: format!("{}{}", placed.id, TAKE_PROFIT_SUFFIX),
                exchange: self.exchange,
                account_id: account_id.to_string(),
                status: OrderStatus::Open,
                symbol: payload.symbol.clone(),
                order_type: OrderType::TakeProfit,
                side: payload.side.flipped(),
                price: take_profit,
                amount: payload.amount,
                filled: Decimal::ZERO,
                remaining: payload.amount,
                reduce_only: true,
                timestamp,
            });
        }
        orders
    }

    fn handle_updated(
        &mut self,
        request_id: u64,
        account_id: &str,
        outcomes: Vec<UpdateOutcome>,
        errors: Vec<String>,
    ) {
        for error in &errors {
            self.emit_error(format!("order update failed: {}", error));
        }
        if !self.accounts.contains_key(account_id) {
            self.respond_ok(request_id, Vec::<String>::new());
            return;
        }
        let mut ids = Vec::new();
        for outcome in &outcomes {
            match outcome {
                UpdateOutcome::Amended(update) => {
                    ids.push(update.order_id.clone());
                    if let Some(index) = self.find_order_index(account_id, &update.order_id) {
                        let path = format!(
                            "{}.private.{}.orders.{}",
                            self.exchange.key(),
                            account_id,
                            index
                        );
                        let mut changes = Vec::new();
                        if let Some(price) = update.price {
                            changes.push(ChangeCommand::update(format!("{}.price", path), price));
                        }
                        if let Some(amount) = update.amount {
                            changes.push(ChangeCommand::update(format!("{}.amount", path), amount));
                        }
                        self.emit(changes);
                    }
                }
                UpdateOutcome::Replaced { old_id, new } => {
                    ids.push(new.id.clone());
                    self.remove_order_with_legs(account_id, old_id);
                    let placed = PlacedOrder {
                        id: new.id.clone(),
                        payload: new.payload.clone(),
                    };
                    let orders_path =
                        format!("{}.private.{}.orders", self.exchange.key(), account_id);
                    let mut next = self
                        .memory
                        .read_as::<Vec<Value>>(&orders_path)
                        .map(|o| o.len())
                        .unwrap_or(0);
                    let mut changes = Vec::new();
                    for order in self.materialize_orders(account_id, &placed) {
                        changes.push(ChangeCommand::update(
                            format!("{}.{}", orders_path, next),
                            order,
                        ));
                        next += 1;
                    }
                    self.emit(changes);
                }
            }
        }
        if ids.is_empty() && !errors.is_empty() {
            self.respond_err(request_id, ExchangeError::Api(errors.join("; ")));
        } else {
            self.respond_ok(request_id, ids);
        }
    }

    fn handle_canceled(
        &mut self,
        request_id: u64,
        account_id: &str,
        canceled: Vec<String>,
        errors: Vec<String>,
    ) {
        for error in &errors {
            self.emit_error(format!("order cancel failed: {}", error));
        }
        for order_id in &canceled {
            self.remove_order_with_legs(account_id, order_id);
        }
        if canceled.is_empty() && !errors.is_empty() {
            self.respond_err(request_id, ExchangeError::Api(errors.join("; ")));
        } else {
            self.respond_ok(request_id, canceled);
        }
    }

    fn remove_order_with_legs(&mut self, account_id: &str, order_id: &str) {
        let orders_path = format!("{}.private.{}.orders", self.exchange.key(), account_id);
        let orders: Vec<Order> = self.memory.read_as(&orders_path).unwrap_or_default();
        let stop_loss_id = format!("{}{}", order_id, STOP_LOSS_SUFFIX);
        let take_profit_id = format!("{}{}", order_id, TAKE_PROFIT_SUFFIX);
        let mut doomed: Vec<usize> = orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.id == order_id || o.id == stop_loss_id || o.id == take_profit_id)
            .map(|(i, _)| i)
            .collect();
        doomed.sort_unstable();
        let changes: Vec<ChangeCommand> = doomed
            .iter()
            .enumerate()
            .map(|(already_removed, index)| {
                ChangeCommand::remove_array_element(orders_path.clone(), index - already_removed)
            })
            .collect();
        self.emit(changes);
    }

    // ================================================================
    // PAYLOAD FORMATTING
    // ================================================================

    fn build_payloads(
        &mut self,
        account_id: &str,
        orders: &[OrderRequest],
    ) -> Result<Vec<OrderPayload>, ExchangeError> {
        let attach = self.adapter.attaches_protection_to_entry();
        if attach {
            let protection_legs: usize = orders
                .iter()
                .map(|o| usize::from(o.stop_loss.is_some()) + usize::from(o.take_profit.is_some()))
                .sum();
            if protection_legs > MAX_PROTECTION_LEGS {
                return Err(ExchangeError::InvalidRequest(format!(
                    "at most {} stop-loss/take-profit legs per batch, got {}",
                    MAX_PROTECTION_LEGS, protection_legs
                )));
            }
        }

        // Venues that cannot attach protection without a position get the
        // batch's SL/TP merged onto the first entry order.
        let mut pending_stop_loss = None;
        let mut pending_take_profit = None;
        if attach {
            for order in orders {
                pending_stop_loss = pending_stop_loss.or(order.stop_loss);
                pending_take_profit = pending_take_profit.or(order.take_profit);
            }
        }

        let mut payloads = Vec::new();
        for order in orders {
            let market = self
                .read_market(&order.symbol)
                .ok_or_else(|| ExchangeError::UnknownSymbol(order.symbol.clone()))?;
            if !market.active {
                return Err(ExchangeError::InvalidRequest(format!(
                    "market {} is not active",
                    order.symbol
                )));
            }
            self.ensure_hedge_metadata(account_id, &order.symbol);
            let position_idx =
                self.position_idx_for(account_id, &order.symbol, order.side, order.reduce_only);

            let amount = math::adjust_down(order.amount, market.precision.amount);
            if amount < market.limits.amount.min {
                return Err(ExchangeError::InvalidRequest(format!(
                    "amount {} below market minimum {} for {}",
                    amount, market.limits.amount.min, order.symbol
                )));
            }
            let price = order
                .price
                .map(|p| math::adjust(p, market.precision.price));

            for lot in split_lots(amount, market.limits.amount.max) {
                let mut payload = OrderPayload {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    order_type: order.order_type,
                    price,
                    amount: lot,
                    reduce_only: order.reduce_only,
                    position_idx,
                    stop_loss: None,
                    take_profit: None,
                };
                if attach && !order.reduce_only {
                    payload.stop_loss = pending_stop_loss.take();
                    payload.take_profit = pending_take_profit.take();
                }
                payloads.push(payload);
            }

            if !attach {
                // Standalone protection orders, reduce-only by definition.
                let protection_idx = self.position_idx_for(
                    account_id,
                    &order.symbol,
                    order.side.flipped(),
                    true,
                );
                if let Some(stop_loss) = order.stop_loss {
                    payloads.push(OrderPayload {
                        symbol: order.symbol.clone(),
                        side: order.side.flipped(),
                        order_type: OrderType::StopLoss,
                        price: Some(math::adjust(stop_loss, market.precision.price)),
                        amount,
                        reduce_only: true,
                        position_idx: protection_idx,
                        stop_loss: None,
                        take_profit: None,
                    });
                }
                if let Some(take_profit) = order.take_profit {
                    payloads.push(OrderPayload {
                        symbol: order.symbol.clone(),
                        side: order.side.flipped(),
                        order_type: OrderType::TakeProfit,
                        price: Some(math::adjust(take_profit, market.precision.price)),
                        amount,
                        reduce_only: true,
                        position_idx: protection_idx,
                        stop_loss: None,
                        take_profit: None,
                    });
                }
            }
        }
        Ok(payloads)
    }

    /// Position index tagging: 0 in one-way mode; in hedge mode an entry
    /// order tags the side it opens, a reduce-only order tags the side it
    /// closes.
    fn position_idx_for(
        &self,
        account_id: &str,
        symbol: &str,
        side: OrderSide,
        reduce_only: bool,
    ) -> u8 {
        let hedged = self
            .memory
            .read_as::<bool>(&format!(
                "{}.private.{}.metadata.hedgedPosition.{}",
                self.exchange.key(),
                account_id,
                symbol
            ))
            .unwrap_or(false);
        if !hedged {
            return 0;
        }
        let opens_long = side == OrderSide::Buy;
        if reduce_only ^ opens_long {
            1
        } else {
            2
        }
    }

    fn ensure_hedge_metadata(&mut self, account_id: &str, symbol: &str) {
        let path = format!(
            "{}.private.{}.metadata.hedgedPosition.{}",
            self.exchange.key(),
            account_id,
            symbol
        );
        if self.memory.read(&path).is_none() {
            // No position seen for this symbol yet: one-way until a push
            // says otherwise.
            self.emit(vec![ChangeCommand::update(path, false)]);
        }
    }

    fn order_from_push(&self, account_id: &str, push: &OrderPush) -> Order {
        let filled = push.executed.max(Decimal::ZERO);
        Order {
            id: push.id.clone(),
            exchange: self.exchange,
            account_id: account_id.to_string(),
            status: match push.status {
                RawOrderStatus::Filled => OrderStatus::Filled,
                RawOrderStatus::Canceled => OrderStatus::Canceled,
                RawOrderStatus::Rejected | RawOrderStatus::Expired => OrderStatus::Closed,
                RawOrderStatus::New | RawOrderStatus::PartiallyFilled => OrderStatus::Open,
            },
            symbol: push.symbol.clone(),
            order_type: push.order_type,
            side: push.side,
            price: push.price,
            amount: push.amount,
            filled,
            remaining: math::subtract(push.amount, filled).max(Decimal::ZERO),
            reduce_only: push.reduce_only,
            timestamp: push.timestamp,
        }
    }

    // ================================================================
    // HELPERS
    // ================================================================

    fn read_market(&self, symbol: &str) -> Option<Market> {
        self.memory
            .read_as(&format!("{}.public.markets.{}", self.exchange.key(), symbol))
    }

    fn read_metadata(&self, account_id: &str, symbol: &str) -> Option<PositionMetadata> {
        let base = format!("{}.private.{}.metadata", self.exchange.key(), account_id);
        let leverage: Decimal = self
            .memory
            .read_as(&format!("{}.leverage.{}", base, symbol))?;
        let is_hedged: bool = self
            .memory
            .read_as(&format!("{}.hedgedPosition.{}", base, symbol))?;
        Some(PositionMetadata {
            leverage,
            is_hedged,
        })
    }

    fn find_order(&self, account_id: &str, order_id: &str) -> Option<Order> {
        let orders: Vec<Order> = self
            .memory
            .read_as(&format!(
                "{}.private.{}.orders",
                self.exchange.key(),
                account_id
            ))
            .unwrap_or_default();
        orders.into_iter().find(|o| o.id == order_id)
    }

    fn find_order_index(&self, account_id: &str, order_id: &str) -> Option<usize> {
        let orders: Vec<Order> = self
            .memory
            .read_as(&format!(
                "{}.private.{}.orders",
                self.exchange.key(),
                account_id
            ))
            .unwrap_or_default();
        orders.iter().position(|o| o.id == order_id)
    }

    fn known_symbols(&self) -> Vec<String> {
        self.memory
            .read(&format!("{}.public.markets", self.exchange.key()))
            .and_then(Value::as_object)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn send_kline_subscription(&self, symbol: &str, timeframe: &str, subscribe: bool) {
        if let (Some(public), Some(message)) = (
            &self.public,
            self.adapter.kline_subscription(symbol, timeframe, subscribe),
        ) {
            let _ = public.socket.send(message);
        }
    }

    fn send_book_subscription(&self, symbol: &str, subscribe: bool) {
        if let (Some(public), Some(message)) = (
            &self.public,
            self.adapter.book_subscription(symbol, subscribe),
        ) {
            let _ = public.socket.send(message);
        }
    }

    fn send_ping(&mut self) {
        if let (Some(public), Some(ping)) = (&self.public, self.adapter.ping_message()) {
            self.last_ping = Some(Instant::now());
            let _ = public.socket.send(ping);
        }
    }

    fn emit(&mut self, changes: Vec<ChangeCommand>) {
        if changes.is_empty() {
            return;
        }
        self.memory.apply_changes(&changes);
        let _ = self.events.send(WorkerEvent::Update { changes });
    }

    fn respond_ok<T: serde::Serialize>(&self, request_id: u64, data: T) {
        let _ = self.events.send(WorkerEvent::ok(request_id, data));
    }

    fn respond_err(&self, request_id: u64, error: impl std::fmt::Display) {
        let _ = self.events.send(WorkerEvent::err(request_id, error));
    }

    fn emit_error(&self, message: String) {
        warn!(exchange = %self.exchange, "{}", message);
        let _ = self.events.send(WorkerEvent::Error { error: message });
    }

    fn shutdown(&mut self) {
        info!(exchange = %self.exchange, "worker stopping");
        for (_, runtime) in self.accounts.drain() {
            runtime.teardown();
        }
        if let Some(public) = self.public.take() {
            public.socket.close();
            public.pump.abort();
        }
        self.started = false;
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &MemoryStore {
        &self.memory
    }
}

/// Splits one logical amount into venue-submittable lots: full-size lots at
/// the market maximum with any remainder as a final smaller lot.
fn split_lots(amount: Decimal, max: Decimal) -> Vec<Decimal> {
    if max <= Decimal::ZERO || amount <= max {
        return vec![amount];
    }
    let mut lots = Vec::new();
    let mut remaining = amount;
    while remaining > max {
        lots.push(max);
        remaining = math::subtract(remaining, max);
    }
    if remaining > Decimal::ZERO {
        lots.push(remaining);
    }
    lots
}

/// Places one payload with a one-shot corrective retry on a position-mode
/// mismatch: the order is re-tagged for the other mode and resubmitted once.
async fn place_with_retry(
    adapter: &dyn ExchangeAdapter,
    account: &Account,
    payload: OrderPayload,
) -> Result<PlacedOrder, ExchangeError> {
    match adapter.place_order(account, &payload).await {
        Ok(id) => Ok(PlacedOrder { id, payload }),
        Err(ExchangeError::PositionModeMismatch(reason)) => {
            let mut retagged = payload.clone();
            retagged.position_idx = if payload.position_idx == 0 {
                if payload.side == OrderSide::Buy {
                    1
                } else {
                    2
                }
            } else {
                0
            };
            warn!(
                symbol = %payload.symbol,
                from = payload.position_idx,
                to = retagged.position_idx,
                %reason,
                "position mode mismatch, retrying with re-tagged order"
            );
            let id = adapter.place_order(account, &retagged).await?;
            Ok(PlacedOrder {
                id,
                payload: retagged,
            })
        }
        Err(e) => Err(e),
    }
}

fn spawn_public_pump(
    socket: Arc<ReconnectingSocket>,
    tx: mpsc::UnboundedSender<InternalEvent>,
) -> JoinHandle<()> {
    let mut events = socket.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if tx.send(InternalEvent::Public(event)).is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "public stream pump lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_private_pump(
    adapter: Arc<dyn ExchangeAdapter>,
    account: Account,
    socket: Arc<ReconnectingSocket>,
    listening: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<InternalEvent>,
) -> JoinHandle<()> {
    let mut events = socket.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Open) => {
                    // Auth handshake and private subscriptions go out on
                    // every (re)connect.
                    match adapter.private_subscriptions(&account).await {
                        Ok(messages) => {
                            for message in messages {
                                let _ = socket.send(message);
                            }
                        }
                        Err(e) => {
                            warn!(account = %account.id, error = %e, "private auth failed");
                        }
                    }
                }
                Ok(TransportEvent::Message(text)) => {
                    // Deferred activation: pushes arriving before the HTTP
                    // snapshot is applied would corrupt add/update decisions.
                    if listening.load(Ordering::SeqCst)
                        && tx
                            .send(InternalEvent::PrivateMessage {
                                account_id: account.id.clone(),
                                text,
                            })
                            .is_err()
                    {
                        return;
                    }
                }
                Ok(TransportEvent::Closed) => {
                    if socket.is_closed() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(account = %account.id, skipped, "private stream pump lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn spawn_balance_poller(
    adapter: Arc<dyn ExchangeAdapter>,
    account: Account,
    tx: mpsc::UnboundedSender<InternalEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = BALANCE_POLL_INTERVAL;
        loop {
            tokio::time::sleep(delay).await;
            match adapter.fetch_balance(&account).await {
                Ok(balance) => {
                    delay = BALANCE_POLL_INTERVAL;
                    if tx
                        .send(InternalEvent::BalancePolled {
                            account_id: account.id.clone(),
                            balance,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    // Polling never stops on error; it backs off and retries.
                    warn!(account = %account.id, error = %e, "balance poll failed");
                    delay = BALANCE_POLL_BACKOFF;
                }
            }
        }
    })
}

fn spawn_session_refresher(
    adapter: Arc<dyn ExchangeAdapter>,
    account: Account,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = adapter.refresh_private_session(&account).await {
                warn!(account = %account.id, error = %e, "private session refresh failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::testkit::MockAdapter;
    use rust_decimal_macros::dec;

    fn test_worker() -> (ExchangeWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = ExchangeWorker::new(Arc::new(MockAdapter::default()), tx);
        (worker, rx)
    }

    fn seed_account(worker: &mut ExchangeWorker, account_id: &str) {
        let ex = worker.exchange.key().to_string();
        worker.emit(vec![ChangeCommand::update(
            ex.clone(),
            json!({
                "loaded": { "markets": true, "tickers": true },
                "public": { "latency": 0, "markets": {}, "tickers": {} },
                "private": {}
            }),
        )]);
        worker.emit(vec![ChangeCommand::update(
            format!("{}.private.{}", ex, account_id),
            json!({
                "balance": Balance::default(),
                "positions": [],
                "orders": [],
                "fills": [],
                "notifications": [],
                "metadata": { "leverage": {}, "hedgedPosition": {} }
            }),
        )]);
    }

    fn order_push(id: &str, status: RawOrderStatus, executed: Decimal) -> OrderPush {
        OrderPush {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            status,
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: dec!(100),
            amount: dec!(2),
            executed,
            reduce_only: false,
            timestamp: 1,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn test_zero_value_partial_fill_is_discarded() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        let mut push = order_push("o1", RawOrderStatus::PartiallyFilled, dec!(1));
        push.price = Decimal::ZERO;
        push.amount = Decimal::ZERO;
        worker.reconcile_order_push("a1", push);
        let orders: Vec<Order> = worker
            .memory()
            .read_as("bybit.private.a1.orders")
            .unwrap();
        assert!(orders.is_empty());
    }

    #[tokio::test]
    async fn test_new_then_filled_removes_order_and_appends_one_fill() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        worker.reconcile_order_push("a1", order_push("o1", RawOrderStatus::New, Decimal::ZERO));
        let orders: Vec<Order> = worker
            .memory()
            .read_as("bybit.private.a1.orders")
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Open);

        worker.reconcile_order_push("a1", order_push("o1", RawOrderStatus::Filled, dec!(2)));
        let orders: Vec<Order> = worker
            .memory()
            .read_as("bybit.private.a1.orders")
            .unwrap();
        assert!(orders.is_empty());
        let fills: Vec<Fill> = worker.memory().read_as("bybit.private.a1.fills").unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].amount, dec!(2));
        let notifications: Vec<Value> = worker
            .memory()
            .read_as("bybit.private.a1.notifications")
            .unwrap();
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_status_removes_protection_legs() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        worker.reconcile_order_push("a1", order_push("o1", RawOrderStatus::New, Decimal::ZERO));
        worker.reconcile_order_push(
            "a1",
            order_push("o1__stop_loss", RawOrderStatus::New, Decimal::ZERO),
        );
        worker.reconcile_order_push(
            "a1",
            order_push("o1__take_profit", RawOrderStatus::New, Decimal::ZERO),
        );
        worker.reconcile_order_push("a1", order_push("o1", RawOrderStatus::Canceled, Decimal::ZERO));
        let orders: Vec<Order> = worker
            .memory()
            .read_as("bybit.private.a1.orders")
            .unwrap();
        assert!(orders.is_empty(), "legs must go with the parent: {:?}", orders);
    }

    #[tokio::test]
    async fn test_partial_fill_updates_in_place_and_notifies_increment() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        worker.reconcile_order_push("a1", order_push("o1", RawOrderStatus::New, Decimal::ZERO));
        worker.reconcile_order_push(
            "a1",
            order_push("o1", RawOrderStatus::PartiallyFilled, dec!(0.5)),
        );
        worker.reconcile_order_push(
            "a1",
            order_push("o1", RawOrderStatus::PartiallyFilled, dec!(1.25)),
        );
        let orders: Vec<Order> = worker
            .memory()
            .read_as("bybit.private.a1.orders")
            .unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].filled, dec!(1.25));
        assert_eq!(orders[0].remaining, dec!(0.75));
        let notifications: Vec<Value> = worker
            .memory()
            .read_as("bybit.private.a1.notifications")
            .unwrap();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[1]["amount"], json!("0.75"));
    }

    #[tokio::test]
    async fn test_zero_size_position_is_removed() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        let push = PositionPush {
            symbol: "BTCUSDT".to_string(),
            side: exchange_common::types::PositionSide::Long,
            contracts: dec!(1),
            entry_price: dec!(100),
            notional: dec!(100),
            leverage: dec!(5),
            upnl: Decimal::ZERO,
            rpnl: Decimal::ZERO,
            liquidation_price: dec!(50),
            is_hedged: false,
        };
        worker.reconcile_position_push("a1", push.clone());
        let positions: Vec<Position> = worker
            .memory()
            .read_as("bybit.private.a1.positions")
            .unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(
            worker
                .memory()
                .read_as::<Decimal>("bybit.private.a1.metadata.leverage.BTCUSDT"),
            Some(dec!(5))
        );

        let mut flat = push;
        flat.contracts = Decimal::ZERO;
        worker.reconcile_position_push("a1", flat);
        let positions: Vec<Position> = worker
            .memory()
            .read_as("bybit.private.a1.positions")
            .unwrap();
        assert!(positions.is_empty());
    }

    #[test]
    fn test_split_lots() {
        assert_eq!(split_lots(dec!(25), dec!(10)), vec![dec!(10), dec!(10), dec!(5)]);
        assert_eq!(split_lots(dec!(10), dec!(10)), vec![dec!(10)]);
        assert_eq!(split_lots(dec!(3), Decimal::ZERO), vec![dec!(3)]);
    }

    #[tokio::test]
    async fn test_build_payloads_rejects_unknown_symbol() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        let orders = vec![OrderRequest {
            symbol: "DOGEUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(1)),
            amount: dec!(1),
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
        }];
        assert!(matches!(
            worker.build_payloads("a1", &orders),
            Err(ExchangeError::UnknownSymbol(_))
        ));
    }

    #[tokio::test]
    async fn test_build_payloads_splits_lots_and_merges_protection() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        let market = crate::exchange::testkit::market("BTCUSDT", dec!(10));
        worker.emit(vec![ChangeCommand::update(
            "bybit.public.markets.BTCUSDT",
            &market,
        )]);
        let orders = vec![OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(100)),
            amount: dec!(25),
            reduce_only: false,
            stop_loss: Some(dec!(90)),
            take_profit: Some(dec!(120)),
        }];
        let payloads = worker.build_payloads("a1", &orders).unwrap();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0].amount, dec!(10));
        assert_eq!(payloads[2].amount, dec!(5));
        // MockAdapter attaches protection on entry; only the first lot
        // carries the merged legs.
        assert_eq!(payloads[0].stop_loss, Some(dec!(90)));
        assert_eq!(payloads[0].take_profit, Some(dec!(120)));
        assert!(payloads[1].stop_loss.is_none());
        assert!(payloads[2].take_profit.is_none());
    }

    #[tokio::test]
    async fn test_too_many_protection_legs_is_an_error() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        let market = crate::exchange::testkit::market("BTCUSDT", dec!(100));
        worker.emit(vec![ChangeCommand::update(
            "bybit.public.markets.BTCUSDT",
            &market,
        )]);
        let order = |sl: Option<Decimal>, tp: Option<Decimal>| OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(100)),
            amount: dec!(1),
            reduce_only: false,
            stop_loss: sl,
            take_profit: tp,
        };
        let orders = vec![
            order(Some(dec!(90)), Some(dec!(110))),
            order(Some(dec!(91)), None),
        ];
        assert!(matches!(
            worker.build_payloads("a1", &orders),
            Err(ExchangeError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_hedge_mode_position_tagging() {
        let (mut worker, _rx) = test_worker();
        seed_account(&mut worker, "a1");
        worker.emit(vec![ChangeCommand::update(
            "bybit.private.a1.metadata.hedgedPosition.BTCUSDT",
            true,
        )]);
        // Entry orders tag the side they open.
        assert_eq!(worker.position_idx_for("a1", "BTCUSDT", OrderSide::Buy, false), 1);
        assert_eq!(worker.position_idx_for("a1", "BTCUSDT", OrderSide::Sell, false), 2);
        // Reduce-only orders tag the side they close.
        assert_eq!(worker.position_idx_for("a1", "BTCUSDT", OrderSide::Sell, true), 1);
        assert_eq!(worker.position_idx_for("a1", "BTCUSDT", OrderSide::Buy, true), 2);
        // One-way mode always tags zero.
        assert_eq!(worker.position_idx_for("a1", "ETHUSDT", OrderSide::Buy, false), 0);
    }
}
