//! In-memory stand-ins for the broker, quote feed, news feed and
//! repositories. Used when running in mock mode and throughout the tests.

use crate::domain::errors::BrokerError;
use crate::domain::news::ScoredSignal;
use crate::domain::ports::{
    BrokerageService, NewsFeed, OrderNotifier, QuoteService, SentimentScorer,
};
use crate::domain::repositories::{
    BalanceAuditRepository, CredentialStore, PendingOrderRepository, TradeRepository,
};
use crate::domain::types::{
    AccountFunds, BalanceSnapshot, Candle, Credential, OrderFill, PendingOrder, PositionSnapshot,
    TradeRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::info;
use uuid::Uuid;

// Mock brokerage

#[derive(Default)]
struct MockBrokerState {
    funds: Option<AccountFunds>,
    positions: Vec<PositionSnapshot>,
    fills: Vec<OrderFill>,
    buys: Vec<(String, u32, Decimal)>,
    sells: Vec<(String, u32)>,
    fail_fetches: Option<BrokerError>,
    fail_orders: Option<BrokerError>,
}

/// Scriptable brokerage. Fetch counters let tests assert cache behavior;
/// injected errors stay active until cleared.
#[derive(Clone, Default)]
pub struct MockBrokerageService {
    state: Arc<RwLock<MockBrokerState>>,
    balance_calls: Arc<AtomicUsize>,
    position_calls: Arc<AtomicUsize>,
}

impl MockBrokerageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_funds(&self, funds: AccountFunds) {
        self.state.write().await.funds = Some(funds);
    }

    pub async fn set_positions(&self, positions: Vec<PositionSnapshot>) {
        self.state.write().await.positions = positions;
    }

    pub async fn set_fills(&self, fills: Vec<OrderFill>) {
        self.state.write().await.fills = fills;
    }

    pub async fn fail_fetches_with(&self, error: BrokerError) {
        self.state.write().await.fail_fetches = Some(error);
    }

    pub async fn fail_orders_with(&self, error: BrokerError) {
        self.state.write().await.fail_orders = Some(error);
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.write().await;
        state.fail_fetches = None;
        state.fail_orders = None;
    }

    pub async fn buys(&self) -> Vec<(String, u32, Decimal)> {
        self.state.read().await.buys.clone()
    }

    pub async fn sells(&self) -> Vec<(String, u32)> {
        self.state.read().await.sells.clone()
    }

    pub fn balance_fetches(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn position_fetches(&self) -> usize {
        self.position_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerageService for MockBrokerageService {
    async fn fetch_balance(&self) -> Result<AccountFunds, BrokerError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().await;
        if let Some(e) = &state.fail_fetches {
            return Err(e.clone());
        }
        Ok(state.funds.clone().unwrap_or(AccountFunds {
            cash: Decimal::ZERO,
            buying_power: Decimal::ZERO,
        }))
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError> {
        self.position_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().await;
        if let Some(e) = &state.fail_fetches {
            return Err(e.clone());
        }
        Ok(state.positions.clone())
    }

    async fn place_buy(
        &self,
        ticker: &str,
        quantity: u32,
        price: Decimal,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        if let Some(e) = &state.fail_orders {
            return Err(e.clone());
        }
        info!("MockBroker: BUY {quantity} {ticker} @ {price}");
        state.buys.push((ticker.to_string(), quantity, price));
        Ok(())
    }

    async fn place_sell(&self, ticker: &str, quantity: u32) -> Result<(), BrokerError> {
        let mut state = self.state.write().await;
        if let Some(e) = &state.fail_orders {
            return Err(e.clone());
        }
        info!("MockBroker: SELL {quantity} {ticker}");
        state.sells.push((ticker.to_string(), quantity));
        Ok(())
    }

    async fn fetch_fills(
        &self,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<Vec<OrderFill>, BrokerError> {
        let state = self.state.read().await;
        if let Some(e) = &state.fail_fetches {
            return Err(e.clone());
        }
        Ok(state.fills.clone())
    }
}

// Mock quote feed

#[derive(Clone, Default)]
pub struct MockQuoteService {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    candles: Arc<RwLock<HashMap<String, Vec<Candle>>>>,
    fail: Arc<RwLock<Option<BrokerError>>>,
    quote_calls: Arc<AtomicUsize>,
}

impl MockQuoteService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, ticker: &str, price: Decimal) {
        self.prices.write().await.insert(ticker.to_string(), price);
    }

    pub async fn set_candles(&self, ticker: &str, candles: Vec<Candle>) {
        self.candles
            .write()
            .await
            .insert(ticker.to_string(), candles);
    }

    pub async fn fail_with(&self, error: BrokerError) {
        *self.fail.write().await = Some(error);
    }

    pub async fn clear_failure(&self) {
        *self.fail.write().await = None;
    }

    pub fn quote_fetches(&self) -> usize {
        self.quote_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteService for MockQuoteService {
    async fn get_quote(&self, ticker: &str) -> Result<Decimal, BrokerError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.fail.read().await.as_ref() {
            return Err(e.clone());
        }
        self.prices
            .read()
            .await
            .get(ticker)
            .copied()
            .ok_or_else(|| BrokerError::invalid(format!("no mock price for {ticker}")))
    }

    async fn get_quotes(
        &self,
        tickers: &[String],
    ) -> Result<HashMap<String, Decimal>, BrokerError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.fail.read().await.as_ref() {
            return Err(e.clone());
        }
        let prices = self.prices.read().await;
        Ok(tickers
            .iter()
            .filter_map(|t| prices.get(t).map(|p| (t.clone(), *p)))
            .collect())
    }

    async fn get_daily_candles(
        &self,
        ticker: &str,
        _days: u32,
    ) -> Result<Vec<Candle>, BrokerError> {
        if let Some(e) = self.fail.read().await.as_ref() {
            return Err(e.clone());
        }
        Ok(self
            .candles
            .read()
            .await
            .get(ticker)
            .cloned()
            .unwrap_or_default())
    }
}

// Mock news feed

/// Push-driven feed for mock mode: events published here fan out to every
/// subscriber.
#[derive(Clone, Default)]
pub struct MockNewsFeed {
    subscribers: Arc<RwLock<Vec<Sender<ScoredSignal>>>>,
    scorer: Option<Arc<dyn SentimentScorer>>,
}

impl MockNewsFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scorer(scorer: Arc<dyn SentimentScorer>) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            scorer: Some(scorer),
        }
    }

    pub async fn publish(&self, signal: ScoredSignal) {
        let mut subs = self.subscribers.write().await;
        let mut active = Vec::new();
        for tx in subs.iter() {
            if tx.send(signal.clone()).await.is_ok() {
                active.push(tx.clone());
            }
        }
        *subs = active;
    }

    /// Score a raw event with the configured scorer and publish it.
    pub async fn publish_event(&self, event: crate::domain::news::NewsEvent) {
        if let Some(scorer) = &self.scorer {
            self.publish(scorer.score(&event)).await;
        }
    }
}

#[async_trait]
impl NewsFeed for MockNewsFeed {
    async fn subscribe(&self) -> Result<Receiver<ScoredSignal>> {
        let (tx, rx) = mpsc::channel(100);
        self.subscribers.write().await.push(tx);
        Ok(rx)
    }
}

// In-memory repositories

#[derive(Clone, Default)]
pub struct InMemoryTradeRepository {
    trades: Arc<RwLock<Vec<TradeRecord>>>,
}

impl InMemoryTradeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TradeRepository for InMemoryTradeRepository {
    async fn append(&self, record: &TradeRecord) -> Result<()> {
        let mut trades = self.trades.write().await;
        if !trades.iter().any(|t| t.id == record.id) {
            trades.push(record.clone());
        }
        Ok(())
    }

    async fn find_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        Ok(self
            .trades
            .read()
            .await
            .iter()
            .filter(|t| t.executed_at >= cutoff)
            .cloned()
            .collect())
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let trades = self.trades.read().await;
        let mut sorted: Vec<TradeRecord> = trades.clone();
        sorted.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        sorted.truncate(limit);
        Ok(sorted)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.trades.read().await.len())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryPendingOrderRepository {
    orders: Arc<RwLock<Vec<PendingOrder>>>,
}

impl InMemoryPendingOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingOrderRepository for InMemoryPendingOrderRepository {
    async fn insert(&self, order: &PendingOrder) -> Result<()> {
        let mut orders = self.orders.write().await;
        if !orders.iter().any(|o| o.id == order.id) {
            orders.push(order.clone());
        }
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.orders.write().await.retain(|o| o.id != id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PendingOrder>> {
        Ok(self.orders.read().await.clone())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBalanceAuditRepository {
    entries: Arc<RwLock<Vec<(String, BalanceSnapshot)>>>,
}

impl InMemoryBalanceAuditRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<(String, BalanceSnapshot)> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl BalanceAuditRepository for InMemoryBalanceAuditRepository {
    async fn record(&self, account_id: &str, snapshot: &BalanceSnapshot) -> Result<()> {
        self.entries
            .write()
            .await
            .push((account_id.to_string(), snapshot.clone()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    credentials: Arc<RwLock<HashMap<String, Credential>>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn load(&self, account_id: &str) -> Result<Option<Credential>> {
        Ok(self.credentials.read().await.get(account_id).cloned())
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        self.credentials
            .write()
            .await
            .insert(credential.account_id.clone(), credential.clone());
        Ok(())
    }
}

// Order notifier

/// Collects executed-order notifications for assertions.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notified: Arc<RwLock<Vec<TradeRecord>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn notified(&self) -> Vec<TradeRecord> {
        self.notified.read().await.clone()
    }
}

#[async_trait]
impl OrderNotifier for RecordingNotifier {
    async fn order_executed(&self, record: &TradeRecord) {
        self.notified.write().await.push(record.clone());
    }
}
