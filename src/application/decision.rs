//! Turns scored news into orders.
//!
//! The decision over (signal, market session, account state) has four
//! outcomes: drop it, enqueue it for market open, execute a buy now, or
//! record it for a human to review. Duplicate events are dropped before
//! any other check against a bounded id set with oldest-first eviction.

use crate::application::account_cache::AccountStateCache;
use crate::application::position_book::PositionBook;
use crate::application::scheduler::PendingOrderBook;
use crate::domain::errors::BrokerError;
use crate::domain::market_hours::MarketSession;
use crate::domain::news::ScoredSignal;
use crate::domain::ports::{BrokerageService, OrderNotifier, QuoteService};
use crate::domain::repositories::TradeRepository;
use crate::domain::types::{OrderSide, PendingOrder, PositionSnapshot, TradeRecord};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

const MANUAL_SIGNAL_LIMIT: usize = 100;

/// Thresholds and sizing parameters for the decision rules.
#[derive(Debug, Clone)]
pub struct TradeRules {
    /// Minimum signal score considered at all; below it nothing happens.
    pub pending_threshold: f64,
    /// Score at or above which an order is placed without a human.
    pub execute_threshold: f64,
    /// Fraction of buying power committed per order.
    pub position_fraction: Decimal,
    /// Hard cap on the dollar size of one order.
    pub max_position_usd: Decimal,
}

/// What `handle_signal` decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoAction,
    EnqueuedPending,
    ExecutedBuy,
    SimulatedBuy,
    ManualSignal,
}

/// Bounded set of already-processed news ids, oldest evicted first.
pub struct AnalyzedNewsSet {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl AnalyzedNewsSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns false when the id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// `quantity = floor(min(max_position, buying_power * fraction) / price)`.
/// Zero means the order is abandoned.
pub fn order_quantity(buying_power: Decimal, rules: &TradeRules, price: Decimal) -> u32 {
    if price <= Decimal::ZERO {
        return 0;
    }
    let budget = (buying_power * rules.position_fraction).min(rules.max_position_usd);
    (budget / price).floor().to_u32().unwrap_or(0)
}

pub struct DecisionEngine {
    rules: TradeRules,
    simulation: Arc<AtomicBool>,
    broker: Arc<dyn BrokerageService>,
    quotes: Arc<dyn QuoteService>,
    cache: Arc<AccountStateCache>,
    positions: PositionBook,
    pending: PendingOrderBook,
    trades: Arc<dyn TradeRepository>,
    notifier: Arc<dyn OrderNotifier>,
    seen: Mutex<AnalyzedNewsSet>,
    manual_signals: RwLock<Vec<ScoredSignal>>,
}

impl DecisionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rules: TradeRules,
        simulation: Arc<AtomicBool>,
        broker: Arc<dyn BrokerageService>,
        quotes: Arc<dyn QuoteService>,
        cache: Arc<AccountStateCache>,
        positions: PositionBook,
        pending: PendingOrderBook,
        trades: Arc<dyn TradeRepository>,
        notifier: Arc<dyn OrderNotifier>,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            rules,
            simulation,
            broker,
            quotes,
            cache,
            positions,
            pending,
            trades,
            notifier,
            seen: Mutex::new(AnalyzedNewsSet::new(dedup_capacity)),
            manual_signals: RwLock::new(Vec::new()),
        }
    }

    pub fn rules(&self) -> &TradeRules {
        &self.rules
    }

    pub fn simulation_enabled(&self) -> bool {
        self.simulation.load(Ordering::SeqCst)
    }

    pub fn set_simulation(&self, enabled: bool) {
        self.simulation.store(enabled, Ordering::SeqCst);
        info!("Decision: simulation mode {}", if enabled { "on" } else { "off" });
    }

    /// Signals that met the pending threshold but not the execute one,
    /// newest first, for operator review.
    pub async fn manual_signals(&self) -> Vec<ScoredSignal> {
        self.manual_signals.read().await.clone()
    }

    pub async fn handle_signal(&self, signal: ScoredSignal, session: MarketSession) -> Decision {
        if !self.seen.lock().await.insert(signal.id()) {
            debug!("Decision: duplicate news {}, skipping", signal.id());
            return Decision::NoAction;
        }

        let Some(ticker) = signal.ticker.clone() else {
            debug!(
                "Decision: no instrument resolved for '{}'",
                signal.event.title
            );
            return Decision::NoAction;
        };

        if signal.signal_score < self.rules.pending_threshold {
            debug!(
                "Decision: {} scored {:.1}, below pending threshold",
                ticker, signal.signal_score
            );
            return Decision::NoAction;
        }

        if !session.is_tradable() {
            return self.enqueue_for_open(&ticker, &signal).await;
        }

        if signal.signal_score >= self.rules.execute_threshold {
            self.execute_buy(&ticker, &signal).await
        } else {
            info!(
                "Decision: {} scored {:.1}, holding for manual review",
                ticker, signal.signal_score
            );
            let mut manual = self.manual_signals.write().await;
            manual.insert(0, signal);
            manual.truncate(MANUAL_SIGNAL_LIMIT);
            Decision::ManualSignal
        }
    }

    async fn enqueue_for_open(&self, ticker: &str, signal: &ScoredSignal) -> Decision {
        let price = match self.quotes.get_quote(ticker).await {
            Ok(price) => price,
            Err(e) => {
                warn!("Decision: cannot size pending order for {ticker}, quote failed: {e}");
                return Decision::NoAction;
            }
        };

        let balance = self.cache.get_balance().await;
        let quantity = order_quantity(balance.buying_power, &self.rules, price);
        if quantity == 0 {
            info!("Decision: {ticker} sizes to zero shares at {price}, abandoning");
            return Decision::NoAction;
        }

        let order = PendingOrder::new(ticker, quantity, price, signal_reason(signal));
        info!(
            "Decision: market closed, queued {quantity} {ticker} @ {price} for next open"
        );
        self.pending.enqueue(order).await;
        Decision::EnqueuedPending
    }

    async fn execute_buy(&self, ticker: &str, signal: &ScoredSignal) -> Decision {
        if self.positions.contains(ticker).await {
            info!("Decision: already holding {ticker}, skipping auto-buy");
            return Decision::NoAction;
        }

        let price = match self.quotes.get_quote(ticker).await {
            Ok(price) => price,
            Err(e) => {
                warn!("Decision: cannot price {ticker}, quote failed: {e}");
                return Decision::NoAction;
            }
        };

        let balance = self.cache.get_balance().await;
        let quantity = order_quantity(balance.buying_power, &self.rules, price);
        if quantity == 0 {
            info!("Decision: {ticker} sizes to zero shares at {price}, abandoning");
            return Decision::NoAction;
        }

        let reason = signal_reason(signal);

        if self.simulation_enabled() {
            let record = TradeRecord::new(
                ticker,
                OrderSide::Buy,
                quantity,
                price,
                format!("simulated: {reason}"),
            );
            if let Err(e) = self.trades.append(&record).await {
                warn!("Decision: simulated trade record failed: {e}");
            }
            info!("Decision: simulation, recorded buy {quantity} {ticker} @ {price}");
            return Decision::SimulatedBuy;
        }

        match self.broker.place_buy(ticker, quantity, price).await {
            Ok(()) => {
                self.positions
                    .insert(PositionSnapshot::new(ticker, quantity, price, price, Utc::now()))
                    .await;
                let record =
                    TradeRecord::new(ticker, OrderSide::Buy, quantity, price, reason.clone());
                if let Err(e) = self.trades.append(&record).await {
                    warn!("Decision: trade record failed for {}: {e}", record.id);
                }
                self.notifier.order_executed(&record).await;
                self.cache.invalidate().await;
                info!("Decision: bought {quantity} {ticker} @ {price} ({reason})");
                Decision::ExecutedBuy
            }
            Err(e) => {
                error!("Decision: buy order for {ticker} failed: {e}");
                Decision::NoAction
            }
        }
    }

    /// Operator-triggered buy at the current quote. Honors simulation mode.
    pub async fn manual_buy(
        &self,
        ticker: &str,
        quantity: Option<u32>,
    ) -> Result<TradeRecord, BrokerError> {
        let price = self.quotes.get_quote(ticker).await?;
        let quantity = match quantity {
            Some(q) if q > 0 => q,
            Some(_) => return Err(BrokerError::invalid("quantity must be at least 1")),
            None => {
                let balance = self.cache.get_balance().await;
                let sized = order_quantity(balance.buying_power, &self.rules, price);
                if sized == 0 {
                    return Err(BrokerError::invalid(format!(
                        "{ticker} sizes to zero shares at {price}"
                    )));
                }
                sized
            }
        };

        if self.simulation_enabled() {
            let record = TradeRecord::new(
                ticker,
                OrderSide::Buy,
                quantity,
                price,
                "simulated: manual buy",
            );
            if let Err(e) = self.trades.append(&record).await {
                warn!("Decision: simulated trade record failed: {e}");
            }
            return Ok(record);
        }

        self.broker.place_buy(ticker, quantity, price).await?;
        self.positions
            .insert(PositionSnapshot::new(ticker, quantity, price, price, Utc::now()))
            .await;
        let record = TradeRecord::new(ticker, OrderSide::Buy, quantity, price, "manual buy");
        if let Err(e) = self.trades.append(&record).await {
            warn!("Decision: trade record failed for {}: {e}", record.id);
        }
        self.notifier.order_executed(&record).await;
        self.cache.invalidate().await;
        info!("Decision: manual buy {quantity} {ticker} @ {price}");
        Ok(record)
    }
}

fn signal_reason(signal: &ScoredSignal) -> String {
    let title: String = signal.event.title.chars().take(80).collect();
    format!("news {:.1}: {title}", signal.signal_score)
}
