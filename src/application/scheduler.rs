//! Pending-order bookkeeping and replay at market open.
//!
//! Buy decisions made while the market is closed become `PendingOrder`s.
//! The scheduler polls the market session and, on the closed-to-tradable
//! transition, drains the queue: each order re-fetches the live price and
//! executes at that price, never at the stale enqueue price. Transient
//! execution failures are re-queued for the next pass; everything else is
//! dropped with a log line. The queue is write-through to its repository
//! so orders survive a restart.

use crate::application::account_cache::AccountStateCache;
use crate::application::position_book::PositionBook;
use crate::domain::market_hours::{self, MarketSession};
use crate::domain::ports::{BrokerageService, OrderNotifier, QuoteService};
use crate::domain::repositories::{PendingOrderRepository, TradeRepository};
use crate::domain::types::{OrderSide, PendingOrder, PositionSnapshot, TradeRecord};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Shared pending-order queue with write-through persistence. The store
/// keeps an order until it has been attempted, so a crash mid-replay
/// leaves unattempted orders for the next start.
#[derive(Clone)]
pub struct PendingOrderBook {
    inner: Arc<RwLock<Vec<PendingOrder>>>,
    store: Arc<dyn PendingOrderRepository>,
}

impl PendingOrderBook {
    pub fn new(store: Arc<dyn PendingOrderRepository>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Vec::new())),
            store,
        }
    }

    /// Restore persisted orders, typically once at startup.
    pub async fn load_from_store(&self) -> anyhow::Result<usize> {
        let orders = self.store.load_all().await?;
        let count = orders.len();
        *self.inner.write().await = orders;
        if count > 0 {
            info!("PendingOrders: restored {count} orders from store");
        }
        Ok(count)
    }

    pub async fn enqueue(&self, order: PendingOrder) {
        if let Err(e) = self.store.insert(&order).await {
            warn!("PendingOrders: persist failed for {}: {e}", order.id);
        }
        self.inner.write().await.push(order);
    }

    /// Atomically take every queued order. The store is untouched here;
    /// callers confirm each attempted order via `mark_attempted`.
    pub async fn take_all(&self) -> Vec<PendingOrder> {
        std::mem::take(&mut *self.inner.write().await)
    }

    pub async fn mark_attempted(&self, order: &PendingOrder) {
        if let Err(e) = self.store.remove(order.id).await {
            warn!("PendingOrders: store removal failed for {}: {e}", order.id);
        }
    }

    /// Put a transiently failed order back; it is already persisted.
    pub async fn requeue(&self, order: PendingOrder) {
        self.inner.write().await.push(order);
    }

    pub async fn snapshot(&self) -> Vec<PendingOrder> {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

pub struct PendingOrderScheduler {
    book: PendingOrderBook,
    broker: Arc<dyn BrokerageService>,
    quotes: Arc<dyn QuoteService>,
    positions: PositionBook,
    trades: Arc<dyn TradeRepository>,
    notifier: Arc<dyn OrderNotifier>,
    cache: Arc<AccountStateCache>,
    poll_interval: Duration,
}

impl PendingOrderScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book: PendingOrderBook,
        broker: Arc<dyn BrokerageService>,
        quotes: Arc<dyn QuoteService>,
        positions: PositionBook,
        trades: Arc<dyn TradeRepository>,
        notifier: Arc<dyn OrderNotifier>,
        cache: Arc<AccountStateCache>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            book,
            broker,
            quotes,
            positions,
            trades,
            notifier,
            cache,
            poll_interval,
        }
    }

    /// Poll loop watching for the market-open transition.
    pub async fn run(&self) {
        info!(
            "Scheduler: started, polling session every {}s",
            self.poll_interval.as_secs()
        );

        // Orders restored into an already-open market replay immediately.
        let mut last_session = market_hours::current_session();
        if last_session.is_tradable() && !self.book.is_empty().await {
            self.replay_pending().await;
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let session = market_hours::current_session();
            if session != last_session {
                info!("Scheduler: session changed {last_session} -> {session}");
            }
            if !last_session.is_tradable() && session.is_tradable() {
                self.replay_pending().await;
            }
            last_session = session;
        }
    }

    /// Drain the queue: one attempt per order at a freshly fetched price.
    pub async fn replay_pending(&self) {
        let orders = self.book.take_all().await;
        if orders.is_empty() {
            return;
        }
        info!("Scheduler: replaying {} pending orders", orders.len());

        let mut executed = 0usize;
        for order in orders {
            // The enqueue price is sizing context only; execution uses the
            // price of this moment.
            let price = match self.quotes.get_quote(&order.ticker).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(
                        "Scheduler: price re-fetch failed for {}, dropping order {}: {e}",
                        order.ticker, order.id
                    );
                    self.book.mark_attempted(&order).await;
                    continue;
                }
            };

            match self
                .broker
                .place_buy(&order.ticker, order.quantity, price)
                .await
            {
                Ok(()) => {
                    info!(
                        "Scheduler: executed pending {} x{} @ {price} (enqueued @ {})",
                        order.ticker, order.quantity, order.price
                    );
                    self.positions
                        .insert(PositionSnapshot::new(
                            order.ticker.clone(),
                            order.quantity,
                            price,
                            price,
                            Utc::now(),
                        ))
                        .await;

                    let record = TradeRecord::new(
                        order.ticker.clone(),
                        OrderSide::Buy,
                        order.quantity,
                        price,
                        order.reason.clone(),
                    );
                    if let Err(e) = self.trades.append(&record).await {
                        warn!("Scheduler: trade record failed for {}: {e}", record.id);
                    }
                    self.notifier.order_executed(&record).await;
                    self.book.mark_attempted(&order).await;
                    executed += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Scheduler: transient failure for {}, requeueing: {e}",
                        order.ticker
                    );
                    self.book.requeue(order).await;
                }
                Err(e) => {
                    error!(
                        "Scheduler: order {} for {} not executed, dropping: {e}",
                        order.id, order.ticker
                    );
                    self.book.mark_attempted(&order).await;
                }
            }
        }

        if executed > 0 {
            self.cache.invalidate().await;
        }
        info!("Scheduler: replay finished, {executed} executed");
    }
}
