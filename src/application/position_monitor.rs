//! Periodic exit sweep over open positions.
//!
//! Each cycle re-prices every open position from the fast feed and closes
//! any whose profit/loss crosses the stop-loss or take-profit threshold.
//! Both boundaries are inclusive. A position that cannot be priced this
//! cycle is left alone and looked at again next cycle.

use crate::application::account_cache::AccountStateCache;
use crate::application::position_book::PositionBook;
use crate::domain::ports::{BrokerageService, OrderNotifier, QuoteService};
use crate::domain::repositories::TradeRepository;
use crate::domain::types::{OrderSide, TradeRecord};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct PositionMonitor {
    positions: PositionBook,
    quotes: Arc<dyn QuoteService>,
    broker: Arc<dyn BrokerageService>,
    trades: Arc<dyn TradeRepository>,
    notifier: Arc<dyn OrderNotifier>,
    cache: Arc<AccountStateCache>,
    /// Positive percentage; a drawdown at or beyond `-stop_loss_percent` exits.
    stop_loss_percent: Decimal,
    /// Positive percentage; a gain at or beyond it exits.
    take_profit_percent: Decimal,
    sweep_interval: Duration,
}

impl PositionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        positions: PositionBook,
        quotes: Arc<dyn QuoteService>,
        broker: Arc<dyn BrokerageService>,
        trades: Arc<dyn TradeRepository>,
        notifier: Arc<dyn OrderNotifier>,
        cache: Arc<AccountStateCache>,
        stop_loss_percent: Decimal,
        take_profit_percent: Decimal,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            positions,
            quotes,
            broker,
            trades,
            notifier,
            cache,
            stop_loss_percent,
            take_profit_percent,
            sweep_interval,
        }
    }

    pub async fn run(&self) {
        info!(
            "Monitor: started, sweeping every {}s (stop-loss -{}%, take-profit +{}%)",
            self.sweep_interval.as_secs(),
            self.stop_loss_percent,
            self.take_profit_percent
        );

        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    /// One pass over the book. Public so an operator can force a check.
    pub async fn sweep(&self) {
        let open = self.positions.all().await;
        if open.is_empty() {
            return;
        }

        let mut closed = 0usize;
        for snapshot in open {
            let price = match self.quotes.get_quote(&snapshot.ticker).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(
                        "Monitor: no price for {} this cycle, skipping: {e}",
                        snapshot.ticker
                    );
                    continue;
                }
            };

            let mut updated = snapshot.clone();
            updated.reprice(price, Utc::now());
            let pnl_pct = updated.profit_loss_percent;

            let exit_label = if pnl_pct <= -self.stop_loss_percent {
                Some("stop-loss")
            } else if pnl_pct >= self.take_profit_percent {
                Some("take-profit")
            } else {
                None
            };

            let Some(label) = exit_label else {
                self.positions.insert(updated).await;
                continue;
            };

            info!(
                "Monitor: {} hit {label} at {pnl_pct:.2}% (price {price}), selling {} shares",
                updated.ticker, updated.quantity
            );
            match self.broker.place_sell(&updated.ticker, updated.quantity).await {
                Ok(()) => {
                    self.positions.remove(&updated.ticker).await;
                    let record = TradeRecord::new(
                        updated.ticker.clone(),
                        OrderSide::Sell,
                        updated.quantity,
                        price,
                        format!("{label} at {pnl_pct:.2}%"),
                    );
                    if let Err(e) = self.trades.append(&record).await {
                        warn!("Monitor: trade record failed for {}: {e}", record.id);
                    }
                    self.notifier.order_executed(&record).await;
                    closed += 1;
                }
                Err(e) => {
                    // Keep the position; the next sweep retries.
                    error!("Monitor: sell order for {} failed: {e}", updated.ticker);
                    self.positions.insert(updated).await;
                }
            }
        }

        if closed > 0 {
            self.cache.invalidate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::account_cache::{AccountIdentity, CacheTtls};
    use crate::domain::errors::BrokerError;
    use crate::domain::types::{AccountType, PositionSnapshot};
    use crate::infrastructure::mock::{
        InMemoryBalanceAuditRepository, InMemoryTradeRepository, MockBrokerageService,
        MockQuoteService, RecordingNotifier,
    };
    use rust_decimal_macros::dec;

    struct Fixture {
        monitor: PositionMonitor,
        broker: MockBrokerageService,
        quotes: MockQuoteService,
        trades: InMemoryTradeRepository,
        positions: PositionBook,
        notifier: RecordingNotifier,
    }

    fn fixture() -> Fixture {
        let broker = MockBrokerageService::new();
        let quotes = MockQuoteService::new();
        let trades = InMemoryTradeRepository::new();
        let notifier = RecordingNotifier::new();
        let positions = PositionBook::new();

        let cache = Arc::new(AccountStateCache::new(
            Arc::new(broker.clone()),
            Arc::new(quotes.clone()),
            Arc::new(InMemoryBalanceAuditRepository::new()),
            AccountIdentity {
                account_type: AccountType::Virtual,
                account_id: "acct-1".to_string(),
            },
            CacheTtls::default(),
        ));

        let monitor = PositionMonitor::new(
            positions.clone(),
            Arc::new(quotes.clone()),
            Arc::new(broker.clone()),
            Arc::new(trades.clone()),
            Arc::new(notifier.clone()),
            cache,
            dec!(2.0),
            dec!(5.0),
            Duration::from_secs(5),
        );

        Fixture {
            monitor,
            broker,
            quotes,
            trades,
            positions,
            notifier,
        }
    }

    async fn seed_position(f: &Fixture, ticker: &str, buy_price: Decimal) {
        f.positions
            .insert(PositionSnapshot::new(ticker, 10, buy_price, buy_price, Utc::now()))
            .await;
    }

    #[tokio::test]
    async fn take_profit_boundary_is_inclusive() {
        let f = fixture();
        seed_position(&f, "AAPL", dec!(100)).await;
        // Exactly +5.00%.
        f.quotes.set_price("AAPL", dec!(105)).await;

        f.monitor.sweep().await;

        assert_eq!(f.broker.sells().await, vec![("AAPL".to_string(), 10)]);
        assert!(f.positions.is_empty().await);

        let trades = f.trades.find_recent(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, OrderSide::Sell);
        assert!(trades[0].reason.starts_with("take-profit"));
        assert_eq!(f.notifier.notified().await.len(), 1);
    }

    #[tokio::test]
    async fn stop_loss_boundary_is_inclusive() {
        let f = fixture();
        seed_position(&f, "TSLA", dec!(100)).await;
        // Exactly -2.00%.
        f.quotes.set_price("TSLA", dec!(98)).await;

        f.monitor.sweep().await;

        assert_eq!(f.broker.sells().await, vec![("TSLA".to_string(), 10)]);
        let trades = f.trades.find_recent(10).await.unwrap();
        assert!(trades[0].reason.starts_with("stop-loss"));
    }

    #[tokio::test]
    async fn inside_band_keeps_position_with_fresh_price() {
        let f = fixture();
        seed_position(&f, "AAPL", dec!(100)).await;
        f.quotes.set_price("AAPL", dec!(103)).await;

        f.monitor.sweep().await;

        assert!(f.broker.sells().await.is_empty());
        let held = f.positions.get("AAPL").await.unwrap();
        assert_eq!(held.current_price, dec!(103));
        assert_eq!(held.profit_loss_percent, dec!(3.00));
    }

    #[tokio::test]
    async fn unpriceable_position_is_skipped_not_closed() {
        let f = fixture();
        seed_position(&f, "AAPL", dec!(100)).await;
        f.quotes
            .fail_with(BrokerError::unavailable("feed down"))
            .await;

        f.monitor.sweep().await;

        assert!(f.broker.sells().await.is_empty());
        let held = f.positions.get("AAPL").await.unwrap();
        // Untouched, including the price it had before the gap.
        assert_eq!(held.current_price, dec!(100));
    }

    #[tokio::test]
    async fn failed_sell_keeps_position_for_retry() {
        let f = fixture();
        seed_position(&f, "AAPL", dec!(100)).await;
        f.quotes.set_price("AAPL", dec!(110)).await;
        f.broker
            .fail_orders_with(BrokerError::unavailable("broker 503"))
            .await;

        f.monitor.sweep().await;
        assert!(f.positions.contains("AAPL").await);
        assert_eq!(f.trades.count().await.unwrap(), 0);

        // Broker recovers; next sweep exits.
        f.broker.clear_failures().await;
        f.monitor.sweep().await;
        assert!(f.positions.is_empty().await);
        assert_eq!(f.trades.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mixed_book_only_closes_crossed_positions() {
        let f = fixture();
        seed_position(&f, "AAPL", dec!(100)).await;
        seed_position(&f, "TSLA", dec!(200)).await;
        f.quotes.set_price("AAPL", dec!(106)).await; // +6%, exits
        f.quotes.set_price("TSLA", dec!(202)).await; // +1%, held

        f.monitor.sweep().await;

        assert_eq!(f.broker.sells().await, vec![("AAPL".to_string(), 10)]);
        assert!(f.positions.contains("TSLA").await);
        assert_eq!(f.positions.len().await, 1);
    }
}
