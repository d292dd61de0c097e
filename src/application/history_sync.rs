//! Reconciles broker-side fills into the local trade history.
//!
//! The broker is the source of truth for what actually executed; orders
//! placed outside this process (mobile app, web) must still appear in the
//! local log. Fills already recorded are detected two ways: an exact
//! order-number match against records created by a previous sync, or a
//! fuzzy match on ticker, side, quantity, price and Eastern trade date.

use crate::domain::market_hours::eastern_trade_date;
use crate::domain::ports::BrokerageService;
use crate::domain::repositories::TradeRepository;
use crate::domain::types::{OrderFill, TradeRecord};
use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Two prices are "the same fill" when they differ by at most this much.
const PRICE_TOLERANCE_PERCENT: Decimal = dec!(0.5);

pub struct HistorySync {
    broker: Arc<dyn BrokerageService>,
    trades: Arc<dyn TradeRepository>,
    interval: std::time::Duration,
}

impl HistorySync {
    pub fn new(
        broker: Arc<dyn BrokerageService>,
        trades: Arc<dyn TradeRepository>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            broker,
            trades,
            interval,
        }
    }

    pub async fn run(&self) {
        info!(
            "HistorySync: started, syncing every {}s",
            self.interval.as_secs()
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(e) = self.sync_today().await {
                warn!("HistorySync: cycle failed: {e}");
            }
        }
    }

    /// Sync yesterday and today, covering fills that land around midnight.
    pub async fn sync_today(&self) -> Result<usize> {
        let today = eastern_trade_date(Utc::now());
        let yesterday = today.pred_opt().unwrap_or(today);
        self.sync_range(yesterday, today).await
    }

    /// Pull fills for the date range and append the ones not yet recorded.
    /// Returns how many new records were written.
    pub async fn sync_range(&self, from: NaiveDate, to: NaiveDate) -> Result<usize> {
        let fills = self.broker.fetch_fills(from, to).await?;
        if fills.is_empty() {
            return Ok(0);
        }

        // One extra day of local records so date-boundary fills still match.
        let cutoff = from
            .and_hms_opt(0, 0, 0)
            .map(|n| n.and_utc() - Duration::days(1))
            .unwrap_or_else(|| Utc::now() - Duration::days(7));
        let mut known = self.trades.find_since(cutoff).await?;

        let mut added = 0usize;
        for fill in fills {
            if known.iter().any(|record| is_duplicate(record, &fill)) {
                debug!(
                    "HistorySync: fill {} for {} already recorded",
                    fill.order_no, fill.ticker
                );
                continue;
            }

            let record = TradeRecord {
                executed_at: fill.filled_at,
                ..TradeRecord::new(
                    fill.ticker.clone(),
                    fill.side,
                    fill.quantity,
                    fill.price,
                    format!("history sync, order {}", fill.order_no),
                )
            };
            info!(
                "HistorySync: importing external fill {} {} x{} @ {}",
                fill.side, fill.ticker, fill.quantity, fill.price
            );
            self.trades.append(&record).await?;
            known.push(record);
            added += 1;
        }

        if added > 0 {
            info!("HistorySync: imported {added} fills");
        }
        Ok(added)
    }
}

/// A local record matches a broker fill when its reason carries the fill's
/// order number, or when instrument, side, quantity, price (within
/// tolerance) and Eastern trade date all agree.
fn is_duplicate(record: &TradeRecord, fill: &OrderFill) -> bool {
    if !fill.order_no.is_empty() && record.reason.contains(&fill.order_no) {
        return true;
    }

    record.ticker == fill.ticker
        && record.side == fill.side
        && record.quantity == fill.quantity
        && price_within_tolerance(record.price, fill.price)
        && eastern_trade_date(record.executed_at) == eastern_trade_date(fill.filled_at)
}

fn price_within_tolerance(a: Decimal, b: Decimal) -> bool {
    if b == Decimal::ZERO {
        return a == Decimal::ZERO;
    }
    let deviation = ((a - b) / b).abs() * dec!(100);
    deviation <= PRICE_TOLERANCE_PERCENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::OrderSide;
    use crate::infrastructure::mock::{InMemoryTradeRepository, MockBrokerageService};
    use chrono::TimeZone;

    fn fill(order_no: &str, ticker: &str, side: OrderSide, qty: u32, price: Decimal) -> OrderFill {
        OrderFill {
            order_no: order_no.to_string(),
            ticker: ticker.to_string(),
            side,
            quantity: qty,
            price,
            filled_at: Utc.with_ymd_and_hms(2025, 1, 15, 15, 30, 0).unwrap(),
        }
    }

    fn record_at_same_time(ticker: &str, side: OrderSide, qty: u32, price: Decimal) -> TradeRecord {
        TradeRecord {
            executed_at: Utc.with_ymd_and_hms(2025, 1, 15, 15, 31, 0).unwrap(),
            ..TradeRecord::new(ticker, side, qty, price, "news 85.0: headline")
        }
    }

    #[test]
    fn order_number_match_is_duplicate() {
        let record = TradeRecord::new(
            "AAPL",
            OrderSide::Buy,
            10,
            dec!(50),
            "history sync, order 0001234567",
        );
        let f = fill("0001234567", "MSFT", OrderSide::Sell, 99, dec!(999));
        assert!(is_duplicate(&record, &f));
    }

    #[test]
    fn fuzzy_match_accepts_small_price_drift() {
        let record = record_at_same_time("AAPL", OrderSide::Buy, 10, dec!(100.00));
        // 0.4% away: same fill reported with different rounding.
        let f = fill("777", "AAPL", OrderSide::Buy, 10, dec!(100.40));
        assert!(is_duplicate(&record, &f));
    }

    #[test]
    fn fuzzy_match_rejects_larger_price_gap() {
        let record = record_at_same_time("AAPL", OrderSide::Buy, 10, dec!(100.00));
        // 1% away: a distinct fill.
        let f = fill("777", "AAPL", OrderSide::Buy, 10, dec!(101.00));
        assert!(!is_duplicate(&record, &f));
    }

    #[test]
    fn fuzzy_match_requires_same_side_and_quantity() {
        let record = record_at_same_time("AAPL", OrderSide::Buy, 10, dec!(100));
        assert!(!is_duplicate(
            &record,
            &fill("777", "AAPL", OrderSide::Sell, 10, dec!(100))
        ));
        assert!(!is_duplicate(
            &record,
            &fill("777", "AAPL", OrderSide::Buy, 11, dec!(100))
        ));
        assert!(!is_duplicate(
            &record,
            &fill("777", "TSLA", OrderSide::Buy, 10, dec!(100))
        ));
    }

    #[test]
    fn fuzzy_match_requires_same_eastern_day() {
        let record = record_at_same_time("AAPL", OrderSide::Buy, 10, dec!(100));
        let mut other_day = fill("777", "AAPL", OrderSide::Buy, 10, dec!(100));
        other_day.filled_at = Utc.with_ymd_and_hms(2025, 1, 16, 15, 30, 0).unwrap();
        assert!(!is_duplicate(&record, &other_day));
    }

    #[tokio::test]
    async fn sync_imports_only_new_fills() {
        let broker = MockBrokerageService::new();
        let trades = InMemoryTradeRepository::new();

        // One fill already known locally, one new.
        let known = record_at_same_time("AAPL", OrderSide::Buy, 10, dec!(100));
        trades.append(&known).await.unwrap();
        broker
            .set_fills(vec![
                fill("111", "AAPL", OrderSide::Buy, 10, dec!(100.10)),
                fill("222", "NVDA", OrderSide::Sell, 3, dec!(500)),
            ])
            .await;

        let sync = HistorySync::new(
            Arc::new(broker),
            Arc::new(trades.clone()),
            std::time::Duration::from_secs(600),
        );
        let added = sync
            .sync_range(
                NaiveDate::from_ymd_opt(2025, 1, 14).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(added, 1);
        assert_eq!(trades.count().await.unwrap(), 2);

        // Re-running imports nothing: the NVDA record now matches by order number.
        let again = sync
            .sync_range(
                NaiveDate::from_ymd_opt(2025, 1, 14).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(trades.count().await.unwrap(), 2);
    }
}
