use crate::domain::errors::BrokerError;
use crate::domain::news::{NewsEvent, ScoredSignal};
use crate::domain::types::{
    AccountFunds, Candle, OrderFill, PositionSnapshot, TradeRecord,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::mpsc::Receiver;

// Need async_trait for async functions in traits
#[async_trait]
pub trait BrokerageService: Send + Sync {
    async fn fetch_balance(&self) -> Result<AccountFunds, BrokerError>;
    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>, BrokerError>;
    async fn place_buy(
        &self,
        ticker: &str,
        quantity: u32,
        price: Decimal,
    ) -> Result<(), BrokerError>;
    async fn place_sell(&self, ticker: &str, quantity: u32) -> Result<(), BrokerError>;
    async fn fetch_fills(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<OrderFill>, BrokerError>;
}

/// Independent fast price feed, separate from the brokerage so that price
/// lookups keep working when the brokerage session is degraded.
#[async_trait]
pub trait QuoteService: Send + Sync {
    async fn get_quote(&self, ticker: &str) -> Result<Decimal, BrokerError>;
    async fn get_quotes(
        &self,
        tickers: &[String],
    ) -> Result<HashMap<String, Decimal>, BrokerError>;
    async fn get_daily_candles(&self, ticker: &str, days: u32)
    -> Result<Vec<Candle>, BrokerError>;
}

/// Turns a raw news item into a scored signal. Pure, no I/O.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, event: &NewsEvent) -> ScoredSignal;
}

#[async_trait]
pub trait NewsFeed: Send + Sync {
    async fn subscribe(&self) -> Result<Receiver<ScoredSignal>>;
}

/// Capability handed to the components that fill orders, so they report
/// outcomes without reaching back into each other.
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn order_executed(&self, record: &TradeRecord);
}
