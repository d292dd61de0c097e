//! Orders deferred while the market is closed: queueing through the
//! decision engine, durability across a restart, and replay at the fresh
//! price once a session opens.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::Utc;
use rust_decimal_macros::dec;

use newstrade::application::account_cache::{AccountIdentity, AccountStateCache, CacheTtls};
use newstrade::application::decision::{Decision, DecisionEngine, TradeRules};
use newstrade::application::position_book::PositionBook;
use newstrade::application::scheduler::{PendingOrderBook, PendingOrderScheduler};
use newstrade::domain::errors::BrokerError;
use newstrade::domain::market_hours::MarketSession;
use newstrade::domain::news::{NewsEvent, ScoredSignal};
use newstrade::domain::types::{AccountFunds, AccountType};
use newstrade::infrastructure::mock::{
    InMemoryBalanceAuditRepository, InMemoryPendingOrderRepository, InMemoryTradeRepository,
    MockBrokerageService, MockQuoteService, RecordingNotifier,
};

struct Fixture {
    broker: Arc<MockBrokerageService>,
    quotes: Arc<MockQuoteService>,
    trades: Arc<InMemoryTradeRepository>,
    store: Arc<InMemoryPendingOrderRepository>,
    positions: PositionBook,
    pending: PendingOrderBook,
    engine: DecisionEngine,
    scheduler: PendingOrderScheduler,
}

async fn fixture() -> Fixture {
    let broker = Arc::new(MockBrokerageService::new());
    broker
        .set_funds(AccountFunds {
            cash: dec!(10000),
            buying_power: dec!(10000),
        })
        .await;
    let quotes = Arc::new(MockQuoteService::new());
    let trades = Arc::new(InMemoryTradeRepository::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let store = Arc::new(InMemoryPendingOrderRepository::new());
    let positions = PositionBook::new();
    let pending = PendingOrderBook::new(store.clone());

    let cache = Arc::new(AccountStateCache::new(
        broker.clone(),
        quotes.clone(),
        Arc::new(InMemoryBalanceAuditRepository::new()),
        AccountIdentity {
            account_type: AccountType::Virtual,
            account_id: "test".to_string(),
        },
        CacheTtls::default(),
    ));

    let engine = DecisionEngine::new(
        TradeRules {
            pending_threshold: 65.0,
            execute_threshold: 80.0,
            position_fraction: dec!(0.10),
            max_position_usd: dec!(1000),
        },
        Arc::new(AtomicBool::new(false)),
        broker.clone(),
        quotes.clone(),
        cache.clone(),
        positions.clone(),
        pending.clone(),
        trades.clone(),
        notifier.clone(),
        100,
    );

    let scheduler = PendingOrderScheduler::new(
        pending.clone(),
        broker.clone(),
        quotes.clone(),
        positions.clone(),
        trades.clone(),
        notifier,
        cache,
        Duration::from_secs(3600),
    );

    Fixture {
        broker,
        quotes,
        trades,
        store,
        positions,
        pending,
        engine,
        scheduler,
    }
}

fn signal(id: &str, ticker: &str, score: f64) -> ScoredSignal {
    ScoredSignal {
        event: NewsEvent {
            id: id.to_string(),
            source: "test".to_string(),
            title: format!("{ticker} guidance raised"),
            content: String::new(),
            url: None,
            published_at: Utc::now(),
        },
        ticker: Some(ticker.to_string()),
        sentiment: 0.6,
        positive_pct: 80.0,
        signal_score: score,
    }
}

#[tokio::test]
async fn overnight_news_is_bought_at_the_open_price() {
    let fx = fixture().await;
    fx.quotes.set_price("AAPL", dec!(100)).await;

    let decision = fx
        .engine
        .handle_signal(signal("n1", "AAPL", 90.0), MarketSession::Closed)
        .await;
    assert_eq!(decision, Decision::EnqueuedPending);
    assert!(fx.broker.buys().await.is_empty());
    assert_eq!(fx.store.load_all().await.unwrap().len(), 1);

    // The stock gaps up overnight; the replay must not fill at the stale
    // queue-time price.
    fx.quotes.set_price("AAPL", dec!(110)).await;
    fx.scheduler.replay_pending().await;

    assert_eq!(fx.broker.buys().await, vec![("AAPL".to_string(), 10, dec!(110))]);
    assert_eq!(
        fx.positions.get("AAPL").await.map(|p| p.buy_price),
        Some(dec!(110))
    );
    assert!(fx.pending.is_empty().await);
    assert!(fx.store.load_all().await.unwrap().is_empty());

    // The original trigger survives into the trade log.
    let records = fx.trades.find_recent(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].reason.contains("guidance raised"));
}

#[tokio::test]
async fn queued_orders_survive_a_restart() {
    let fx = fixture().await;
    fx.quotes.set_price("MSFT", dec!(200)).await;

    fx.engine
        .handle_signal(signal("n1", "MSFT", 85.0), MarketSession::Closed)
        .await;
    assert_eq!(fx.store.load_all().await.unwrap().len(), 1);

    // Fresh book over the same store simulates a process restart.
    let restored = PendingOrderBook::new(fx.store.clone());
    restored.load_from_store().await.unwrap();
    assert_eq!(restored.len().await, 1);

    let scheduler = PendingOrderScheduler::new(
        restored,
        fx.broker.clone(),
        fx.quotes.clone(),
        fx.positions.clone(),
        fx.trades.clone(),
        Arc::new(RecordingNotifier::new()),
        Arc::new(AccountStateCache::new(
            fx.broker.clone(),
            fx.quotes.clone(),
            Arc::new(InMemoryBalanceAuditRepository::new()),
            AccountIdentity {
                account_type: AccountType::Virtual,
                account_id: "test".to_string(),
            },
            CacheTtls::default(),
        )),
        Duration::from_secs(3600),
    );
    scheduler.replay_pending().await;

    assert_eq!(fx.broker.buys().await.len(), 1);
    assert!(fx.store.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_broker_failure_retries_on_the_next_cycle() {
    let fx = fixture().await;
    fx.quotes.set_price("AMD", dec!(50)).await;

    fx.engine
        .handle_signal(signal("n1", "AMD", 90.0), MarketSession::Closed)
        .await;

    fx.broker
        .fail_orders_with(BrokerError::unavailable("maintenance window"))
        .await;
    fx.scheduler.replay_pending().await;

    // Still queued in memory and still durable.
    assert_eq!(fx.pending.len().await, 1);
    assert_eq!(fx.store.load_all().await.unwrap().len(), 1);
    assert!(fx.positions.is_empty().await);

    fx.broker.clear_failures().await;
    fx.scheduler.replay_pending().await;

    assert_eq!(fx.broker.buys().await.len(), 1);
    assert!(fx.pending.is_empty().await);
    assert!(fx.store.load_all().await.unwrap().is_empty());
}
