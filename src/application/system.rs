//! Application assembly and the operator surface.
//!
//! `Application::build` constructs every service explicitly and wires the
//! dependencies by hand; nothing lives in a global. `start` spawns the
//! long-running tasks and hands back a `SystemHandle` for in-process
//! operator actions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::application::account_cache::{AccountIdentity, AccountStateCache, CacheTtls};
use crate::application::decision::{DecisionEngine, TradeRules};
use crate::application::history_sync::HistorySync;
use crate::application::position_book::PositionBook;
use crate::application::position_monitor::PositionMonitor;
use crate::application::scheduler::{PendingOrderBook, PendingOrderScheduler};
use crate::config::{Config, Mode};
use crate::domain::errors::BrokerError;
use crate::domain::market_hours;
use crate::domain::news::ScoredSignal;
use crate::domain::ports::{BrokerageService, NewsFeed, OrderNotifier, QuoteService};
use crate::domain::repositories::TradeRepository;
use crate::domain::types::{
    AccountFunds, BalanceSnapshot, Candle, OrderSide, PendingOrder, PositionSnapshot, QuoteUpdate,
    TradeRecord,
};
use crate::infrastructure::broker::{BrokerRestClient, HttpTokenEndpoint, TokenManager};
use crate::infrastructure::core::http::retrying_client;
use crate::infrastructure::market_data::FastQuoteClient;
use crate::infrastructure::mock::{MockBrokerageService, MockNewsFeed, MockQuoteService};
use crate::infrastructure::news::{NewsScorer, RssFeed};
use crate::infrastructure::persistence::{
    Database, SqliteBalanceAuditRepository, SqliteCredentialStore, SqlitePendingOrderRepository,
    SqliteTradeRepository,
};
use crate::infrastructure::quote_stream::{QuoteStreamSession, SessionState};

/// Logs every executed order.
struct LogNotifier;

#[async_trait]
impl OrderNotifier for LogNotifier {
    async fn order_executed(&self, record: &TradeRecord) {
        info!(
            "Order: {} {} x{} @ {} ({})",
            record.side, record.ticker, record.quantity, record.price, record.reason
        );
    }
}

/// Keeps the realtime stream subscribed to exactly the tickers we hold.
struct StreamNotifier {
    stream: Arc<QuoteStreamSession>,
}

#[async_trait]
impl OrderNotifier for StreamNotifier {
    async fn order_executed(&self, record: &TradeRecord) {
        let result = match record.side {
            OrderSide::Buy => self.stream.subscribe(&record.ticker).await,
            OrderSide::Sell => self.stream.unsubscribe(&record.ticker).await,
        };
        if let Err(e) = result {
            warn!("Stream: could not retarget {}: {}", record.ticker, e);
        }
    }
}

/// Fans one execution report out to several notifiers.
struct CompositeNotifier {
    targets: Vec<Arc<dyn OrderNotifier>>,
}

#[async_trait]
impl OrderNotifier for CompositeNotifier {
    async fn order_executed(&self, record: &TradeRecord) {
        for target in &self.targets {
            target.order_executed(record).await;
        }
    }
}

pub struct Application {
    config: Config,
    news: Arc<dyn NewsFeed>,
    quotes: Arc<dyn QuoteService>,
    cache: Arc<AccountStateCache>,
    engine: Arc<DecisionEngine>,
    scheduler: Arc<PendingOrderScheduler>,
    monitor: Arc<PositionMonitor>,
    history: Arc<HistorySync>,
    positions: PositionBook,
    pending: PendingOrderBook,
    trades: Arc<dyn TradeRepository>,
    stream: Option<Arc<QuoteStreamSession>>,
    quote_rx: Option<mpsc::Receiver<QuoteUpdate>>,
}

impl Application {
    pub async fn build(config: Config) -> Result<Self> {
        info!(
            "Building application (mode: {:?}, account: {})",
            config.mode, config.account_type
        );

        let db = Database::new(&config.database_url)
            .await
            .context("Failed to initialize database")?;
        let trades: Arc<dyn TradeRepository> =
            Arc::new(SqliteTradeRepository::new(db.pool.clone()));
        let pending_store = Arc::new(SqlitePendingOrderRepository::new(db.pool.clone()));
        let audit = Arc::new(SqliteBalanceAuditRepository::new(db.pool.clone()));

        let mut stream = None;
        let mut quote_rx = None;

        let (broker, quotes, news, account_id): (
            Arc<dyn BrokerageService>,
            Arc<dyn QuoteService>,
            Arc<dyn NewsFeed>,
            String,
        ) = match config.mode {
            Mode::Mock => {
                info!("Using mock services");
                let mock_broker = MockBrokerageService::new();
                mock_broker
                    .set_funds(AccountFunds {
                        cash: config.mock_initial_cash,
                        buying_power: config.mock_initial_cash,
                    })
                    .await;
                let scorer = Arc::new(NewsScorer::new());
                (
                    Arc::new(mock_broker),
                    Arc::new(MockQuoteService::new()),
                    Arc::new(MockNewsFeed::with_scorer(scorer)),
                    "mock".to_string(),
                )
            }
            Mode::Live => {
                info!("Using live brokerage at {}", config.broker_base_url);
                let broker_http = retrying_client(30);
                let endpoint = Arc::new(HttpTokenEndpoint::new(
                    broker_http.clone(),
                    config.broker_base_url.clone(),
                    config.broker_app_key.clone(),
                    config.broker_app_secret.clone(),
                ));
                let credentials = Arc::new(SqliteCredentialStore::new(db.pool.clone()));
                let tokens = Arc::new(TokenManager::new(endpoint, credentials));

                let rest = BrokerRestClient::new(
                    broker_http,
                    config.broker_base_url.clone(),
                    config.broker_app_key.clone(),
                    config.broker_app_secret.clone(),
                    config.broker_account_no.clone(),
                    config.account_type,
                    config.exchange_code.clone(),
                    tokens.clone(),
                );
                let account_id = rest.account_id();
                tokens.prime_from_store(&account_id).await;

                let (session, rx) =
                    QuoteStreamSession::new(config.broker_ws_url.clone(), tokens.clone());
                stream = Some(Arc::new(session));
                quote_rx = Some(rx);

                let quotes = FastQuoteClient::new(
                    retrying_client(10),
                    config.quote_api_base_url.clone(),
                    config.quote_api_key.clone(),
                );
                let feed = RssFeed::new(
                    &config.rss_feed_url,
                    config.news_poll_seconds,
                    Arc::new(NewsScorer::new()),
                );
                (Arc::new(rest), Arc::new(quotes), Arc::new(feed), account_id)
            }
        };

        let identity = AccountIdentity {
            account_type: config.account_type,
            account_id,
        };
        let ttls = CacheTtls {
            balance: chrono::Duration::seconds(config.balance_ttl_seconds as i64),
            positions: chrono::Duration::seconds(config.positions_ttl_seconds as i64),
        };
        let cache = Arc::new(AccountStateCache::new(
            broker.clone(),
            quotes.clone(),
            audit,
            identity,
            ttls,
        ));

        let positions = PositionBook::new();
        let pending = PendingOrderBook::new(pending_store);

        let mut targets: Vec<Arc<dyn OrderNotifier>> = vec![Arc::new(LogNotifier)];
        if let Some(session) = &stream {
            targets.push(Arc::new(StreamNotifier {
                stream: session.clone(),
            }));
        }
        let notifier: Arc<dyn OrderNotifier> = Arc::new(CompositeNotifier { targets });

        let rules = TradeRules {
            pending_threshold: config.pending_score_threshold,
            execute_threshold: config.execute_score_threshold,
            position_fraction: config.position_fraction,
            max_position_usd: config.max_position_usd,
        };
        let simulation = Arc::new(AtomicBool::new(config.simulation_mode));
        let engine = Arc::new(DecisionEngine::new(
            rules,
            simulation,
            broker.clone(),
            quotes.clone(),
            cache.clone(),
            positions.clone(),
            pending.clone(),
            trades.clone(),
            notifier.clone(),
            config.news_dedup_capacity,
        ));

        let scheduler = Arc::new(PendingOrderScheduler::new(
            pending.clone(),
            broker.clone(),
            quotes.clone(),
            positions.clone(),
            trades.clone(),
            notifier.clone(),
            cache.clone(),
            Duration::from_secs(config.market_poll_seconds),
        ));

        let monitor = Arc::new(PositionMonitor::new(
            positions.clone(),
            quotes.clone(),
            broker.clone(),
            trades.clone(),
            notifier,
            cache.clone(),
            config.stop_loss_percent,
            config.take_profit_percent,
            Duration::from_secs(config.monitor_interval_seconds),
        ));

        let history = Arc::new(HistorySync::new(
            broker,
            trades.clone(),
            Duration::from_secs(config.history_sync_seconds),
        ));

        Ok(Self {
            config,
            news,
            quotes,
            cache,
            engine,
            scheduler,
            monitor,
            history,
            positions,
            pending,
            trades,
            stream,
            quote_rx,
        })
    }

    /// Spawn the long-running tasks and return the operator handle.
    pub async fn start(mut self) -> Result<SystemHandle> {
        self.pending
            .load_from_store()
            .await
            .context("Failed to restore pending orders")?;

        let mut signal_rx = self
            .news
            .subscribe()
            .await
            .context("Failed to subscribe to the news feed")?;
        let engine = self.engine.clone();
        tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                engine
                    .handle_signal(signal, market_hours::current_session())
                    .await;
            }
            info!("News: feed closed, signal task exiting");
        });

        if let Some(mut quote_rx) = self.quote_rx.take() {
            let positions = self.positions.clone();
            tokio::spawn(async move {
                while let Some(update) = quote_rx.recv().await {
                    if let Some(mut snapshot) = positions.get(&update.ticker).await {
                        snapshot.reprice(update.price, update.received_at);
                        positions.insert(snapshot).await;
                    }
                }
                info!("Stream: quote channel closed, reprice task exiting");
            });
        }

        let scheduler = self.scheduler.clone();
        tokio::spawn(async move { scheduler.run().await });

        let monitor = self.monitor.clone();
        tokio::spawn(async move { monitor.run().await });

        let history = self.history.clone();
        tokio::spawn(async move { history.run().await });

        info!("Application started (mode: {:?})", self.config.mode);

        Ok(SystemHandle {
            cache: self.cache,
            engine: self.engine,
            pending: self.pending,
            positions: self.positions,
            trades: self.trades,
            quotes: self.quotes,
            history: self.history,
            stream: self.stream,
        })
    }
}

/// In-process operator surface over the running system.
#[derive(Clone)]
pub struct SystemHandle {
    cache: Arc<AccountStateCache>,
    engine: Arc<DecisionEngine>,
    pending: PendingOrderBook,
    positions: PositionBook,
    trades: Arc<dyn TradeRepository>,
    quotes: Arc<dyn QuoteService>,
    history: Arc<HistorySync>,
    stream: Option<Arc<QuoteStreamSession>>,
}

impl SystemHandle {
    pub async fn balance(&self) -> BalanceSnapshot {
        self.cache.get_balance().await
    }

    /// Brokerage view of open positions, served through the cache.
    pub async fn positions(&self) -> Vec<PositionSnapshot> {
        self.cache.get_positions().await
    }

    /// Positions this workflow opened and still watches for exits.
    pub async fn watched_positions(&self) -> Vec<PositionSnapshot> {
        self.positions.all().await
    }

    pub async fn pending_orders(&self) -> Vec<PendingOrder> {
        self.pending.snapshot().await
    }

    pub async fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        self.trades.find_recent(limit).await
    }

    /// Signals that scored into the manual band, newest first.
    pub async fn manual_signals(&self) -> Vec<ScoredSignal> {
        self.engine.manual_signals().await
    }

    pub fn trading_rules(&self) -> TradeRules {
        self.engine.rules().clone()
    }

    pub fn simulation_enabled(&self) -> bool {
        self.engine.simulation_enabled()
    }

    pub fn set_simulation(&self, enabled: bool) {
        self.engine.set_simulation(enabled);
    }

    pub async fn manual_buy(
        &self,
        ticker: &str,
        quantity: Option<u32>,
    ) -> Result<TradeRecord, BrokerError> {
        self.engine.manual_buy(ticker, quantity).await
    }

    pub async fn invalidate_caches(&self) {
        self.cache.invalidate().await;
    }

    pub async fn daily_candles(&self, ticker: &str, days: u32) -> Result<Vec<Candle>, BrokerError> {
        self.quotes.get_daily_candles(ticker, days).await
    }

    /// Run a history sync outside the periodic schedule. Returns how many
    /// fills were imported.
    pub async fn sync_history(&self) -> Result<usize> {
        self.history.sync_today().await
    }

    /// Realtime session state, `None` in mock mode.
    pub fn stream_state(&self) -> Option<SessionState> {
        self.stream.as_ref().map(|s| s.state())
    }

    pub async fn restart_stream(&self) -> Result<(), BrokerError> {
        match &self.stream {
            Some(session) => session.restart().await,
            None => Err(BrokerError::invalid("no realtime session in mock mode")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn mock_config() -> Config {
        Config {
            mode: Mode::Mock,
            account_type: crate::domain::types::AccountType::Virtual,
            broker_app_key: String::new(),
            broker_app_secret: String::new(),
            broker_account_no: String::new(),
            broker_base_url: String::new(),
            broker_ws_url: String::new(),
            exchange_code: "NASD".to_string(),
            quote_api_base_url: String::new(),
            quote_api_key: String::new(),
            rss_feed_url: String::new(),
            news_poll_seconds: 60,
            news_dedup_capacity: 100,
            pending_score_threshold: 65.0,
            execute_score_threshold: 80.0,
            position_fraction: dec!(0.10),
            max_position_usd: dec!(1000),
            stop_loss_percent: dec!(2.0),
            take_profit_percent: dec!(5.0),
            balance_ttl_seconds: 60,
            positions_ttl_seconds: 30,
            monitor_interval_seconds: 3600,
            market_poll_seconds: 3600,
            history_sync_seconds: 3600,
            simulation_mode: true,
            mock_initial_cash: dec!(100000),
            database_url: format!(
                "sqlite://{}",
                std::env::temp_dir()
                    .join(format!("newstrade-sys-{}.db", uuid::Uuid::new_v4()))
                    .display()
            ),
        }
    }

    #[tokio::test]
    async fn mock_build_starts_and_serves_the_handle() {
        let app = Application::build(mock_config()).await.unwrap();
        let handle = app.start().await.unwrap();

        let balance = handle.balance().await;
        assert_eq!(balance.buying_power, dec!(100000));
        assert!(handle.pending_orders().await.is_empty());
        assert!(handle.recent_trades(10).await.unwrap().is_empty());
        assert!(handle.stream_state().is_none());
        assert!(handle.simulation_enabled());
    }

    #[tokio::test]
    async fn manual_buy_in_simulation_reaches_the_trade_log() {
        let config = mock_config();
        let app = Application::build(config).await.unwrap();
        let handle = app.start().await.unwrap();

        // Mock quotes have no price for the ticker, so this surfaces the
        // quote failure instead of silently trading.
        let err = handle.manual_buy("AAPL", Some(1)).await.unwrap_err();
        assert!(err.to_string().contains("AAPL"));
    }
}
