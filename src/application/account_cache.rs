//! TTL cache over the brokerage's balance and position queries.
//!
//! Every read first consults the in-memory snapshot; only a stale entry
//! touches the network. A failed refresh serves the previous snapshot and
//! logs the degradation, so callers never see an error from a read, only
//! a documented zero value when nothing was ever fetched. Position reads
//! additionally kick off a background re-price from the fast quote feed
//! whose result lands only if no newer snapshot was committed meanwhile.

use crate::domain::ports::{BrokerageService, QuoteService};
use crate::domain::repositories::BalanceAuditRepository;
use crate::domain::types::{AccountType, BalanceSnapshot, PositionSnapshot};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub account_type: AccountType,
    pub account_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub balance: Duration,
    pub positions: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            balance: Duration::seconds(60),
            positions: Duration::seconds(30),
        }
    }
}

struct PositionsEntry {
    list: Vec<PositionSnapshot>,
    fetched_at: DateTime<Utc>,
}

pub struct AccountStateCache {
    broker: Arc<dyn BrokerageService>,
    quotes: Arc<dyn QuoteService>,
    audit: Arc<dyn BalanceAuditRepository>,
    identity: RwLock<AccountIdentity>,
    balance: RwLock<Option<BalanceSnapshot>>,
    positions: Arc<RwLock<Option<PositionsEntry>>>,
    /// Bumped on every commit and invalidation. A background re-price
    /// captures the value at spawn and applies its result only while it
    /// still matches, so a slow reprice never clobbers newer data.
    generation: Arc<AtomicU64>,
    ttls: CacheTtls,
}

impl AccountStateCache {
    pub fn new(
        broker: Arc<dyn BrokerageService>,
        quotes: Arc<dyn QuoteService>,
        audit: Arc<dyn BalanceAuditRepository>,
        identity: AccountIdentity,
        ttls: CacheTtls,
    ) -> Self {
        Self {
            broker,
            quotes,
            audit,
            identity: RwLock::new(identity),
            balance: RwLock::new(None),
            positions: Arc::new(RwLock::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            ttls,
        }
    }

    pub async fn account_identity(&self) -> AccountIdentity {
        self.identity.read().await.clone()
    }

    /// Balance snapshot, at most `ttls.balance` old. Serves stale data on
    /// refresh failure and a zero snapshot when nothing was ever fetched.
    pub async fn get_balance(&self) -> BalanceSnapshot {
        let now = Utc::now();
        {
            let guard = self.balance.read().await;
            if let Some(snap) = guard.as_ref()
                && now - snap.fetched_at < self.ttls.balance
            {
                return snap.clone();
            }
        }

        let identity = self.identity.read().await.clone();
        match self.broker.fetch_balance().await {
            Ok(funds) => {
                let positions = self.get_positions().await;
                let position_value: Decimal = positions.iter().map(|p| p.market_value()).sum();
                let snapshot = BalanceSnapshot::compute(&funds, position_value, Utc::now());

                if *self.identity.read().await != identity {
                    info!("AccountCache: account switched during balance refresh, not caching");
                    return snapshot;
                }

                *self.balance.write().await = Some(snapshot.clone());
                if let Err(e) = self.audit.record(&identity.account_id, &snapshot).await {
                    warn!("AccountCache: balance audit write failed: {e}");
                }
                snapshot
            }
            Err(e) => {
                let guard = self.balance.read().await;
                match guard.as_ref() {
                    Some(snap) => {
                        warn!(
                            "AccountCache: balance refresh failed, serving snapshot from {}: {e}",
                            snap.fetched_at
                        );
                        snap.clone()
                    }
                    None => {
                        warn!("AccountCache: balance refresh failed with no prior snapshot: {e}");
                        BalanceSnapshot::empty(now)
                    }
                }
            }
        }
    }

    /// Position snapshots, at most `ttls.positions` old. Same degradation
    /// rules as `get_balance`; the empty list is the zero value. Always
    /// triggers a detached re-price of whatever is returned.
    pub async fn get_positions(&self) -> Vec<PositionSnapshot> {
        let now = Utc::now();
        {
            let guard = self.positions.read().await;
            if let Some(entry) = guard.as_ref()
                && now - entry.fetched_at < self.ttls.positions
            {
                let list = entry.list.clone();
                drop(guard);
                self.spawn_reprice(&list);
                return list;
            }
        }

        let identity = self.identity.read().await.clone();
        match self.broker.fetch_positions().await {
            Ok(list) => {
                if *self.identity.read().await != identity {
                    info!("AccountCache: account switched during position refresh, not caching");
                    return list;
                }

                {
                    let mut guard = self.positions.write().await;
                    *guard = Some(PositionsEntry {
                        list: list.clone(),
                        fetched_at: Utc::now(),
                    });
                    self.generation.fetch_add(1, Ordering::SeqCst);
                }
                self.spawn_reprice(&list);
                list
            }
            Err(e) => {
                let guard = self.positions.read().await;
                match guard.as_ref() {
                    Some(entry) => {
                        warn!(
                            "AccountCache: position refresh failed, serving snapshot from {}: {e}",
                            entry.fetched_at
                        );
                        entry.list.clone()
                    }
                    None => {
                        warn!("AccountCache: position refresh failed with no prior snapshot: {e}");
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Drop all cached state so the next read goes upstream.
    pub async fn invalidate(&self) {
        *self.balance.write().await = None;
        *self.positions.write().await = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!("AccountCache: invalidated");
    }

    /// Track a different account. A switch to the same account type keeps
    /// all cached state; a differing type clears everything.
    pub async fn on_account_switch(&self, account_type: AccountType, account_id: &str) {
        {
            let identity = self.identity.read().await;
            if identity.account_type == account_type {
                debug!("AccountCache: switch to same account type, keeping cache");
                return;
            }
        }

        *self.identity.write().await = AccountIdentity {
            account_type,
            account_id: account_id.to_string(),
        };
        self.invalidate().await;
        info!("AccountCache: switched to {account_type} account {account_id}");
    }

    /// Refresh cached position prices from the fast feed without blocking
    /// the caller. The result is committed only if the cache generation is
    /// unchanged; any failure is logged and dropped.
    fn spawn_reprice(&self, list: &[PositionSnapshot]) {
        if list.is_empty() {
            return;
        }

        let tickers: Vec<String> = list.iter().map(|p| p.ticker.clone()).collect();
        let quotes = self.quotes.clone();
        let positions = self.positions.clone();
        let generation = self.generation.clone();
        let seen_generation = generation.load(Ordering::SeqCst);

        tokio::spawn(async move {
            let prices = match quotes.get_quotes(&tickers).await {
                Ok(prices) => prices,
                Err(e) => {
                    debug!("AccountCache: background reprice failed: {e}");
                    return;
                }
            };

            let now = Utc::now();
            let mut guard = positions.write().await;
            if generation.load(Ordering::SeqCst) != seen_generation {
                debug!("AccountCache: discarding reprice for superseded generation");
                return;
            }
            if let Some(entry) = guard.as_mut() {
                for position in entry.list.iter_mut() {
                    if let Some(price) = prices.get(&position.ticker) {
                        position.reprice(*price, now);
                    }
                }
                generation.store(seen_generation + 1, Ordering::SeqCst);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::{
        InMemoryBalanceAuditRepository, MockBrokerageService, MockQuoteService,
    };
    use crate::domain::errors::BrokerError;
    use crate::domain::types::AccountFunds;
    use rust_decimal_macros::dec;

    fn identity() -> AccountIdentity {
        AccountIdentity {
            account_type: AccountType::Virtual,
            account_id: "acct-1".to_string(),
        }
    }

    fn cache_with(
        broker: &MockBrokerageService,
        quotes: &MockQuoteService,
        ttls: CacheTtls,
    ) -> AccountStateCache {
        AccountStateCache::new(
            Arc::new(broker.clone()),
            Arc::new(quotes.clone()),
            Arc::new(InMemoryBalanceAuditRepository::new()),
            identity(),
            ttls,
        )
    }

    #[tokio::test]
    async fn fresh_balance_skips_upstream() {
        let broker = MockBrokerageService::new();
        broker
            .set_funds(AccountFunds {
                cash: dec!(8000),
                buying_power: dec!(10000),
            })
            .await;
        let cache = cache_with(&broker, &MockQuoteService::new(), CacheTtls::default());

        let first = cache.get_balance().await;
        let second = cache.get_balance().await;

        assert_eq!(broker.balance_fetches(), 1);
        assert_eq!(first.buying_power, dec!(10000));
        assert_eq!(second.fetched_at, first.fetched_at);
    }

    #[tokio::test]
    async fn failed_refresh_serves_stale_snapshot() {
        let broker = MockBrokerageService::new();
        broker
            .set_funds(AccountFunds {
                cash: dec!(5000),
                buying_power: dec!(5000),
            })
            .await;
        // Zero TTL: every read goes upstream.
        let ttls = CacheTtls {
            balance: Duration::zero(),
            positions: Duration::zero(),
        };
        let cache = cache_with(&broker, &MockQuoteService::new(), ttls);

        let good = cache.get_balance().await;
        assert_eq!(good.buying_power, dec!(5000));

        broker
            .fail_fetches_with(BrokerError::unavailable("down"))
            .await;
        let stale = cache.get_balance().await;
        assert_eq!(stale.buying_power, dec!(5000));
        assert_eq!(stale.fetched_at, good.fetched_at);
    }

    #[tokio::test]
    async fn no_prior_snapshot_yields_zero_value() {
        let broker = MockBrokerageService::new();
        broker
            .fail_fetches_with(BrokerError::unavailable("down"))
            .await;
        let cache = cache_with(&broker, &MockQuoteService::new(), CacheTtls::default());

        let balance = cache.get_balance().await;
        assert_eq!(balance.buying_power, Decimal::ZERO);
        assert_eq!(balance.total_balance, Decimal::ZERO);

        let positions = cache.get_positions().await;
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn total_balance_adds_position_value_to_buying_power() {
        let broker = MockBrokerageService::new();
        broker
            .set_funds(AccountFunds {
                cash: dec!(8000),
                buying_power: dec!(10000),
            })
            .await;
        broker
            .set_positions(vec![PositionSnapshot::new(
                "AAPL",
                10,
                dec!(40),
                dec!(50),
                Utc::now(),
            )])
            .await;
        let cache = cache_with(&broker, &MockQuoteService::new(), CacheTtls::default());

        let balance = cache.get_balance().await;
        // 10 shares at the current price of 50 on top of buying power.
        assert_eq!(balance.total_balance, dec!(10500));
    }

    #[tokio::test]
    async fn switch_to_differing_type_clears_cache() {
        let broker = MockBrokerageService::new();
        broker
            .set_funds(AccountFunds {
                cash: dec!(1000),
                buying_power: dec!(1000),
            })
            .await;
        let cache = cache_with(&broker, &MockQuoteService::new(), CacheTtls::default());

        cache.get_balance().await;
        assert_eq!(broker.balance_fetches(), 1);

        cache.on_account_switch(AccountType::Real, "acct-2").await;
        cache.get_balance().await;
        assert_eq!(broker.balance_fetches(), 2);

        let identity = cache.account_identity().await;
        assert_eq!(identity.account_type, AccountType::Real);
        assert_eq!(identity.account_id, "acct-2");
    }

    #[tokio::test]
    async fn switch_to_same_type_keeps_cache() {
        let broker = MockBrokerageService::new();
        broker
            .set_funds(AccountFunds {
                cash: dec!(1000),
                buying_power: dec!(1000),
            })
            .await;
        let cache = cache_with(&broker, &MockQuoteService::new(), CacheTtls::default());

        cache.get_balance().await;
        cache.on_account_switch(AccountType::Virtual, "acct-other").await;
        cache.get_balance().await;

        assert_eq!(broker.balance_fetches(), 1);
        // Identity is untouched on a same-type switch.
        assert_eq!(cache.account_identity().await.account_id, "acct-1");
    }

    #[tokio::test]
    async fn background_reprice_moves_cached_prices() {
        let broker = MockBrokerageService::new();
        broker
            .set_positions(vec![PositionSnapshot::new(
                "AAPL",
                10,
                dec!(100),
                dec!(100),
                Utc::now(),
            )])
            .await;
        let quotes = MockQuoteService::new();
        quotes.set_price("AAPL", dec!(110)).await;
        let cache = cache_with(&broker, &quotes, CacheTtls::default());

        let initial = cache.get_positions().await;
        assert_eq!(initial[0].current_price, dec!(100));

        // Let the detached reprice land.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let repriced = cache.get_positions().await;
        assert_eq!(broker.position_fetches(), 1, "second read must hit cache");
        assert_eq!(repriced[0].current_price, dec!(110));
        assert_eq!(repriced[0].profit_loss, dec!(100));
    }

    #[tokio::test]
    async fn reprice_failure_keeps_cache_intact() {
        let broker = MockBrokerageService::new();
        broker
            .set_positions(vec![PositionSnapshot::new(
                "AAPL",
                10,
                dec!(100),
                dec!(100),
                Utc::now(),
            )])
            .await;
        let quotes = MockQuoteService::new();
        quotes.fail_with(BrokerError::unavailable("feed down")).await;
        let cache = cache_with(&broker, &quotes, CacheTtls::default());

        cache.get_positions().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let positions = cache.get_positions().await;
        assert_eq!(positions[0].current_price, dec!(100));
    }
}
