use crate::domain::types::PositionSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Open positions tracked by the trading workflow itself, keyed by ticker.
///
/// This is the working set the decision engine appends to, the scheduler
/// extends during pending replay and the monitor sweeps for exits. It is
/// not the brokerage's view; that lives in the account cache.
#[derive(Clone, Default)]
pub struct PositionBook {
    inner: Arc<RwLock<HashMap<String, PositionSnapshot>>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, snapshot: PositionSnapshot) {
        self.inner
            .write()
            .await
            .insert(snapshot.ticker.clone(), snapshot);
    }

    pub async fn remove(&self, ticker: &str) -> Option<PositionSnapshot> {
        self.inner.write().await.remove(ticker)
    }

    pub async fn contains(&self, ticker: &str) -> bool {
        self.inner.read().await.contains_key(ticker)
    }

    pub async fn get(&self, ticker: &str) -> Option<PositionSnapshot> {
        self.inner.read().await.get(ticker).cloned()
    }

    pub async fn all(&self) -> Vec<PositionSnapshot> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
