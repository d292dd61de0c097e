//! Repository traits for durable state.
//!
//! Storage concerns stay behind these traits so the caching and scheduling
//! logic never touches SQL directly. SQLite implementations live in
//! `infrastructure::persistence`; tests use the in-memory variants from
//! `infrastructure::mock`.

use crate::domain::types::{BalanceSnapshot, Credential, PendingOrder, TradeRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Append-only trade history.
#[async_trait]
pub trait TradeRepository: Send + Sync {
    async fn append(&self, record: &TradeRecord) -> Result<()>;

    async fn find_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<TradeRecord>>;

    async fn find_recent(&self, limit: usize) -> Result<Vec<TradeRecord>>;

    async fn count(&self) -> Result<usize>;
}

/// Pending orders survive restarts; rows are inserted on enqueue and
/// deleted when the scheduler consumes them.
#[async_trait]
pub trait PendingOrderRepository: Send + Sync {
    async fn insert(&self, order: &PendingOrder) -> Result<()>;

    async fn remove(&self, id: Uuid) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<PendingOrder>>;
}

/// Balance snapshots written per successful refresh. Audit trail only; the
/// cache never reads from here.
#[async_trait]
pub trait BalanceAuditRepository: Send + Sync {
    async fn record(&self, account_id: &str, snapshot: &BalanceSnapshot) -> Result<()>;
}

/// Token storage for reuse across restarts.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<Credential>>;

    async fn save(&self, credential: &Credential) -> Result<()>;
}
