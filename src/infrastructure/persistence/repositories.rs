use crate::domain::repositories::{
    BalanceAuditRepository, CredentialStore, PendingOrderRepository, TradeRepository,
};
use crate::domain::types::{BalanceSnapshot, Credential, OrderSide, PendingOrder, TradeRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

pub struct SqliteTradeRepository {
    pool: SqlitePool,
}

impl SqliteTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn map_rows(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<TradeRecord>> {
        let mut trades = Vec::new();
        for row in rows {
            let side_str: String = row.try_get("side")?;
            let side = match side_str.as_str() {
                "SELL" => OrderSide::Sell,
                _ => OrderSide::Buy,
            };
            let id_str: String = row.try_get("id")?;

            trades.push(TradeRecord {
                id: Uuid::parse_str(&id_str).unwrap_or_default(),
                ticker: row.try_get("ticker")?,
                side,
                quantity: row.try_get::<i64, _>("quantity")? as u32,
                price: Decimal::from_str(row.try_get("price")?).unwrap_or_default(),
                reason: row.try_get("reason")?,
                executed_at: row.try_get("executed_at")?,
            });
        }
        Ok(trades)
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn append(&self, record: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (id, ticker, side, quantity, price, reason, executed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.ticker)
        .bind(record.side.to_string())
        .bind(record.quantity as i64)
        .bind(record.price.to_string())
        .bind(&record.reason)
        .bind(record.executed_at)
        .execute(&self.pool)
        .await
        .context("Failed to save trade")?;

        debug!("Persisted trade {}", record.id);
        Ok(())
    }

    async fn find_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE executed_at >= ? ORDER BY executed_at DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Self::map_rows(rows)
    }

    async fn find_recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY executed_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Self::map_rows(rows)
    }

    async fn count(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM trades")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as usize)
    }
}

pub struct SqlitePendingOrderRepository {
    pool: SqlitePool,
}

impl SqlitePendingOrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PendingOrderRepository for SqlitePendingOrderRepository {
    async fn insert(&self, order: &PendingOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_orders (id, ticker, quantity, price, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(order.id.to_string())
        .bind(&order.ticker)
        .bind(order.quantity as i64)
        .bind(order.price.to_string())
        .bind(&order.reason)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save pending order")?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM pending_orders WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete pending order")?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PendingOrder>> {
        let rows = sqlx::query("SELECT * FROM pending_orders ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut orders = Vec::new();
        for row in rows {
            let id_str: String = row.try_get("id")?;
            orders.push(PendingOrder {
                id: Uuid::parse_str(&id_str).unwrap_or_default(),
                ticker: row.try_get("ticker")?,
                quantity: row.try_get::<i64, _>("quantity")? as u32,
                price: Decimal::from_str(row.try_get("price")?).unwrap_or_default(),
                reason: row.try_get("reason")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(orders)
    }
}

pub struct SqliteBalanceAuditRepository {
    pool: SqlitePool,
}

impl SqliteBalanceAuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BalanceAuditRepository for SqliteBalanceAuditRepository {
    async fn record(&self, account_id: &str, snapshot: &BalanceSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO balance_log (account_id, buying_power, total_balance, cash, fetched_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(account_id)
        .bind(snapshot.buying_power.to_string())
        .bind(snapshot.total_balance.to_string())
        .bind(snapshot.cash.to_string())
        .bind(snapshot.fetched_at)
        .execute(&self.pool)
        .await
        .context("Failed to log balance snapshot")?;
        Ok(())
    }
}

pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self, account_id: &str) -> Result<Option<Credential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(Credential {
            account_id: row.try_get("account_id")?,
            access_token: row.try_get("access_token")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    async fn save(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (account_id, access_token, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                access_token = excluded.access_token,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&credential.account_id)
        .bind(&credential.access_token)
        .bind(credential.expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to save credential")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::Database;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn temp_db() -> Database {
        let path = std::env::temp_dir().join(format!("newstrade-test-{}.db", Uuid::new_v4()));
        Database::new(&format!("sqlite://{}", path.display()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn trade_roundtrip_and_count() {
        let db = temp_db().await;
        let repo = SqliteTradeRepository::new(db.pool.clone());

        let record = TradeRecord::new(
            "AAPL",
            OrderSide::Buy,
            20,
            dec!(50.00),
            "news signal 87.5",
        );
        repo.append(&record).await.unwrap();
        // Same id again is a no-op.
        repo.append(&record).await.unwrap();

        assert_eq!(repo.count().await.unwrap(), 1);

        let recent = repo.find_recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].ticker, "AAPL");
        assert_eq!(recent[0].side, OrderSide::Buy);
        assert_eq!(recent[0].quantity, 20);
        assert_eq!(recent[0].price, dec!(50.00));

        let since = repo
            .find_since(Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(since.len(), 1);

        let none = repo
            .find_since(Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn pending_orders_survive_and_remove() {
        let db = temp_db().await;
        let repo = SqlitePendingOrderRepository::new(db.pool.clone());

        let order = PendingOrder::new("TSLA", 5, dec!(250.00), "after-hours signal");
        repo.insert(&order).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, order.id);
        assert_eq!(loaded[0].ticker, "TSLA");

        repo.remove(order.id).await.unwrap();
        assert!(repo.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn credential_save_overwrites() {
        let db = temp_db().await;
        let store = SqliteCredentialStore::new(db.pool.clone());

        assert!(store.load("acct-1").await.unwrap().is_none());

        let first = Credential {
            account_id: "acct-1".to_string(),
            access_token: "token-a".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        };
        store.save(&first).await.unwrap();

        let second = Credential {
            access_token: "token-b".to_string(),
            ..first.clone()
        };
        store.save(&second).await.unwrap();

        let loaded = store.load("acct-1").await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "token-b");
    }

    #[tokio::test]
    async fn balance_log_accepts_snapshots() {
        let db = temp_db().await;
        let repo = SqliteBalanceAuditRepository::new(db.pool.clone());

        let snapshot = BalanceSnapshot {
            buying_power: dec!(10000),
            total_balance: dec!(12500),
            cash: dec!(8000),
            fetched_at: Utc::now(),
        };
        repo.record("acct-1", &snapshot).await.unwrap();
        repo.record("acct-1", &snapshot).await.unwrap();

        let row = sqlx::query("SELECT COUNT(*) as count FROM balance_log")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let count: i64 = row.try_get("count").unwrap();
        assert_eq!(count, 2);
    }
}
