use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Brokerage account category. Real and virtual accounts hit different
/// transaction codes upstream and must never share cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Real,
    Virtual,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountType::Real => write!(f, "REAL"),
            AccountType::Virtual => write!(f, "VIRTUAL"),
        }
    }
}

impl std::str::FromStr for AccountType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "real" => Ok(AccountType::Real),
            "virtual" => Ok(AccountType::Virtual),
            _ => anyhow::bail!("Invalid ACCOUNT_TYPE: {}. Must be 'real' or 'virtual'", s),
        }
    }
}

/// Access token for one brokerage account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub account_id: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cash figures as reported by the brokerage. Total balance is never taken
/// from here; it is derived in `BalanceSnapshot::compute`.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountFunds {
    pub cash: Decimal,
    pub buying_power: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub buying_power: Decimal,
    pub total_balance: Decimal,
    pub cash: Decimal,
    pub fetched_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    /// Canonical total-balance formula: buying power plus the market value
    /// of all positions. Every refresh path goes through here.
    pub fn compute(
        funds: &AccountFunds,
        position_value: Decimal,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            buying_power: funds.buying_power,
            total_balance: funds.buying_power + position_value,
            cash: funds.cash,
            fetched_at,
        }
    }

    /// Zero-value returned when no refresh has ever succeeded.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            buying_power: Decimal::ZERO,
            total_balance: Decimal::ZERO,
            cash: Decimal::ZERO,
            fetched_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub ticker: String,
    pub quantity: u32,
    pub buy_price: Decimal,
    pub current_price: Decimal,
    pub profit_loss: Decimal,
    pub profit_loss_percent: Decimal,
    pub fetched_at: DateTime<Utc>,
}

impl PositionSnapshot {
    pub fn new(
        ticker: impl Into<String>,
        quantity: u32,
        buy_price: Decimal,
        current_price: Decimal,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let mut snapshot = Self {
            ticker: ticker.into(),
            quantity,
            buy_price,
            current_price,
            profit_loss: Decimal::ZERO,
            profit_loss_percent: Decimal::ZERO,
            fetched_at,
        };
        snapshot.recompute_pnl();
        snapshot
    }

    /// Update the price fields in place without touching quantity or cost
    /// basis. Used by the background re-price between full refreshes.
    pub fn reprice(&mut self, price: Decimal, at: DateTime<Utc>) {
        self.current_price = price;
        self.fetched_at = at;
        self.recompute_pnl();
    }

    pub fn market_value(&self) -> Decimal {
        self.current_price * Decimal::from(self.quantity)
    }

    fn recompute_pnl(&mut self) {
        let qty = Decimal::from(self.quantity);
        self.profit_loss = (self.current_price - self.buy_price) * qty;
        self.profit_loss_percent = if self.buy_price.is_zero() {
            Decimal::ZERO
        } else {
            (self.current_price - self.buy_price) / self.buy_price * Decimal::from(100)
        };
    }
}

/// Buy decision deferred because the market was closed. The stored price is
/// sizing context only; replay re-fetches before executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: Uuid,
    pub ticker: String,
    pub quantity: u32,
    pub price: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn new(
        ticker: impl Into<String>,
        quantity: u32,
        price: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            quantity,
            price,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub price: Decimal,
    pub reason: String,
    pub executed_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn new(
        ticker: impl Into<String>,
        side: OrderSide,
        quantity: u32,
        price: Decimal,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            side,
            quantity,
            price,
            reason: reason.into(),
            executed_at: Utc::now(),
        }
    }
}

/// Broker-side fill as returned by the trade-history endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFill {
    pub order_no: String,
    pub ticker: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub price: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Single tick decoded from the quote stream.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteUpdate {
    pub ticker: String,
    pub price: Decimal,
    pub change_rate: Decimal,
    pub volume: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn total_balance_is_buying_power_plus_position_value() {
        let funds = AccountFunds {
            cash: dec!(2500),
            buying_power: dec!(4000),
        };
        let snapshot = BalanceSnapshot::compute(&funds, dec!(1500), Utc::now());

        assert_eq!(snapshot.total_balance, dec!(5500));
        assert_eq!(snapshot.buying_power, dec!(4000));
        assert_eq!(snapshot.cash, dec!(2500));
    }

    #[test]
    fn position_pnl_recomputed_on_reprice() {
        let mut position =
            PositionSnapshot::new("AAPL".to_string(), 10, dec!(100), dec!(100), Utc::now());
        assert_eq!(position.profit_loss, dec!(0));

        position.reprice(dec!(110), Utc::now());
        assert_eq!(position.profit_loss, dec!(100));
        assert_eq!(position.profit_loss_percent, dec!(10));
        assert_eq!(position.market_value(), dec!(1100));
    }

    #[test]
    fn position_with_zero_cost_basis_reports_zero_percent() {
        let position = PositionSnapshot::new("FREE".to_string(), 5, dec!(0), dec!(3), Utc::now());
        assert_eq!(position.profit_loss_percent, dec!(0));
        assert_eq!(position.profit_loss, dec!(15));
    }

    #[test]
    fn credential_expiry_is_inclusive() {
        let now = Utc::now();
        let credential = Credential {
            account_id: "acct".to_string(),
            access_token: "tok".to_string(),
            expires_at: now,
        };
        assert!(credential.is_expired(now));
        assert!(!credential.is_expired(now - chrono::Duration::seconds(1)));
    }
}
