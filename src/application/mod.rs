// TTL cache over balance and position queries
pub mod account_cache;

// News-driven decision rules and manual trading
pub mod decision;

// Broker trade-history import
pub mod history_sync;

// Working set of open positions
pub mod position_book;

// Stop-loss / take-profit sweep
pub mod position_monitor;

// Pending orders and the market-open replay
pub mod scheduler;

// Service wiring and the operator handle
pub mod system;
