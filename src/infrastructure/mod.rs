// Brokerage REST and token management
pub mod broker;

// Shared HTTP plumbing
pub mod core;

// Delayed/snapshot quote REST client
pub mod market_data;

// In-memory implementations for mock mode and tests
pub mod mock;

// RSS ingestion and sentiment scoring
pub mod news;

// SQLite-backed storage
pub mod persistence;

// Realtime websocket quote session
pub mod quote_stream;
