// Domain-specific error types
pub mod errors;

// US market session calendar
pub mod market_hours;

// News events and scored signals
pub mod news;

// Port interfaces
pub mod ports;

// Repository traits
pub mod repositories;

// Core trading domain
pub mod types;
