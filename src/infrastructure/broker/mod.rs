pub mod rest;
pub mod token;

pub use rest::BrokerRestClient;
pub use token::{HttpTokenEndpoint, TokenManager};
