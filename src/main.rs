//! Headless news-trading service.
//!
//! Reads configuration from the environment, wires the services and runs
//! until Ctrl+C. All observability is structured logs on stdout.

use anyhow::Result;
use newstrade::application::system::Application;
use newstrade::config::Config;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("newstrade {} starting...", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: mode={:?}, account={}, simulation={}",
        config.mode, config.account_type, config.simulation_mode
    );

    let app = Application::build(config).await?;
    let handle = app.start().await?;

    let balance = handle.balance().await;
    info!(
        "Account ready: buying power {}, total balance {}",
        balance.buying_power, balance.total_balance
    );

    info!("Running. Press Ctrl+C to shut down.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting...");

    Ok(())
}
