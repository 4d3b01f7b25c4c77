//! resilient-db - Main entry point.
//!
//! Starts the database lifecycle in the background and serves the health
//! endpoint immediately, whether or not the database is reachable yet.

use clap::Parser;
use resilient_db::config::Config;
use resilient_db::db::LifecycleManager;
use resilient_db::http::{self, AppState};
use resilient_db::repository::Repository;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let settings = match config.database_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: invalid database configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        database_enabled = settings.enabled,
        max_list_limit = config.max_list_limit,
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let lifecycle = LifecycleManager::new(settings, Vec::new());
    lifecycle.start();

    let repository =
        Repository::new(lifecycle.clone()).with_max_list_limit(config.max_list_limit);
    let result = http::serve(AppState::new(repository), &config.http_bind_addr()).await;

    info!("Closing database connections");
    lifecycle.close().await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
