//! Orion Screener - bounded polling run for scheduled CI jobs.
//!
//! Always exits with status 0 so a flaky upstream never fails the schedule;
//! problems surface in the logs, the status document and Telegram.

use orion_common::logging::init_logging;
use orion_common::OrionConfig;
use orion_screener::runner::harvester_from_config;
use orion_screener::{store_from_config, Runner, SnapshotSink};

#[tokio::main]
async fn main() {
    // Start timing immediately for cold-start measurement
    let startup_start = std::time::Instant::now();

    let config = match OrionConfig::load_with_env() {
        Ok(config) => config,
        Err(e) => {
            init_logging("info", "pretty");
            tracing::error!(error = %e, "Failed to load configuration, exiting");
            return;
        }
    };

    init_logging_from(&config);

    tracing::info!("Orion Screener v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration, exiting");
        return;
    }

    let store = match store_from_config(&config.firebase) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up snapshot store, exiting");
            return;
        }
    };
    let sink = SnapshotSink::new(store, &config.firebase);

    tracing::info!(
        remote_store = config.has_remote_store(),
        telegram = config.telegram_ready(),
        browser_fallback = config.browser.enabled,
        trading = config.trading.enabled,
        "Startup mode"
    );

    let harvester = harvester_from_config(&config);
    let mut runner = Runner::new(config, sink);
    if let Some(harvester) = harvester {
        runner = runner.with_harvester(harvester);
    }

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    runner.run(shutdown_signal()).await;
}

fn init_logging_from(config: &OrionConfig) {
    orion_common::logging::init_logging_with_exclusions(
        &config.observability.log_level,
        &config.observability.log_format,
        &config.observability.excluded_targets,
    );
}

/// Resolves on Ctrl+C. Never resolves when signals are unavailable.
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("Ctrl+C handler unavailable, relying on the global timeout");
        std::future::pending::<()>().await;
    }
}
