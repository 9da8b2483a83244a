//! Scheduler daemon against an in-memory store
//!
//! Seeds one schedule that fires every minute against the configured run API,
//! then polls until Ctrl-C.
//!
//! Run with: cargo run -p runwarden-coordinator --example scheduler_daemon

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use runwarden_coordinator::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runwarden_coordinator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CoordinatorConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        api_base_url = %config.api_base_url,
        worker_id = %config.worker_id,
        max_concurrent = config.max_concurrent_schedules,
        "Starting scheduler daemon"
    );

    let store = Arc::new(InMemoryCoordinationStore::new());
    store.insert_schedule(
        Schedule::new("hourly-digest", "POST", "/agents/digest/runs", "* * * * *")
            .with_payload(json!({"message": "Summarize what changed since the last run"}))
            .with_retries(2, 30)
            .with_timeout_seconds(600),
    );

    let executor = Arc::new(ScheduleExecutor::new(
        store.clone(),
        Arc::new(config.api_client()),
        Arc::new(FixedInterval::new(Duration::from_secs(60))),
        config.executor_config(),
    ));
    let poller = SchedulePoller::new(store.clone(), executor, config.poller_config());
    poller.start().context("Failed to start poller")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    if let Err(e) = poller.shutdown().await {
        tracing::warn!(error = %e, "Poller did not shut down cleanly");
    }

    tracing::info!("Scheduler daemon stopped");
    Ok(())
}
