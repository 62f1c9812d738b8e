//! Dispatcher binary. Run after a completed scoring pass.

use agent_trust::dispatch::Dispatcher;
use agent_trust::store::EventStore;
use agent_trust::utils::config::Config;
use std::time::Instant;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agent_trust::utils::env_guard::harden_env_setup();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    let store = EventStore::open(&config.database_path)?;

    let started = Instant::now();
    let outcome = Dispatcher::new(store)?.run().await?;

    tracing::info!(
        "[SUMMARY] {}s elapsed | {} snapshot(s) processed, {} match(es), {} delivered, {} failed, {} webhook(s) disabled",
        started.elapsed().as_secs(),
        outcome.snapshots_processed,
        outcome.matched,
        outcome.delivered,
        outcome.failed,
        outcome.webhooks_disabled
    );

    Ok(())
}
