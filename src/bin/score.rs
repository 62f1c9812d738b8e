//! Scoring binary.
//!
//! Derives per-wallet signals in one aggregation pass and composes trust
//! scores. Incremental by default; `--full` rescores every wallet. The pass
//! is exclusive: a second concurrent invocation fails fast on the run lock.

use agent_trust::scoring::engine::run_scoring_pass;
use agent_trust::store::EventStore;
use agent_trust::utils::config::Config;
use anyhow::anyhow;
use std::time::Instant;

fn print_usage() {
    eprintln!(
        "usage: score [--full]\n\
         \n\
         --full    rescore every wallet instead of only dirty ones"
    );
}

fn parse_full_flag() -> anyhow::Result<bool> {
    let mut full = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--full" | "-f" => full = true,
            other => return Err(anyhow!("unknown argument '{other}'")),
        }
    }
    Ok(full)
}

fn main() -> anyhow::Result<()> {
    let full = parse_full_flag().inspect_err(|_| print_usage())?;
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
    let outcome = run_scoring_pass(&store, full)?;

    tracing::info!(
        "[SUMMARY] {}s elapsed | {} wallet(s) scored, {} skipped",
        started.elapsed().as_secs(),
        outcome.scored,
        outcome.skipped
    );
    tracing::info!(
        "[SUMMARY] tiers: HIGH {} | MEDIUM {} | LOW {} | MINIMAL {}",
        outcome.tier_high,
        outcome.tier_medium,
        outcome.tier_low,
        outcome.tier_minimal
    );
    if !outcome.top.is_empty() {
        tracing::info!("[SUMMARY] top wallets:");
        for (address, score) in &outcome.top {
            tracing::info!("[SUMMARY]   {} {}", score, address);
        }
    }
    if !outcome.bottom.is_empty() {
        tracing::info!("[SUMMARY] bottom wallets:");
        for (address, score) in &outcome.bottom {
            tracing::info!("[SUMMARY]   {} {}", score, address);
        }
    }
    tracing::info!(
        "[SUMMARY] store size: {} byte(s) on disk",
        store.db_size_bytes()
    );

    Ok(())
}
