//! Indexer binary.
//!
//! Scans the configured chains for identity, feedback, and payment events,
//! persisting them idempotently and advancing per-scanner cursors. Clean
//! stops (up-to-date, block limit reached, budget exhausted) exit 0; an
//! unrecoverable error exits 1 with the cursor left at the last committed
//! batch.

use agent_trust::budget::BudgetGovernor;
use agent_trust::config::chains::{Chain, ChainConfig};
use agent_trust::gateway::ChainGateway;
use agent_trust::indexer::{
    feedback::FeedbackScanner, identity::IdentityScanner, payments::PaymentScanner, run_scanner,
    BatchStats, ScanOptions,
};
use agent_trust::store::EventStore;
use agent_trust::utils::config::Config;
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Instant;

struct Args {
    chains: Vec<Chain>,
    days: Option<u64>,
    limit: Option<u64>,
}

fn print_usage() {
    eprintln!(
        "usage: indexer [--chain <ethereum|base|arbitrum|all>] [--days N] [--limit N]\n\
         \n\
         --chain   chain to scan (default: all)\n\
         --days    default window in days when a scanner has no cursor yet\n\
         --limit   cap on blocks scanned per scanner this run"
    );
}

fn parse_args() -> anyhow::Result<Args> {
    let mut chains: Option<Vec<Chain>> = None;
    let mut days: Option<u64> = None;
    let mut limit: Option<u64> = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--chain" | "-c" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| anyhow!("missing value for {arg}"))?;
                if raw.trim().eq_ignore_ascii_case("all") {
                    chains = Some(Chain::all().to_vec());
                } else {
                    let chain = Chain::parse(&raw)
                        .ok_or_else(|| anyhow!("unknown chain '{raw}' (expected ethereum|base|arbitrum|all)"))?;
                    chains = Some(vec![chain]);
                }
            }
            "--days" | "-d" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| anyhow!("missing value for {arg}"))?;
                days = Some(
                    raw.parse::<u64>()
                        .map_err(|e| anyhow!("invalid --days '{raw}': {e}"))?,
                );
            }
            "--limit" | "-l" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| anyhow!("missing value for {arg}"))?;
                let parsed = raw
                    .parse::<u64>()
                    .map_err(|e| anyhow!("invalid --limit '{raw}': {e}"))?;
                if parsed == 0 {
                    return Err(anyhow!("--limit must be positive"));
                }
                limit = Some(parsed);
            }
            other => return Err(anyhow!("unknown argument '{other}'")),
        }
    }

    Ok(Args {
        chains: chains.unwrap_or_else(|| Chain::all().to_vec()),
        days,
        limit,
    })
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args().inspect_err(|_| print_usage())?;
    agent_trust::utils::env_guard::harden_env_setup();
    init_tracing();

    let config = Config::load()?;
    let store = EventStore::open(&config.database_path)?;
    let governor = Arc::new(BudgetGovernor::from_env());
    let options = ScanOptions {
        window_days: args.days,
        block_limit: args.limit,
    };

    let started = Instant::now();
    let mut totals = BatchStats::default();
    let mut budget_stopped = false;

    'chains: for chain in &args.chains {
        let chain_config = ChainConfig::get(*chain);
        tracing::info!(
            "[STARTUP] Scanning {} (chain id {})",
            chain_config.name,
            chain_config.chain_id
        );
        let gateway = ChainGateway::connect(
            &config.rpc_url(chain_config.network),
            chain_config.clone(),
            governor.clone(),
        )?;

        let identity = IdentityScanner::new(chain_config.clone());
        let feedback = FeedbackScanner::new(chain_config.clone());
        let payments = PaymentScanner::new(chain_config.clone());

        let outcomes = [
            run_scanner(&identity, &gateway, &store, &governor, &options).await?,
            run_scanner(&feedback, &gateway, &store, &governor, &options).await?,
            run_scanner(&payments, &gateway, &store, &governor, &options).await?,
        ];
        for outcome in outcomes {
            totals.absorb(outcome.stats);
            if outcome.stopped_by_budget {
                budget_stopped = true;
            }
        }
        if budget_stopped {
            tracing::warn!("[SCAN] Budget stop observed; not starting further chains");
            break 'chains;
        }
    }

    let counts = store.counts()?;
    let budget = governor.snapshot();
    tracing::info!(
        "[SUMMARY] {}s elapsed | {} event(s) found, {} row(s) inserted, {} skipped, {} wallet(s) touched",
        started.elapsed().as_secs(),
        totals.events_found,
        totals.rows_inserted,
        totals.rows_skipped,
        totals.wallets_touched
    );
    tracing::info!(
        "[SUMMARY] store: {} wallet(s), {} transaction(s), {} feedback row(s), {} byte(s) on disk",
        counts.wallets,
        counts.transactions,
        counts.feedback,
        store.db_size_bytes()
    );
    tracing::info!(
        "[SUMMARY] compute units: {}/{} ({:.1}%){}",
        budget.total_cu,
        budget.monthly_budget_cu,
        100.0 * budget.used_fraction(),
        if budget.stopped { " — budget stop" } else { "" }
    );
    for (method, calls) in &budget.calls_by_method {
        tracing::info!("[SUMMARY]   {} x{}", method, calls);
    }

    Ok(())
}
