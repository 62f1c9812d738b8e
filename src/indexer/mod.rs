//! Resumable multi-chain event indexing.
//!
//! One scanner per (chain, event source). All scanners share the batch loop
//! here: read the cursor, walk the range in provider-sized batches, decode
//! and persist idempotently, advance the cursor, pace. Interrupting a run at
//! any point is safe; the next run resumes at `last_block + 1` and replays at
//! most one batch, which the unique keys absorb.

pub mod feedback;
pub mod identity;
pub mod payments;

use crate::budget::BudgetGovernor;
use crate::error::ConfigError;
use crate::gateway::ChainGateway;
use crate::store::EventStore;
use alloy::rpc::types::{Filter, Log};

/// Hard per-call log window imposed by the free-tier provider.
pub const MAX_LOG_WINDOW_BLOCKS: u64 = 10;

/// The batch size is env-tunable downward only; exceeding the provider
/// ceiling is a configuration error, not something to discover mid-scan.
pub fn batch_blocks() -> Result<u64, ConfigError> {
    let raw = crate::utils::parse_u64_env("GETLOGS_BATCH_BLOCKS", MAX_LOG_WINDOW_BLOCKS);
    if raw == 0 || raw > MAX_LOG_WINDOW_BLOCKS {
        return Err(ConfigError::Invalid(format!(
            "GETLOGS_BATCH_BLOCKS must be in 1..={}, got {}",
            MAX_LOG_WINDOW_BLOCKS, raw
        )));
    }
    Ok(raw)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchStats {
    pub events_found: u64,
    pub rows_inserted: u64,
    pub rows_skipped: u64,
    pub wallets_touched: u64,
}

impl BatchStats {
    pub fn absorb(&mut self, other: BatchStats) {
        self.events_found += other.events_found;
        self.rows_inserted += other.rows_inserted;
        self.rows_skipped += other.rows_skipped;
        self.wallets_touched += other.wallets_touched;
    }
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub scanner_id: String,
    pub from_block: u64,
    pub committed_block: Option<u64>,
    pub batches: u64,
    pub stats: BatchStats,
    pub stopped_by_budget: bool,
    pub up_to_date: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Default window (in days) when no cursor exists yet.
    pub window_days: Option<u64>,
    /// Cap on blocks scanned this run.
    pub block_limit: Option<u64>,
}

/// Resolve the scan range for one run. `None` means the scanner is already
/// up to date. The start is always `cursor + 1` when a cursor exists; the
/// `--days` window applies only to a scanner's first run.
pub fn plan_range(
    cursor: Option<u64>,
    genesis: u64,
    head: u64,
    window_blocks: Option<u64>,
    block_limit: Option<u64>,
) -> Option<(u64, u64)> {
    let from = match cursor {
        Some(last_block) => last_block + 1,
        None => match window_blocks {
            Some(window) => head.saturating_sub(window).max(genesis),
            None => genesis,
        },
    };
    if from > head {
        return None;
    }
    let mut to = head;
    if let Some(limit) = block_limit {
        if limit > 0 {
            to = to.min(from.saturating_add(limit - 1));
        }
    }
    Some((from, to))
}

pub trait EventScanner {
    fn scanner_id(&self) -> String;
    fn genesis_block(&self) -> u64;
    fn filter(&self, from: u64, to: u64) -> Filter;
    fn process(
        &self,
        gateway: &ChainGateway,
        store: &EventStore,
        logs: Vec<Log>,
    ) -> impl std::future::Future<Output = anyhow::Result<BatchStats>>;
}

pub async fn run_scanner<S: EventScanner>(
    scanner: &S,
    gateway: &ChainGateway,
    store: &EventStore,
    governor: &BudgetGovernor,
    options: &ScanOptions,
) -> anyhow::Result<ScanOutcome> {
    let scanner_id = scanner.scanner_id();
    let batch = batch_blocks()?;
    let head = gateway.head().await?;
    let cursor = store.cursor(&scanner_id)?;

    let window_blocks = options
        .window_days
        .map(|days| gateway.chain.blocks_for_days(days));
    let range = plan_range(
        cursor,
        scanner.genesis_block(),
        head,
        window_blocks,
        options.block_limit,
    );

    let mut outcome = ScanOutcome {
        scanner_id: scanner_id.clone(),
        from_block: cursor.map(|c| c + 1).unwrap_or(0),
        committed_block: cursor,
        batches: 0,
        stats: BatchStats::default(),
        stopped_by_budget: false,
        up_to_date: false,
    };

    let Some((from, to)) = range else {
        tracing::info!(
            "[SCAN] {} up-to-date (cursor at {:?}, head at {})",
            scanner_id,
            cursor,
            head
        );
        outcome.up_to_date = true;
        return Ok(outcome);
    };
    outcome.from_block = from;
    tracing::info!(
        "[SCAN] {} scanning [{}..={}] ({} block(s), batch={})",
        scanner_id,
        from,
        to,
        to - from + 1,
        batch
    );

    let mut cur = from;
    while cur <= to {
        if governor.should_stop() {
            tracing::warn!(
                "[SCAN] {} stopping at block {}: compute-unit budget exhausted",
                scanner_id,
                cur.saturating_sub(1)
            );
            outcome.stopped_by_budget = true;
            break;
        }

        let batch_end = (cur + batch - 1).min(to);
        let logs = gateway.logs(&scanner.filter(cur, batch_end)).await?;
        let stats = scanner.process(gateway, store, logs).await?;
        store.commit_cursor(&scanner_id, batch_end)?;

        outcome.stats.absorb(stats);
        outcome.batches += 1;
        outcome.committed_block = Some(batch_end);

        cur = batch_end + 1;
        if cur <= to {
            gateway.pace().await;
        }
    }

    tracing::info!(
        "[SCAN] {} done: {} batch(es), {} event(s), {} inserted, {} skipped, cursor at {:?}",
        scanner_id,
        outcome.batches,
        outcome.stats.events_found,
        outcome.stats.rows_inserted,
        outcome.stats.rows_skipped,
        outcome.committed_block
    );
    Ok(outcome)
}
