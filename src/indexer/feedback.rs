//! Reputation registry scanner.
//!
//! Decodes `NewFeedback` events, including the variable-width tags and URI,
//! and inserts them idempotently on `(tx_hash, feedback_index)`. No wallet is
//! mutated here; feedback joins to wallets by agent id at aggregation time.

use crate::config::chains::ChainConfig;
use crate::events;
use crate::gateway::ChainGateway;
use crate::indexer::{BatchStats, EventScanner};
use crate::store::EventStore;
use alloy::rpc::types::{Filter, Log};

pub const FEEDBACK_SOURCE_CHAIN: &str = "chain";

pub struct FeedbackScanner {
    pub chain: ChainConfig,
}

impl FeedbackScanner {
    pub fn new(chain: ChainConfig) -> Self {
        Self { chain }
    }
}

impl EventScanner for FeedbackScanner {
    fn scanner_id(&self) -> String {
        format!("erc8004_feedback_{}", self.chain.chain.slug())
    }

    fn genesis_block(&self) -> u64 {
        self.chain.reputation_deploy_block
    }

    fn filter(&self, from: u64, to: u64) -> Filter {
        Filter::new()
            .address(self.chain.reputation_registry)
            .event_signature(events::new_feedback_topic())
            .from_block(from)
            .to_block(to)
    }

    async fn process(
        &self,
        _gateway: &ChainGateway,
        store: &EventStore,
        logs: Vec<Log>,
    ) -> anyhow::Result<BatchStats> {
        let mut stats = BatchStats::default();
        for log in &logs {
            let record = match events::decode_feedback(log) {
                Ok(record) => record,
                Err(err) => {
                    stats.rows_skipped += 1;
                    tracing::warn!("[SCAN] {} skipping log: {}", self.scanner_id(), err);
                    continue;
                }
            };
            stats.events_found += 1;
            match store.insert_feedback(&record, FEEDBACK_SOURCE_CHAIN) {
                Ok(true) => stats.rows_inserted += 1,
                Ok(false) => stats.rows_skipped += 1,
                Err(err) => {
                    stats.rows_skipped += 1;
                    tracing::warn!(
                        "[SCAN] {} failed to insert feedback {:#x}/{}: {}",
                        self.scanner_id(),
                        record.tx_hash,
                        record.feedback_index,
                        err
                    );
                }
            }
        }
        Ok(stats)
    }
}
