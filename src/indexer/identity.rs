//! Identity registry scanner.
//!
//! Watches ERC-721 `Transfer` logs from the zero address on the identity
//! registry: each mint assigns an agent id to a wallet. Multiple mints to the
//! same wallet within one batch dedupe by address before the upsert, keeping
//! the earliest token id.

use crate::config::chains::ChainConfig;
use crate::events::{self, IdentityMint};
use crate::gateway::ChainGateway;
use crate::indexer::{BatchStats, EventScanner};
use crate::store::EventStore;
use crate::utils::now_secs;
use alloy::primitives::B256;
use alloy::rpc::types::{Filter, Log};

pub struct IdentityScanner {
    pub chain: ChainConfig,
}

impl IdentityScanner {
    pub fn new(chain: ChainConfig) -> Self {
        Self { chain }
    }
}

fn dedupe_by_owner(mints: Vec<IdentityMint>) -> Vec<IdentityMint> {
    let mut seen = std::collections::HashSet::new();
    mints
        .into_iter()
        .filter(|mint| seen.insert(mint.owner))
        .collect()
}

impl EventScanner for IdentityScanner {
    fn scanner_id(&self) -> String {
        format!("erc8004_identity_{}", self.chain.chain.slug())
    }

    fn genesis_block(&self) -> u64 {
        self.chain.identity_deploy_block
    }

    fn filter(&self, from: u64, to: u64) -> Filter {
        Filter::new()
            .address(self.chain.identity_registry)
            .event_signature(events::transfer_topic())
            .topic1(B256::ZERO)
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
        let mut mints = Vec::new();
        for log in &logs {
            match events::decode_identity_mint(log) {
                Ok(Some(mint)) => {
                    stats.events_found += 1;
                    mints.push(mint);
                }
                Ok(None) => {}
                Err(err) => {
                    stats.rows_skipped += 1;
                    tracing::warn!("[SCAN] {} skipping log: {}", self.scanner_id(), err);
                }
            }
        }

        for mint in dedupe_by_owner(mints) {
            let seen_at = mint
                .block_timestamp
                .map(|ts| ts as i64)
                .unwrap_or_else(now_secs);
            match store.upsert_identity_wallet(&mint, self.chain.chain, seen_at) {
                Ok(()) => {
                    stats.rows_inserted += 1;
                    stats.wallets_touched += 1;
                }
                Err(err) => {
                    stats.rows_skipped += 1;
                    tracing::warn!(
                        "[SCAN] {} failed to upsert wallet {:#x}: {}",
                        self.scanner_id(),
                        mint.owner,
                        err
                    );
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    fn mint(owner: u8, agent_id: u64) -> IdentityMint {
        IdentityMint {
            owner: Address::from([owner; 20]),
            agent_id,
            block_number: 1,
            block_timestamp: None,
        }
    }

    #[test]
    fn test_dedupe_keeps_first_mint_per_owner() {
        let deduped = dedupe_by_owner(vec![mint(0x01, 5), mint(0x02, 6), mint(0x01, 9)]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].agent_id, 5);
        assert_eq!(deduped[1].agent_id, 6);
    }

    #[test]
    fn test_scanner_id_uses_chain_slug() {
        let scanner = IdentityScanner::new(ChainConfig::base());
        assert_eq!(scanner.scanner_id(), "erc8004_identity_base");
        let scanner = IdentityScanner::new(ChainConfig::arbitrum());
        assert_eq!(scanner.scanner_id(), "erc8004_identity_arb");
    }
}
