//! Payment scanner.
//!
//! `AuthorizationUsed` on the chain's USDC contract marks an EIP-3009
//! settlement. For every distinct transaction hash in a batch the scanner
//! fetches the receipt and the transaction envelope once, extracts each USDC
//! `Transfer` from the receipt, and records it with the gas payer as
//! facilitator. A transfer is paired with the authorization whose authorizer
//! matches its payer; with exactly one authorization present that one is
//! used, and the payer stands in otherwise.

use crate::config::chains::ChainConfig;
use crate::events;
use crate::gateway::ChainGateway;
use crate::indexer::{BatchStats, EventScanner};
use crate::store::{EventStore, TransactionRow};
use crate::utils::now_secs;
use alloy::consensus::TxReceipt;
use alloy::network::TransactionResponse;
use alloy::primitives::{Address, B256};
use alloy::rpc::types::{Filter, Log};
use std::collections::HashSet;

pub struct PaymentScanner {
    pub chain: ChainConfig,
}

impl PaymentScanner {
    pub fn new(chain: ChainConfig) -> Self {
        Self { chain }
    }

    fn usdc_transfers(&self, receipt_logs: &[Log]) -> Vec<events::UsdcTransfer> {
        receipt_logs
            .iter()
            .filter(|log| {
                log.address() == self.chain.usdc
                    && log.topic0().copied() == Some(events::transfer_topic())
            })
            .filter_map(|log| match events::decode_usdc_transfer(log) {
                Ok(transfer) => Some(transfer),
                Err(err) => {
                    tracing::warn!("[SCAN] {} skipping transfer: {}", self.scanner_id(), err);
                    None
                }
            })
            .collect()
    }

    fn authorizers(&self, receipt_logs: &[Log]) -> Vec<Address> {
        receipt_logs
            .iter()
            .filter(|log| {
                log.address() == self.chain.usdc
                    && log.topic0().copied() == Some(events::authorization_used_topic())
            })
            .filter_map(|log| events::decode_authorization_used(log).ok())
            .collect()
    }
}

fn pair_authorizer(authorizers: &[Address], payer: Address) -> Address {
    authorizers
        .iter()
        .find(|candidate| **candidate == payer)
        .copied()
        .or_else(|| {
            if authorizers.len() == 1 {
                Some(authorizers[0])
            } else {
                None
            }
        })
        .unwrap_or(payer)
}

impl EventScanner for PaymentScanner {
    fn scanner_id(&self) -> String {
        format!("x402_{}", self.chain.chain.slug())
    }

    fn genesis_block(&self) -> u64 {
        self.chain.payments_genesis_block
    }

    fn filter(&self, from: u64, to: u64) -> Filter {
        Filter::new()
            .address(self.chain.usdc)
            .event_signature(events::authorization_used_topic())
            .from_block(from)
            .to_block(to)
    }

    async fn process(
        &self,
        gateway: &ChainGateway,
        store: &EventStore,
        logs: Vec<Log>,
    ) -> anyhow::Result<BatchStats> {
        let mut stats = BatchStats::default();
        stats.events_found = logs.len() as u64;

        // One hydration round per distinct settlement transaction.
        let mut seen = HashSet::new();
        let mut pending: Vec<(B256, Option<u64>)> = Vec::new();
        for log in &logs {
            let Some(tx_hash) = log.transaction_hash else {
                stats.rows_skipped += 1;
                continue;
            };
            if seen.insert(tx_hash) {
                pending.push((tx_hash, log.block_timestamp));
            }
        }

        for (tx_hash, log_timestamp) in pending {
            let receipt = match gateway.receipt(tx_hash).await? {
                Some(receipt) => receipt,
                None => {
                    stats.rows_skipped += 1;
                    tracing::warn!(
                        "[SCAN] {} receipt for {:#x} not available; skipping",
                        self.scanner_id(),
                        tx_hash
                    );
                    continue;
                }
            };
            let envelope = match gateway.transaction(tx_hash).await? {
                Some(tx) => tx,
                None => {
                    stats.rows_skipped += 1;
                    tracing::warn!(
                        "[SCAN] {} transaction {:#x} not available; skipping",
                        self.scanner_id(),
                        tx_hash
                    );
                    continue;
                }
            };

            let facilitator = envelope.from();
            let is_x402 = self.chain.is_facilitator(facilitator);
            let block_number = receipt.block_number.unwrap_or(0);
            let block_timestamp = log_timestamp.map(|ts| ts as i64).unwrap_or_else(now_secs);

            let receipt_logs = receipt.inner.logs();
            let transfers = self.usdc_transfers(receipt_logs);
            let authorizers = self.authorizers(receipt_logs);

            for transfer in transfers {
                let payer = format!("{:#x}", transfer.payer);
                let recipient = format!("{:#x}", transfer.recipient);
                let row = TransactionRow {
                    tx_hash: format!("{:#x}", tx_hash),
                    chain: self.chain.chain,
                    block_number,
                    authorizer: Some(format!(
                        "{:#x}",
                        pair_authorizer(&authorizers, transfer.payer)
                    )),
                    payer: Some(payer.clone()),
                    recipient: Some(recipient.clone()),
                    amount_raw: transfer.amount_raw.to_string(),
                    amount_micro: events::usdc_amount_micro(transfer.amount_raw),
                    facilitator: format!("{:#x}", facilitator),
                    is_x402,
                    block_timestamp,
                };

                match store.insert_transaction(&row) {
                    Ok(true) => {
                        stats.rows_inserted += 1;
                        for party in [payer.as_str(), recipient.as_str()] {
                            match store.upsert_payment_wallet(party, self.chain.chain, block_timestamp)
                            {
                                Ok(()) => stats.wallets_touched += 1,
                                Err(err) => tracing::warn!(
                                    "[SCAN] {} failed to upsert wallet {}: {}",
                                    self.scanner_id(),
                                    party,
                                    err
                                ),
                            }
                        }
                    }
                    Ok(false) => stats.rows_skipped += 1,
                    Err(err) => {
                        stats.rows_skipped += 1;
                        tracing::warn!(
                            "[SCAN] {} failed to insert transaction {:#x}: {}",
                            self.scanner_id(),
                            tx_hash,
                            err
                        );
                    }
                }
            }
        }
        Ok(stats)
    }
}
