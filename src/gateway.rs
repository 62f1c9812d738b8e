//! Thin typed adapter over one EVM chain's JSON-RPC endpoint.
//!
//! Every call is recorded with the budget governor before it goes on the
//! wire, so compute-unit accounting stays conservative even when the call
//! fails. Retryability is a classification of the failure, not an exception
//! path: transient transport errors retry with bounded backoff, everything
//! else fails fast.

use crate::budget::BudgetGovernor;
use crate::config::chains::ChainConfig;
use crate::error::{RpcError, TrustError};
use crate::utils::compact_error_message;
use alloy::primitives::B256;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log, Transaction, TransactionReceipt};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

pub type HttpProvider = RootProvider;

const RPC_ERR_MAX_LEN: usize = 260;
const RETRY_ATTEMPTS: usize = 3;
const RETRY_BASE_BACKOFF_MS: u64 = 1_000;
const DEFAULT_RPC_CALL_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Fatal,
}

/// Classify a transport-level failure. Rate limiting (429), gateway errors
/// (502/503), timeouts, resets, and DNS failures are transient; malformed
/// requests and decode failures are not.
pub fn classify_rpc_error(message: &str) -> RetryClass {
    let msg = message.to_ascii_lowercase();
    let retryable = [
        "429",
        "rate limit",
        "too many requests",
        "compute units per second",
        "502",
        "503",
        "bad gateway",
        "service unavailable",
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "connection closed",
        "broken pipe",
        "dns error",
        "temporarily unavailable",
    ];
    if retryable.iter().any(|needle| msg.contains(needle)) {
        return RetryClass::Retryable;
    }
    RetryClass::Fatal
}

fn retry_backoff_ms(attempt: usize) -> u64 {
    // 1s, 2s, 4s.
    RETRY_BASE_BACKOFF_MS << attempt.saturating_sub(1).min(8)
}

fn rpc_call_timeout_ms() -> u64 {
    std::env::var("RPC_CALL_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| (500..=60_000).contains(v))
        .unwrap_or(DEFAULT_RPC_CALL_TIMEOUT_MS)
}

pub struct ChainGateway {
    provider: HttpProvider,
    pub chain: ChainConfig,
    governor: Arc<BudgetGovernor>,
}

impl ChainGateway {
    pub fn connect(
        rpc_url: &str,
        chain: ChainConfig,
        governor: Arc<BudgetGovernor>,
    ) -> Result<Self, TrustError> {
        let parsed = rpc_url
            .parse::<reqwest::Url>()
            .map_err(|err| RpcError::InvalidUrl {
                url: rpc_url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(parsed),
            chain,
            governor,
        })
    }

    async fn call_with_retry<T, Op, Fut>(&self, method: &'static str, mut op: Op) -> anyhow::Result<T>
    where
        Op: FnMut(HttpProvider) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let timeout_ms = rpc_call_timeout_ms();
        let mut last_message = String::new();

        for attempt in 1..=RETRY_ATTEMPTS {
            // Accounted before the wire so a failed call still spends its CU.
            self.governor.record(method, 1);

            match timeout(Duration::from_millis(timeout_ms), op(self.provider.clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    let message = compact_error_message(&err.to_string(), RPC_ERR_MAX_LEN);
                    let class = classify_rpc_error(&message);
                    last_message = message.clone();
                    if class == RetryClass::Fatal || attempt == RETRY_ATTEMPTS {
                        return Err(RpcError::RetriesExhausted {
                            method: method.to_string(),
                            attempts: attempt,
                            last: message,
                        }
                        .into());
                    }
                    tracing::debug!(
                        "[RPC] {} attempt {}/{} on {} failed ({}); retrying",
                        method,
                        attempt,
                        RETRY_ATTEMPTS,
                        self.chain.name,
                        message
                    );
                }
                Err(_) => {
                    last_message = format!("timed out after {}ms", timeout_ms);
                    if attempt == RETRY_ATTEMPTS {
                        return Err(RpcError::Timeout {
                            method: method.to_string(),
                            waited_ms: timeout_ms,
                        }
                        .into());
                    }
                }
            }

            sleep(Duration::from_millis(retry_backoff_ms(attempt))).await;
        }

        Err(RpcError::RetriesExhausted {
            method: method.to_string(),
            attempts: RETRY_ATTEMPTS,
            last: last_message,
        }
        .into())
    }

    /// Current chain head.
    pub async fn head(&self) -> anyhow::Result<u64> {
        self.call_with_retry("eth_blockNumber", |p| async move {
            p.get_block_number().await.map_err(anyhow::Error::from)
        })
        .await
    }

    /// Typed log query. The caller is responsible for keeping the block
    /// window within the provider's hard range limit.
    pub async fn logs(&self, filter: &Filter) -> anyhow::Result<Vec<Log>> {
        let filter = filter.clone();
        self.call_with_retry("eth_getLogs", move |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await.map_err(anyhow::Error::from) }
        })
        .await
    }

    pub async fn receipt(&self, tx_hash: B256) -> anyhow::Result<Option<TransactionReceipt>> {
        self.call_with_retry("eth_getTransactionReceipt", move |p| async move {
            p.get_transaction_receipt(tx_hash)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    pub async fn transaction(&self, tx_hash: B256) -> anyhow::Result<Option<Transaction>> {
        self.call_with_retry("eth_getTransactionByHash", move |p| async move {
            p.get_transaction_by_hash(tx_hash)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
    }

    /// Sleep the chain's configured pacing interval between batches.
    pub async fn pace(&self) {
        sleep(Duration::from_millis(self.chain.pacing_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_transient_patterns_retry() {
        assert_eq!(
            classify_rpc_error("HTTP error 429 Too Many Requests"),
            RetryClass::Retryable
        );
        assert_eq!(classify_rpc_error("502 Bad Gateway"), RetryClass::Retryable);
        assert_eq!(
            classify_rpc_error("connection reset by peer"),
            RetryClass::Retryable
        );
        assert_eq!(
            classify_rpc_error("dns error: failed to lookup address"),
            RetryClass::Retryable
        );
        assert_eq!(
            classify_rpc_error("operation timed out"),
            RetryClass::Retryable
        );
    }

    #[test]
    fn test_classifier_fatal_patterns_fail_fast() {
        assert_eq!(
            classify_rpc_error("400 Bad Request: invalid filter"),
            RetryClass::Fatal
        );
        assert_eq!(
            classify_rpc_error("-32602 invalid params"),
            RetryClass::Fatal
        );
        assert_eq!(
            classify_rpc_error("DeserError: unknown variant `0x7e`"),
            RetryClass::Fatal
        );
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(retry_backoff_ms(1), 1_000);
        assert_eq!(retry_backoff_ms(2), 2_000);
        assert_eq!(retry_backoff_ms(3), 4_000);
    }
}
