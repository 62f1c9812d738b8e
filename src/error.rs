use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrustError>;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{method} timed out after {waited_ms}ms")]
    Timeout { method: String, waited_ms: u64 },
    #[error("{method} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        method: String,
        attempts: usize,
        last: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite failure: {0}")]
    Sqlite(String),
    #[error("cursor commit failed for `{scanner_id}` at block {block}: {reason}")]
    CursorCommit {
        scanner_id: String,
        block: u64,
        reason: String,
    },
    #[error("scoring run lock is held (acquired {held_for_secs}s ago)")]
    RunLockHeld { held_for_secs: u64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
