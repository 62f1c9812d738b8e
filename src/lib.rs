//! Trust-scoring pipeline for on-chain AI-agent wallets.
//!
//! Three batch processes share this library: the resumable multi-chain event
//! indexer (`src/main.rs`), the signal-aggregation and scoring pass
//! (`src/bin/score.rs`), and the score-change webhook dispatcher
//! (`src/bin/dispatch.rs`). They communicate only through the sqlite event
//! store.

pub mod budget;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod indexer;
pub mod scoring;
pub mod store;
pub mod utils;

pub mod config {
    pub mod chains;
}
