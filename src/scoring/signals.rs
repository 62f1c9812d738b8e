//! Per-wallet signal derivation.
//!
//! One pass over the event store loads four maps with set-oriented queries;
//! bundle assembly afterwards is pure in-memory lookups. No per-wallet
//! queries are issued anywhere in the scoring path.

use crate::store::{EventStore, FeedbackStats, RoleStats, ScoringCandidate, VolumeStats};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Buyer,
    Seller,
    Both,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buyer => "buyer",
            Self::Seller => "seller",
            Self::Both => "both",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalBundle {
    pub address: String,
    pub tx_count: u64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub unique_counterparties: u64,
    pub avg_feedback: Option<f64>,
    pub feedback_count: u64,
    pub total_volume_usdc: f64,
    pub volume_counterparties: u64,
    pub is_registered: bool,
}

pub struct SignalMaps {
    counterparties: HashMap<String, u64>,
    feedback_by_agent: HashMap<i64, FeedbackStats>,
    volume: HashMap<String, VolumeStats>,
    roles: HashMap<String, RoleStats>,
}

impl SignalMaps {
    /// The four aggregation queries are read-only and independent; they run
    /// sequentially here since sqlite serializes them anyway.
    pub fn load(store: &EventStore) -> anyhow::Result<Self> {
        Ok(Self {
            counterparties: store.counterparty_stats()?,
            feedback_by_agent: store.feedback_stats()?,
            volume: store.volume_stats()?,
            roles: store.role_stats()?,
        })
    }

    pub fn bundle_for(&self, candidate: &ScoringCandidate) -> SignalBundle {
        let feedback = candidate
            .erc8004_id
            .and_then(|agent_id| self.feedback_by_agent.get(&agent_id));
        let volume = self.volume.get(&candidate.address);
        SignalBundle {
            address: candidate.address.clone(),
            tx_count: candidate.tx_count.max(0) as u64,
            first_seen_at: candidate.first_seen_at,
            last_seen_at: candidate.last_seen_at,
            unique_counterparties: self
                .counterparties
                .get(&candidate.address)
                .copied()
                .unwrap_or(0),
            avg_feedback: feedback.and_then(|stats| stats.mean()),
            feedback_count: feedback.map(|stats| stats.count).unwrap_or(0),
            total_volume_usdc: volume
                .map(|stats| stats.total_micro as f64 / 1_000_000.0)
                .unwrap_or(0.0),
            volume_counterparties: volume.map(|stats| stats.counterparties).unwrap_or(0),
            is_registered: candidate.erc8004_id.is_some(),
        }
    }

    pub fn role_for(&self, address: &str) -> Option<Role> {
        let stats = self.roles.get(address)?;
        match (stats.payer_count > 0, stats.recipient_count > 0) {
            (true, true) => Some(Role::Both),
            (true, false) => Some(Role::Buyer),
            (false, true) => Some(Role::Seller),
            (false, false) => None,
        }
    }
}
