//! Trust score composition.
//!
//! Every shaper maps a raw signal to [0, 100]; the composed score is the
//! weighted sum, rounded, plus a +5 registration bonus, clamped to [0, 100].
//! Shapers run in f64 and are rounded to integers before persistence; nothing
//! fractional lands in the store.

use crate::scoring::signals::{SignalBundle, SignalMaps};
use crate::store::EventStore;
use crate::utils::now_secs;
use serde::{Deserialize, Serialize};

pub const WEIGHT_LOYALTY: f64 = 0.30;
pub const WEIGHT_ACTIVITY: f64 = 0.18;
pub const WEIGHT_DIVERSITY: f64 = 0.16;
pub const WEIGHT_FEEDBACK: f64 = 0.15;
pub const WEIGHT_VOLUME: f64 = 0.10;
pub const WEIGHT_RECENCY: f64 = 0.06;
pub const WEIGHT_AGE: f64 = 0.05;

pub const REGISTRATION_BONUS: i64 = 5;

const SECONDS_PER_DAY: f64 = 86_400.0;
const SCORING_LOCK: &str = "scoring";
const SCORING_LOCK_STALE_SECS: i64 = 1_800;

fn clamp_unit(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// Log curve rewarding early activity; saturates around 100 transactions.
pub fn activity_score(tx_count: u64) -> f64 {
    if tx_count == 0 {
        return 0.0;
    }
    clamp_unit(100.0 * ((tx_count as f64) + 1.0).log10() / 101f64.log10())
}

/// Caps at 30 distinct counterparties.
pub fn diversity_score(counterparties: u64) -> f64 {
    if counterparties == 0 {
        return 0.0;
    }
    clamp_unit(100.0 * ((counterparties as f64) + 1.0).log10() / 31f64.log10())
}

/// Repeat-business ratio with a hard cap on hyper-concentrated patterns:
/// many transactions against fewer than three counterparties score at most
/// 40, whatever the ratio says.
pub fn loyalty_score(tx_count: u64, counterparties: u64) -> f64 {
    if tx_count <= 1 || counterparties == 0 {
        return 0.0;
    }
    let ratio = tx_count as f64 / counterparties as f64;
    let base = clamp_unit(100.0 * (ratio - 1.0) / 4.0);
    if ratio > 20.0 && counterparties < 3 {
        base.min(40.0)
    } else {
        base
    }
}

/// Confidence-weighted toward the neutral 50 until ten reviews exist, so a
/// single review can't saturate the signal.
pub fn feedback_score(avg_feedback: Option<f64>, feedback_count: u64) -> f64 {
    let Some(avg) = avg_feedback else {
        return 50.0;
    };
    if feedback_count == 0 {
        return 50.0;
    }
    let raw = clamp_unit(avg / 5.0 * 100.0);
    let confidence = (feedback_count as f64 / 10.0).min(1.0);
    confidence * raw + (1.0 - confidence) * 50.0
}

/// Average deal size on a log curve; neutral when there is nothing to
/// measure.
pub fn volume_score(total_volume_usdc: f64, volume_counterparties: u64) -> f64 {
    if total_volume_usdc <= 0.0 || volume_counterparties == 0 {
        return 50.0;
    }
    let deal_size = total_volume_usdc / volume_counterparties as f64;
    clamp_unit(100.0 * (deal_size + 1.0).log10() / 10_001f64.log10())
}

pub fn age_score(days_since_first_seen: f64) -> f64 {
    if !days_since_first_seen.is_finite() || days_since_first_seen < 0.0 {
        return 0.0;
    }
    clamp_unit(100.0 * (days_since_first_seen + 1.0).log10() / 181f64.log10())
}

/// 100 inside a week, 0 past ninety days, linear across the window between.
pub fn recency_score(days_since_last_seen: f64) -> f64 {
    if !days_since_last_seen.is_finite() {
        return 0.0;
    }
    if days_since_last_seen < 0.0 || days_since_last_seen <= 7.0 {
        return 100.0;
    }
    if days_since_last_seen >= 90.0 {
        return 0.0;
    }
    100.0 * (90.0 - days_since_last_seen) / 83.0
}

#[derive(Debug, Clone, Copy)]
pub struct ShapedSignals {
    pub loyalty: f64,
    pub activity: f64,
    pub diversity: f64,
    pub feedback: f64,
    pub volume: f64,
    pub age: f64,
    pub recency: f64,
}

/// Persisted per-signal breakdown; integer-rounded shaper outputs plus the
/// bonus actually granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub loyalty: i64,
    pub activity: i64,
    pub diversity: i64,
    pub feedback: i64,
    pub volume: i64,
    pub age: i64,
    pub recency: i64,
    pub registered_bonus: i64,
}

pub fn shape_signals(bundle: &SignalBundle, now: i64) -> ShapedSignals {
    let age_days = (now - bundle.first_seen_at) as f64 / SECONDS_PER_DAY;
    let recency_days = (now - bundle.last_seen_at) as f64 / SECONDS_PER_DAY;
    ShapedSignals {
        loyalty: loyalty_score(bundle.tx_count, bundle.unique_counterparties),
        activity: activity_score(bundle.tx_count),
        diversity: diversity_score(bundle.unique_counterparties),
        feedback: feedback_score(bundle.avg_feedback, bundle.feedback_count),
        volume: volume_score(bundle.total_volume_usdc, bundle.volume_counterparties),
        age: age_score(age_days),
        recency: recency_score(recency_days),
    }
}

pub fn compose_score(signals: &ShapedSignals, is_registered: bool) -> (i64, ScoreBreakdown) {
    let weighted = WEIGHT_LOYALTY * signals.loyalty
        + WEIGHT_ACTIVITY * signals.activity
        + WEIGHT_DIVERSITY * signals.diversity
        + WEIGHT_FEEDBACK * signals.feedback
        + WEIGHT_VOLUME * signals.volume
        + WEIGHT_RECENCY * signals.recency
        + WEIGHT_AGE * signals.age;
    let bonus = if is_registered { REGISTRATION_BONUS } else { 0 };
    let score = (weighted.round() as i64 + bonus).clamp(0, 100);
    let breakdown = ScoreBreakdown {
        loyalty: signals.loyalty.round() as i64,
        activity: signals.activity.round() as i64,
        diversity: signals.diversity.round() as i64,
        feedback: signals.feedback.round() as i64,
        volume: signals.volume.round() as i64,
        age: signals.age.round() as i64,
        recency: signals.recency.round() as i64,
        registered_bonus: bonus,
    };
    (score, breakdown)
}

/// Human tier label for a score band. Derived for reporting, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    High,
    Medium,
    Low,
    Minimal,
}

impl Tier {
    pub fn from_score(score: i64) -> Self {
        if score >= 80 {
            Self::High
        } else if score >= 50 {
            Self::Medium
        } else if score >= 20 {
            Self::Low
        } else {
            Self::Minimal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Minimal => "MINIMAL",
        }
    }
}

#[derive(Debug, Default)]
pub struct ScoringOutcome {
    pub scored: u64,
    pub skipped: u64,
    pub tier_high: u64,
    pub tier_medium: u64,
    pub tier_low: u64,
    pub tier_minimal: u64,
    /// Highest-scored wallets of this pass, descending.
    pub top: Vec<(String, i64)>,
    /// Lowest-scored wallets of this pass, ascending.
    pub bottom: Vec<(String, i64)>,
}

impl ScoringOutcome {
    fn tally(&mut self, tier: Tier) {
        match tier {
            Tier::High => self.tier_high += 1,
            Tier::Medium => self.tier_medium += 1,
            Tier::Low => self.tier_low += 1,
            Tier::Minimal => self.tier_minimal += 1,
        }
    }
}

/// One scoring pass. Incremental by default (`needs_rescore` wallets only);
/// `full` rescoring walks every wallet. Exclusive: two passes cannot overlap.
pub fn run_scoring_pass(store: &EventStore, full: bool) -> anyhow::Result<ScoringOutcome> {
    store.try_acquire_run_lock(SCORING_LOCK, SCORING_LOCK_STALE_SECS)?;
    let result = scoring_pass_locked(store, full);
    if let Err(err) = store.release_run_lock(SCORING_LOCK) {
        tracing::warn!("[SCORE] Failed to release run lock: {err}");
    }
    result
}

fn scoring_pass_locked(store: &EventStore, full: bool) -> anyhow::Result<ScoringOutcome> {
    let maps = SignalMaps::load(store)?;
    let candidates = store.scoring_candidates(full)?;
    tracing::info!(
        "[SCORE] Scoring {} wallet(s) ({})",
        candidates.len(),
        if full { "full" } else { "incremental" }
    );

    let now = now_secs();
    let mut outcome = ScoringOutcome::default();
    let mut scores: Vec<(String, i64)> = Vec::with_capacity(candidates.len());

    for candidate in &candidates {
        let bundle = maps.bundle_for(candidate);
        let signals = shape_signals(&bundle, now);
        let (score, breakdown) = compose_score(&signals, bundle.is_registered);
        let breakdown_json = match serde_json::to_string(&breakdown) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(
                    "[SCORE] Skipping {}: breakdown serialization failed: {err}",
                    candidate.address
                );
                outcome.skipped += 1;
                continue;
            }
        };
        let role = maps.role_for(&candidate.address).map(|r| r.as_str());
        if let Err(err) = store.record_score(&candidate.address, score, &breakdown_json, role, now)
        {
            tracing::warn!("[SCORE] Skipping {}: {err}", candidate.address);
            outcome.skipped += 1;
            continue;
        }
        outcome.scored += 1;
        outcome.tally(Tier::from_score(score));
        scores.push((candidate.address.clone(), score));
    }

    scores.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    outcome.top = scores.iter().take(10).cloned().collect();
    outcome.bottom = {
        let mut tail: Vec<_> = scores.iter().rev().take(5).cloned().collect();
        tail.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        tail
    };
    Ok(outcome)
}
