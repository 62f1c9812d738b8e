//! Score-change notification pipeline.
//!
//! Runs after a completed scoring pass. The dispatcher walks `score_history`
//! forward from its own persisted position, compares each new snapshot to the
//! wallet's previous one, matches the delta against registered webhooks, and
//! POSTs matched payloads with bounded retry. Delivery is at-least-once:
//! receivers dedupe on (address, timestamp).

use crate::scoring::engine::Tier;
use crate::store::{EventStore, WebhookRow};
use crate::utils::{compact_error_message, parse_u64_env};
use serde::Serialize;
use tokio::time::{sleep, Duration};

pub const EVENT_SCORE_CHANGE: &str = "score_change";
pub const EVENT_SCORE_DROP: &str = "score_drop";
pub const EVENT_SCORE_RISE: &str = "score_rise";

const DELIVERY_ATTEMPTS: usize = 3;
const DELIVERY_BASE_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u64 = 5;
const DELIVERY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct DeltaEvent {
    pub address: String,
    pub old_score: Option<i64>,
    pub new_score: i64,
    pub computed_at: i64,
}

#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub event: &'a str,
    pub address: &'a str,
    pub old_score: Option<i64>,
    pub new_score: i64,
    pub tier: &'a str,
    pub threshold: Option<i64>,
    pub timestamp: i64,
}

/// Webhook matching. The wallet filter and the event kind must both agree;
/// a configured threshold additionally requires the old and new score to sit
/// on opposite sides of it in the event's direction.
pub fn webhook_matches(hook: &WebhookRow, event: &DeltaEvent) -> bool {
    if let Some(filter) = &hook.wallet_address {
        if !filter.eq_ignore_ascii_case(&event.address) {
            return false;
        }
    }

    let delta = event.old_score.map(|old| event.new_score - old);
    match hook.event_type.as_str() {
        EVENT_SCORE_DROP => {
            if !matches!(delta, Some(d) if d < 0) {
                return false;
            }
        }
        EVENT_SCORE_RISE => {
            if !matches!(delta, Some(d) if d > 0) {
                return false;
            }
        }
        EVENT_SCORE_CHANGE => {
            // A first-ever score is a change; an unchanged re-score is not.
            if matches!(delta, Some(0)) {
                return false;
            }
        }
        _ => return false,
    }

    if let Some(threshold) = hook.threshold {
        let Some(old) = event.old_score else {
            return false;
        };
        let new = event.new_score;
        let crossed_down = old >= threshold && new < threshold;
        let crossed_up = old <= threshold && new > threshold;
        let crossed = match hook.event_type.as_str() {
            EVENT_SCORE_DROP => crossed_down,
            EVENT_SCORE_RISE => crossed_up,
            _ => crossed_down || crossed_up,
        };
        if !crossed {
            return false;
        }
    }

    true
}

#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub snapshots_processed: u64,
    pub matched: u64,
    pub delivered: u64,
    pub failed: u64,
    pub webhooks_disabled: u64,
}

pub struct Dispatcher {
    store: EventStore,
    client: reqwest::Client,
    max_consecutive_failures: i64,
}

impl Dispatcher {
    pub fn new(store: EventStore) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(DELIVERY_TIMEOUT_MS))
            .build()?;
        let max_consecutive_failures = parse_u64_env(
            "WEBHOOK_MAX_CONSECUTIVE_FAILURES",
            DEFAULT_MAX_CONSECUTIVE_FAILURES,
        )
        .max(1) as i64;
        Ok(Self {
            store,
            client,
            max_consecutive_failures,
        })
    }

    pub async fn run(&self) -> anyhow::Result<DispatchOutcome> {
        let mut outcome = DispatchOutcome::default();
        let cursor = self.store.dispatch_cursor()?;
        let snapshots = self.store.snapshots_after(cursor)?;
        if snapshots.is_empty() {
            tracing::info!("[HOOK] No new score snapshots past id {}", cursor);
            return Ok(outcome);
        }
        let webhooks = self.store.active_webhooks()?;
        tracing::info!(
            "[HOOK] {} snapshot(s) past id {}, {} active webhook(s)",
            snapshots.len(),
            cursor,
            webhooks.len()
        );

        for snapshot in snapshots {
            let event = DeltaEvent {
                address: snapshot.address.clone(),
                old_score: self.store.previous_score(&snapshot.address, snapshot.id)?,
                new_score: snapshot.score,
                computed_at: snapshot.computed_at,
            };

            for hook in &webhooks {
                if !webhook_matches(hook, &event) {
                    continue;
                }
                outcome.matched += 1;
                match self.deliver(hook, &event).await {
                    Ok(()) => {
                        outcome.delivered += 1;
                        self.store.record_webhook_success(hook.id)?;
                    }
                    Err(err) => {
                        outcome.failed += 1;
                        let status = compact_error_message(&err.to_string(), 160);
                        let disabled = self.store.record_webhook_failure(
                            hook.id,
                            &status,
                            self.max_consecutive_failures,
                        )?;
                        if disabled {
                            outcome.webhooks_disabled += 1;
                            tracing::warn!(
                                "[HOOK] Webhook {} disabled after {} consecutive failures",
                                hook.id,
                                self.max_consecutive_failures
                            );
                        }
                    }
                }
            }

            outcome.snapshots_processed += 1;
            self.store.commit_dispatch_cursor(snapshot.id)?;
        }

        Ok(outcome)
    }

    async fn deliver(&self, hook: &WebhookRow, event: &DeltaEvent) -> anyhow::Result<()> {
        let payload = WebhookPayload {
            event: &hook.event_type,
            address: &event.address,
            old_score: event.old_score,
            new_score: event.new_score,
            tier: Tier::from_score(event.new_score).as_str(),
            threshold: hook.threshold,
            timestamp: event.computed_at,
        };

        let mut last_message = String::new();
        for attempt in 1..=DELIVERY_ATTEMPTS {
            match self.client.post(&hook.url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_message = format!("http {}", response.status().as_u16());
                }
                Err(err) => {
                    last_message = compact_error_message(&err.to_string(), 160);
                }
            }
            if attempt < DELIVERY_ATTEMPTS {
                sleep(Duration::from_millis(
                    DELIVERY_BASE_BACKOFF_MS << (attempt - 1),
                ))
                .await;
            }
        }
        anyhow::bail!(
            "delivery to webhook {} failed after {} attempt(s): {}",
            hook.id,
            DELIVERY_ATTEMPTS,
            last_message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(event_type: &str, wallet: Option<&str>, threshold: Option<i64>) -> WebhookRow {
        WebhookRow {
            id: 1,
            api_key_id: 1,
            url: "https://example.com/hook".to_string(),
            wallet_address: wallet.map(|w| w.to_string()),
            event_type: event_type.to_string(),
            threshold,
            consecutive_failures: 0,
        }
    }

    fn event(old: Option<i64>, new: i64) -> DeltaEvent {
        DeltaEvent {
            address: "0xabc".to_string(),
            old_score: old,
            new_score: new,
            computed_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_drop_through_threshold_delivers_and_rise_does_not() {
        let drop = hook(EVENT_SCORE_DROP, None, Some(50));
        let rise = hook(EVENT_SCORE_RISE, None, None);
        let e = event(Some(85), 49);
        assert!(webhook_matches(&drop, &e));
        assert!(!webhook_matches(&rise, &e));
    }

    #[test]
    fn test_threshold_requires_directional_crossing() {
        let drop = hook(EVENT_SCORE_DROP, None, Some(50));
        // Falls but stays above the threshold.
        assert!(!webhook_matches(&drop, &event(Some(80), 60)));
        // Already below; no crossing.
        assert!(!webhook_matches(&drop, &event(Some(40), 30)));

        let rise = hook(EVENT_SCORE_RISE, None, Some(50));
        assert!(webhook_matches(&rise, &event(Some(45), 55)));
        assert!(!webhook_matches(&rise, &event(Some(55), 60)));
    }

    #[test]
    fn test_score_change_semantics() {
        let change = hook(EVENT_SCORE_CHANGE, None, None);
        assert!(webhook_matches(&change, &event(Some(50), 51)));
        assert!(webhook_matches(&change, &event(Some(51), 50)));
        assert!(!webhook_matches(&change, &event(Some(50), 50)));
        // First score counts as a change.
        assert!(webhook_matches(&change, &event(None, 70)));
    }

    #[test]
    fn test_first_score_never_matches_directional_hooks() {
        let drop = hook(EVENT_SCORE_DROP, None, None);
        let rise = hook(EVENT_SCORE_RISE, None, None);
        assert!(!webhook_matches(&drop, &event(None, 10)));
        assert!(!webhook_matches(&rise, &event(None, 90)));
        // With a threshold, a missing old score cannot evaluate the crossing.
        let change = hook(EVENT_SCORE_CHANGE, None, Some(50));
        assert!(!webhook_matches(&change, &event(None, 90)));
    }

    #[test]
    fn test_wallet_filter_must_match() {
        let scoped = hook(EVENT_SCORE_CHANGE, Some("0xabc"), None);
        assert!(webhook_matches(&scoped, &event(Some(10), 20)));
        let other = hook(EVENT_SCORE_CHANGE, Some("0xdef"), None);
        assert!(!webhook_matches(&other, &event(Some(10), 20)));
        // Case-insensitive address comparison.
        let upper = hook(EVENT_SCORE_CHANGE, Some("0xABC"), None);
        assert!(webhook_matches(&upper, &event(Some(10), 20)));
    }

    #[test]
    fn test_unknown_event_type_never_matches() {
        let bogus = hook("score_wiggle", None, None);
        assert!(!webhook_matches(&bogus, &event(Some(10), 20)));
    }
}
