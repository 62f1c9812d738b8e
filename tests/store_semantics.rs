//! End-to-end store semantics: idempotent re-indexing, source promotion,
//! the scoring pass over real aggregation queries, and snapshot deltas as
//! the dispatcher reads them.

use agent_trust::config::chains::Chain;
use agent_trust::dispatch::{webhook_matches, DeltaEvent, EVENT_SCORE_DROP};
use agent_trust::events::{FeedbackRecord, IdentityMint};
use agent_trust::scoring::engine::run_scoring_pass;
use agent_trust::store::{EventStore, TransactionRow};
use alloy::primitives::{Address, B256};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_db_path(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("{}_{}.db", prefix, nanos))
}

fn addr(byte: u8) -> String {
    format!("{:#x}", Address::from([byte; 20]))
}

fn tx(hash: u8, payer: u8, recipient: u8, micro: i64) -> TransactionRow {
    TransactionRow {
        tx_hash: format!("{:#x}", B256::from([hash; 32])),
        chain: Chain::Base,
        block_number: 1_000 + hash as u64,
        authorizer: Some(addr(payer)),
        payer: Some(addr(payer)),
        recipient: Some(addr(recipient)),
        amount_raw: micro.to_string(),
        amount_micro: micro,
        facilitator: addr(0xfa),
        is_x402: true,
        block_timestamp: 1_700_000_000,
    }
}

fn feedback(hash: u8, index: u64, agent_id: u64, value: i128, decimals: u8) -> FeedbackRecord {
    FeedbackRecord {
        tx_hash: B256::from([hash; 32]),
        feedback_index: index,
        agent_id,
        client_address: Address::from([0xc1; 20]),
        value,
        value_decimals: decimals,
        tag1: "quality".to_string(),
        tag2: String::new(),
        endpoint: "/v1/complete".to_string(),
        feedback_uri: "ipfs://qm".to_string(),
        feedback_hash: B256::from([0xfe; 32]),
        block_number: 2_000,
        block_timestamp: Some(1_700_000_000),
    }
}

/// Replaying an already-processed range is a no-op on every table.
#[test]
fn test_reindex_replay_produces_no_new_rows() {
    let path = temp_db_path("semantics_replay");
    let store = EventStore::open(&path).expect("open");

    let rows = [tx(0x01, 0xaa, 0xbb, 1_000_000), tx(0x02, 0xbb, 0xcc, 2_000_000)];
    let fb = feedback(0x01, 0, 7, 45, 1);

    for row in &rows {
        assert!(store.insert_transaction(row).expect("insert"));
    }
    assert!(store.insert_feedback(&fb, "chain").expect("insert"));
    let counts_before = store.counts().expect("counts");

    // Replay the whole batch.
    for row in &rows {
        assert!(!store.insert_transaction(row).expect("replay"));
    }
    assert!(!store.insert_feedback(&fb, "chain").expect("replay"));
    let counts_after = store.counts().expect("counts");

    assert_eq!(counts_before.transactions, counts_after.transactions);
    assert_eq!(counts_before.feedback, counts_after.feedback);

    let _ = fs::remove_file(path);
}

/// The `source` promotion converges on `both` regardless of which scanner
/// observes a wallet first, and never leaves `both`.
#[test]
fn test_source_promotion_is_one_way_and_order_independent() {
    let path = temp_db_path("semantics_promotion");
    let store = EventStore::open(&path).expect("open");

    let owner = Address::from([0x11; 20]);
    let wallet = format!("{:#x}", owner);
    let mint = IdentityMint {
        owner,
        agent_id: 3,
        block_number: 10,
        block_timestamp: Some(1_700_000_000),
    };

    store
        .upsert_payment_wallet(&wallet, Chain::Base, 1_000)
        .expect("payment first");
    assert_eq!(store.wallet(&wallet).expect("read").expect("row").source, "x402");

    store
        .upsert_identity_wallet(&mint, Chain::Base, 2_000)
        .expect("identity second");
    assert_eq!(store.wallet(&wallet).expect("read").expect("row").source, "both");

    // Further observations of either family keep it at `both`.
    store
        .upsert_payment_wallet(&wallet, Chain::Base, 3_000)
        .expect("payment again");
    store
        .upsert_identity_wallet(&mint, Chain::Base, 4_000)
        .expect("identity again");
    let row = store.wallet(&wallet).expect("read").expect("row");
    assert_eq!(row.source, "both");
    assert_eq!(row.erc8004_id, Some(3));
    assert_eq!(row.last_seen_at, 4_000);

    let _ = fs::remove_file(path);
}

/// A full scoring pass over a small settled graph: snapshots land, dirty
/// flags clear, incremental re-runs are empty, and the stored score stays
/// inside [0, 100].
#[test]
fn test_scoring_pass_over_aggregated_store() {
    let path = temp_db_path("semantics_scoring");
    let store = EventStore::open(&path).expect("open");

    // A pays B and C; B pays C. B carries an agent id with feedback.
    store.insert_transaction(&tx(0x01, 0xaa, 0xbb, 5_000_000)).expect("tx");
    store.insert_transaction(&tx(0x02, 0xaa, 0xcc, 3_000_000)).expect("tx");
    store.insert_transaction(&tx(0x03, 0xbb, 0xcc, 1_000_000)).expect("tx");
    for (party, seen) in [(0xaau8, 1_000i64), (0xbb, 1_100), (0xcc, 1_200)] {
        store
            .upsert_payment_wallet(&addr(party), Chain::Base, seen)
            .expect("wallet");
    }
    let b_owner = Address::from([0xbb; 20]);
    store
        .upsert_identity_wallet(
            &IdentityMint {
                owner: b_owner,
                agent_id: 9,
                block_number: 5,
                block_timestamp: Some(1_000),
            },
            Chain::Base,
            1_050,
        )
        .expect("identity");
    store
        .insert_feedback(&feedback(0x04, 0, 9, 48, 1), "chain")
        .expect("feedback");

    let outcome = run_scoring_pass(&store, false).expect("scoring pass");
    assert_eq!(outcome.scored, 3);
    assert_eq!(outcome.skipped, 0);
    assert_eq!(
        outcome.tier_high + outcome.tier_medium + outcome.tier_low + outcome.tier_minimal,
        3
    );

    for party in [0xaau8, 0xbb, 0xcc] {
        let row = store.wallet(&addr(party)).expect("read").expect("row");
        let score = row.trust_score.expect("scored");
        assert!((0..=100).contains(&score));
        assert!(!row.needs_rescore);
        assert!(row.score_breakdown.is_some());
        assert!(row.role.is_some());
    }
    // Registered wallet got its bonus relative to its own breakdown.
    let b_row = store.wallet(&addr(0xbb)).expect("read").expect("row");
    let breakdown: serde_json::Value =
        serde_json::from_str(b_row.score_breakdown.as_deref().expect("json")).expect("parse");
    assert_eq!(breakdown["registered_bonus"], 5);

    // Incremental re-run finds nothing dirty.
    let rerun = run_scoring_pass(&store, false).expect("rerun");
    assert_eq!(rerun.scored, 0);

    // Full re-run rescores everyone and appends a second snapshot per wallet.
    let full = run_scoring_pass(&store, true).expect("full");
    assert_eq!(full.scored, 3);
    let snapshots = store.snapshots_after(0).expect("snapshots");
    assert_eq!(snapshots.len(), 6);

    let _ = fs::remove_file(path);
}

/// Snapshot deltas feed webhook matching the way the dispatcher reads them:
/// previous snapshot by id, threshold crossing on the new value.
#[test]
fn test_snapshot_delta_drives_webhook_match() {
    let path = temp_db_path("semantics_delta");
    let store = EventStore::open(&path).expect("open");

    let wallet = addr(0xaa);
    store
        .upsert_payment_wallet(&wallet, Chain::Base, 1_000)
        .expect("wallet");
    store
        .record_score(&wallet, 85, "{}", Some("buyer"), 2_000)
        .expect("first score");
    store
        .record_score(&wallet, 49, "{}", Some("buyer"), 3_000)
        .expect("second score");

    let key = store.create_api_key("k", "free", 1_000).expect("key");
    let hook_id = store
        .add_webhook(key, "https://example.com/hook", None, EVENT_SCORE_DROP, Some(50))
        .expect("hook");

    let snapshots = store.snapshots_after(store.dispatch_cursor().expect("cursor")).expect("snaps");
    assert_eq!(snapshots.len(), 2);
    let latest = &snapshots[1];
    let event = DeltaEvent {
        address: latest.address.clone(),
        old_score: store
            .previous_score(&latest.address, latest.id)
            .expect("previous"),
        new_score: latest.score,
        computed_at: latest.computed_at,
    };
    assert_eq!(event.old_score, Some(85));
    assert_eq!(event.new_score, 49);

    let hooks = store.active_webhooks().expect("hooks");
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].id, hook_id);
    assert!(webhook_matches(&hooks[0], &event));

    // The first snapshot has no prior score: directional hooks stay silent.
    let first = &snapshots[0];
    let first_event = DeltaEvent {
        address: first.address.clone(),
        old_score: store
            .previous_score(&first.address, first.id)
            .expect("previous"),
        new_score: first.score,
        computed_at: first.computed_at,
    };
    assert_eq!(first_event.old_score, None);
    assert!(!webhook_matches(&hooks[0], &first_event));

    store.commit_dispatch_cursor(latest.id).expect("commit");
    assert!(store
        .snapshots_after(store.dispatch_cursor().expect("cursor"))
        .expect("drained")
        .is_empty());

    let _ = fs::remove_file(path);
}

/// Concurrent scoring passes are excluded by the run lock.
#[test]
fn test_second_scoring_pass_fails_on_run_lock() {
    let path = temp_db_path("semantics_lock");
    let store = EventStore::open(&path).expect("open");

    store.try_acquire_run_lock("scoring", 1_800).expect("hold lock");
    assert!(run_scoring_pass(&store, false).is_err());
    store.release_run_lock("scoring").expect("release");
    assert!(run_scoring_pass(&store, false).is_ok());

    let _ = fs::remove_file(path);
}
