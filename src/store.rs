//! Durable relational store for the pipeline.
//!
//! Single sqlite file shared by the indexer, the scoring engine, and the
//! dispatcher. Write-sets are partitioned: indexers own `wallets` (observation
//! columns), `transactions`, `feedback`, `indexer_state`; the scoring engine
//! owns the scoring columns and `score_history`; the dispatcher owns webhook
//! delivery metadata. Row conflicts resolve through idempotent upserts, so
//! concurrent scanners for different chains need no explicit locking.

use crate::config::chains::Chain;
use crate::error::{StoreError, TrustError};
use crate::events::{FeedbackRecord, IdentityMint};
use crate::utils::now_secs;
use rusqlite::ffi::ErrorCode;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SOURCE_ERC8004: &str = "erc8004";
pub const SOURCE_X402: &str = "x402";
pub const SOURCE_BOTH: &str = "both";

/// Scanner id reserved for the dispatcher's position in `score_history`.
pub const DISPATCH_CURSOR_ID: &str = "dispatcher";

#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub tx_hash: String,
    pub chain: Chain,
    pub block_number: u64,
    pub authorizer: Option<String>,
    pub payer: Option<String>,
    pub recipient: Option<String>,
    /// Full-precision integer amount as text.
    pub amount_raw: String,
    /// Exact micro-USDC.
    pub amount_micro: i64,
    pub facilitator: String,
    pub is_x402: bool,
    pub block_timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct WalletRow {
    pub address: String,
    pub source: String,
    pub chain: String,
    pub erc8004_id: Option<i64>,
    pub tx_count: i64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub trust_score: Option<i64>,
    pub score_breakdown: Option<String>,
    pub scored_at: Option<i64>,
    pub role: Option<String>,
    pub needs_rescore: bool,
}

/// Wallet columns the scoring pass reads.
#[derive(Debug, Clone)]
pub struct ScoringCandidate {
    pub address: String,
    pub erc8004_id: Option<i64>,
    pub tx_count: i64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

#[derive(Debug, Clone)]
pub struct ScoreSnapshot {
    pub id: i64,
    pub address: String,
    pub score: i64,
    pub computed_at: i64,
}

#[derive(Debug, Clone)]
pub struct WebhookRow {
    pub id: i64,
    pub api_key_id: i64,
    pub url: String,
    pub wallet_address: Option<String>,
    pub event_type: String,
    pub threshold: Option<i64>,
    pub consecutive_failures: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCounts {
    pub wallets: u64,
    pub transactions: u64,
    pub feedback: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackStats {
    pub count: u64,
    pub sum_micro: i64,
}

impl FeedbackStats {
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum_micro as f64 / (self.count as f64 * 1_000_000.0))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeStats {
    pub total_micro: i64,
    pub counterparties: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RoleStats {
    pub payer_count: u64,
    pub recipient_count: u64,
}

#[derive(Debug, Clone)]
pub struct EventStore {
    path: PathBuf,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        self.with_connection("ensure_schema", |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS wallets (
                    address TEXT PRIMARY KEY NOT NULL,
                    source TEXT NOT NULL,
                    chain TEXT NOT NULL,
                    erc8004_id INTEGER,
                    tx_count INTEGER NOT NULL DEFAULT 0,
                    first_seen_at INTEGER NOT NULL,
                    last_seen_at INTEGER NOT NULL,
                    trust_score INTEGER,
                    score_breakdown TEXT,
                    scored_at INTEGER,
                    role TEXT,
                    needs_rescore INTEGER NOT NULL DEFAULT 1
                );
                CREATE INDEX IF NOT EXISTS idx_wallets_source ON wallets(source);
                CREATE INDEX IF NOT EXISTS idx_wallets_needs_rescore ON wallets(needs_rescore);

                CREATE TABLE IF NOT EXISTS transactions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    tx_hash TEXT NOT NULL,
                    chain TEXT NOT NULL,
                    block_number INTEGER NOT NULL,
                    authorizer TEXT,
                    payer TEXT,
                    recipient TEXT,
                    amount_raw TEXT NOT NULL,
                    amount_usdc TEXT NOT NULL,
                    amount_micro INTEGER NOT NULL,
                    facilitator TEXT NOT NULL,
                    is_x402 INTEGER NOT NULL DEFAULT 0,
                    block_timestamp INTEGER NOT NULL,
                    UNIQUE (tx_hash, chain)
                );
                CREATE INDEX IF NOT EXISTS idx_transactions_payer ON transactions(payer);
                CREATE INDEX IF NOT EXISTS idx_transactions_recipient ON transactions(recipient);
                CREATE INDEX IF NOT EXISTS idx_transactions_authorizer ON transactions(authorizer);
                CREATE INDEX IF NOT EXISTS idx_transactions_block_number ON transactions(block_number);

                CREATE TABLE IF NOT EXISTS feedback (
                    tx_hash TEXT NOT NULL,
                    feedback_index INTEGER NOT NULL,
                    agent_id INTEGER NOT NULL,
                    client_address TEXT NOT NULL,
                    value TEXT NOT NULL,
                    value_decimals INTEGER NOT NULL,
                    value_micro INTEGER NOT NULL,
                    tag1 TEXT,
                    tag2 TEXT,
                    endpoint TEXT,
                    feedback_uri TEXT,
                    feedback_hash TEXT NOT NULL,
                    block_number INTEGER NOT NULL,
                    block_timestamp INTEGER,
                    source TEXT NOT NULL DEFAULT 'chain',
                    PRIMARY KEY (tx_hash, feedback_index)
                );
                CREATE INDEX IF NOT EXISTS idx_feedback_agent_id ON feedback(agent_id);
                CREATE INDEX IF NOT EXISTS idx_feedback_client_address ON feedback(client_address);

                CREATE TABLE IF NOT EXISTS indexer_state (
                    scanner_id TEXT PRIMARY KEY NOT NULL,
                    last_block INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS score_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    address TEXT NOT NULL,
                    score INTEGER NOT NULL,
                    breakdown TEXT NOT NULL,
                    computed_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_score_history_address ON score_history(address);
                CREATE INDEX IF NOT EXISTS idx_score_history_computed_at ON score_history(computed_at);

                CREATE TABLE IF NOT EXISTS api_keys (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key_hash TEXT NOT NULL UNIQUE,
                    tier TEXT NOT NULL DEFAULT 'free',
                    daily_quota INTEGER NOT NULL DEFAULT 1000,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS api_usage (
                    key_id INTEGER NOT NULL,
                    day TEXT NOT NULL,
                    requests INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (key_id, day),
                    FOREIGN KEY (key_id) REFERENCES api_keys(id) ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS webhooks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    api_key_id INTEGER NOT NULL,
                    url TEXT NOT NULL,
                    wallet_address TEXT,
                    event_type TEXT NOT NULL,
                    threshold INTEGER,
                    active INTEGER NOT NULL DEFAULT 1,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    last_delivery_at INTEGER,
                    last_status TEXT,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_webhooks_api_key_id ON webhooks(api_key_id);
                CREATE INDEX IF NOT EXISTS idx_webhooks_wallet_address ON webhooks(wallet_address);

                CREATE TABLE IF NOT EXISTS run_locks (
                    name TEXT PRIMARY KEY NOT NULL,
                    acquired_at INTEGER NOT NULL
                );
                "#,
            )?;
            // WAL keeps scanner writes from blocking scoring reads.
            let _ = conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                "#,
            );
            Ok(())
        })
    }

    fn with_connection<T, F>(&self, context: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let max_attempts = 6u32;
        let mut last_err = String::new();

        for attempt in 1..=max_attempts {
            let conn = Connection::open(&self.path).map_err(|err| {
                TrustError::Store(StoreError::Sqlite(format!(
                    "failed to open {}: {}",
                    self.path.display(),
                    err
                )))
            })?;
            conn.busy_timeout(Duration::from_millis(5_000)).map_err(|err| {
                TrustError::Store(StoreError::Sqlite(format!(
                    "failed to configure busy timeout: {err}"
                )))
            })?;

            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err.to_string();
                    if is_sqlite_locked_error(&err) && attempt < max_attempts {
                        continue;
                    }
                    return Err(TrustError::Store(StoreError::Sqlite(format!(
                        "{} failed for {}: {}",
                        context,
                        self.path.display(),
                        last_err
                    )))
                    .into());
                }
            }
        }

        Err(TrustError::Store(StoreError::Sqlite(format!(
            "{} failed for {} after {} attempt(s): {}",
            context,
            self.path.display(),
            max_attempts,
            last_err
        )))
        .into())
    }

    // ---- wallets -----------------------------------------------------------

    /// Observation from the identity registry. Promotes `x402` wallets to
    /// `both`, keeps the earliest agent id, never rewinds `first_seen_at`.
    pub fn upsert_identity_wallet(
        &self,
        mint: &IdentityMint,
        chain: Chain,
        seen_at: i64,
    ) -> anyhow::Result<()> {
        let address = format!("{:#x}", mint.owner);
        let agent_id = mint.agent_id as i64;
        self.with_connection("upsert_identity_wallet", move |conn| {
            conn.execute(
                r#"
                INSERT INTO wallets (address, source, chain, erc8004_id, tx_count,
                                     first_seen_at, last_seen_at, needs_rescore)
                VALUES (?1, 'erc8004', ?2, ?3, 0, ?4, ?4, 1)
                ON CONFLICT(address) DO UPDATE SET
                    source = CASE WHEN wallets.source = 'x402' THEN 'both' ELSE wallets.source END,
                    erc8004_id = COALESCE(wallets.erc8004_id, excluded.erc8004_id),
                    last_seen_at = MAX(wallets.last_seen_at, excluded.last_seen_at),
                    needs_rescore = 1
                "#,
                params![address, chain.as_str(), agent_id, seen_at],
            )?;
            Ok(())
        })
    }

    /// Observation from the payment scanner: one settled transfer the wallet
    /// took part in. Promotes `erc8004` wallets to `both`.
    pub fn upsert_payment_wallet(
        &self,
        address: &str,
        chain: Chain,
        seen_at: i64,
    ) -> anyhow::Result<()> {
        self.with_connection("upsert_payment_wallet", move |conn| {
            conn.execute(
                r#"
                INSERT INTO wallets (address, source, chain, tx_count,
                                     first_seen_at, last_seen_at, needs_rescore)
                VALUES (?1, 'x402', ?2, 1, ?3, ?3, 1)
                ON CONFLICT(address) DO UPDATE SET
                    source = CASE WHEN wallets.source = 'erc8004' THEN 'both' ELSE wallets.source END,
                    tx_count = wallets.tx_count + 1,
                    last_seen_at = MAX(wallets.last_seen_at, excluded.last_seen_at),
                    needs_rescore = 1
                "#,
                params![address, chain.as_str(), seen_at],
            )?;
            Ok(())
        })
    }

    pub fn wallet(&self, address: &str) -> anyhow::Result<Option<WalletRow>> {
        self.with_connection("wallet", move |conn| {
            conn.query_row(
                r#"
                SELECT address, source, chain, erc8004_id, tx_count, first_seen_at,
                       last_seen_at, trust_score, score_breakdown, scored_at, role,
                       needs_rescore
                FROM wallets WHERE address = ?1
                "#,
                params![address],
                |row| {
                    Ok(WalletRow {
                        address: row.get(0)?,
                        source: row.get(1)?,
                        chain: row.get(2)?,
                        erc8004_id: row.get(3)?,
                        tx_count: row.get(4)?,
                        first_seen_at: row.get(5)?,
                        last_seen_at: row.get(6)?,
                        trust_score: row.get(7)?,
                        score_breakdown: row.get(8)?,
                        scored_at: row.get(9)?,
                        role: row.get(10)?,
                        needs_rescore: row.get::<_, i64>(11)? != 0,
                    })
                },
            )
            .optional()
        })
    }

    // ---- transactions and feedback ----------------------------------------

    /// Idempotent on `(tx_hash, chain)`. Returns whether a new row landed.
    pub fn insert_transaction(&self, row: &TransactionRow) -> anyhow::Result<bool> {
        let amount_usdc = crate::utils::format_usdc(row.amount_micro);
        self.with_connection("insert_transaction", move |conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO transactions
                    (tx_hash, chain, block_number, authorizer, payer, recipient,
                     amount_raw, amount_usdc, amount_micro, facilitator, is_x402,
                     block_timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    row.tx_hash,
                    row.chain.as_str(),
                    row.block_number as i64,
                    row.authorizer,
                    row.payer,
                    row.recipient,
                    row.amount_raw,
                    amount_usdc,
                    row.amount_micro,
                    row.facilitator,
                    row.is_x402 as i64,
                    row.block_timestamp,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Idempotent on `(tx_hash, feedback_index)`. Returns whether a new row
    /// landed.
    pub fn insert_feedback(&self, record: &FeedbackRecord, source: &str) -> anyhow::Result<bool> {
        let value_micro =
            crate::events::feedback_value_micro(record.value, record.value_decimals);
        self.with_connection("insert_feedback", move |conn| {
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO feedback
                    (tx_hash, feedback_index, agent_id, client_address, value,
                     value_decimals, value_micro, tag1, tag2, endpoint, feedback_uri,
                     feedback_hash, block_number, block_timestamp, source)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
                params![
                    format!("{:#x}", record.tx_hash),
                    record.feedback_index as i64,
                    record.agent_id as i64,
                    format!("{:#x}", record.client_address),
                    record.value.to_string(),
                    record.value_decimals,
                    value_micro,
                    record.tag1,
                    record.tag2,
                    record.endpoint,
                    record.feedback_uri,
                    format!("{:#x}", record.feedback_hash),
                    record.block_number as i64,
                    record.block_timestamp.map(|v| v as i64),
                    source,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    // ---- scanner cursors ---------------------------------------------------

    pub fn cursor(&self, scanner_id: &str) -> anyhow::Result<Option<u64>> {
        self.with_connection("cursor", move |conn| {
            conn.query_row(
                "SELECT last_block FROM indexer_state WHERE scanner_id = ?1",
                params![scanner_id],
                |row| row.get::<_, i64>(0).map(|v| v.max(0) as u64),
            )
            .optional()
        })
    }

    fn commit_cursor_once(&self, scanner_id: &str, last_block: u64) -> anyhow::Result<()> {
        let now = now_secs();
        self.with_connection("commit_cursor", move |conn| {
            conn.execute(
                r#"
                INSERT INTO indexer_state (scanner_id, last_block, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(scanner_id) DO UPDATE SET
                    last_block = MAX(indexer_state.last_block, excluded.last_block),
                    updated_at = excluded.updated_at
                "#,
                params![scanner_id, last_block as i64, now],
            )?;
            Ok(())
        })
    }

    /// Commit a cursor, retrying once on a transient failure. A second
    /// failure is surfaced: the batch will be redone on the next run and every
    /// insert behind it is idempotent.
    pub fn commit_cursor(&self, scanner_id: &str, last_block: u64) -> anyhow::Result<()> {
        match self.commit_cursor_once(scanner_id, last_block) {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(
                    "[STORE] Cursor commit for `{}` at {} failed once ({}); retrying",
                    scanner_id,
                    last_block,
                    first
                );
                self.commit_cursor_once(scanner_id, last_block).map_err(|err| {
                    TrustError::Store(StoreError::CursorCommit {
                        scanner_id: scanner_id.to_string(),
                        block: last_block,
                        reason: err.to_string(),
                    })
                    .into()
                })
            }
        }
    }

    // ---- scoring -----------------------------------------------------------

    pub fn scoring_candidates(&self, full: bool) -> anyhow::Result<Vec<ScoringCandidate>> {
        let sql = if full {
            "SELECT address, erc8004_id, tx_count, first_seen_at, last_seen_at
             FROM wallets ORDER BY address"
        } else {
            "SELECT address, erc8004_id, tx_count, first_seen_at, last_seen_at
             FROM wallets WHERE needs_rescore = 1 ORDER BY address"
        };
        self.with_connection("scoring_candidates", move |conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(ScoringCandidate {
                    address: row.get(0)?,
                    erc8004_id: row.get(1)?,
                    tx_count: row.get(2)?,
                    first_seen_at: row.get(3)?,
                    last_seen_at: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Persist one scored wallet: the snapshot row lands before the wallet
    /// update, inside one transaction, so history never misses a persisted
    /// score.
    pub fn record_score(
        &self,
        address: &str,
        score: i64,
        breakdown_json: &str,
        role: Option<&str>,
        computed_at: i64,
    ) -> anyhow::Result<()> {
        self.with_connection("record_score", move |conn| {
            conn.execute("BEGIN IMMEDIATE", [])?;
            let result = (|| -> rusqlite::Result<()> {
                conn.execute(
                    "INSERT INTO score_history (address, score, breakdown, computed_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![address, score, breakdown_json, computed_at],
                )?;
                conn.execute(
                    "UPDATE wallets SET trust_score = ?2, score_breakdown = ?3,
                            scored_at = ?4, role = ?5, needs_rescore = 0
                     WHERE address = ?1",
                    params![address, score, breakdown_json, computed_at, role],
                )?;
                Ok(())
            })();
            match result {
                Ok(()) => {
                    conn.execute("COMMIT", [])?;
                    Ok(())
                }
                Err(err) => {
                    let _ = conn.execute("ROLLBACK", []);
                    Err(err)
                }
            }
        })
    }

    // ---- signal aggregation (set-oriented, one query per signal) -----------

    pub fn counterparty_stats(&self) -> anyhow::Result<HashMap<String, u64>> {
        self.with_connection("counterparty_stats", |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT address, COUNT(DISTINCT counterparty) AS n FROM (
                    SELECT payer AS address, recipient AS counterparty
                    FROM transactions WHERE payer IS NOT NULL
                    UNION ALL
                    SELECT recipient AS address, payer AS counterparty
                    FROM transactions WHERE recipient IS NOT NULL
                )
                GROUP BY address
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?;
            rows.collect()
        })
    }

    pub fn feedback_stats(&self) -> anyhow::Result<HashMap<i64, FeedbackStats>> {
        self.with_connection("feedback_stats", |conn| {
            let mut stmt = conn.prepare(
                "SELECT agent_id, COUNT(*), SUM(value_micro) FROM feedback GROUP BY agent_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    FeedbackStats {
                        count: row.get::<_, i64>(1)?.max(0) as u64,
                        sum_micro: row.get::<_, i64>(2)?,
                    },
                ))
            })?;
            rows.collect()
        })
    }

    pub fn volume_stats(&self) -> anyhow::Result<HashMap<String, VolumeStats>> {
        self.with_connection("volume_stats", |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT address, SUM(amount_micro), COUNT(DISTINCT counterparty) FROM (
                    SELECT payer AS address, recipient AS counterparty, amount_micro
                    FROM transactions WHERE payer IS NOT NULL
                    UNION ALL
                    SELECT recipient AS address, payer AS counterparty, amount_micro
                    FROM transactions WHERE recipient IS NOT NULL
                )
                GROUP BY address
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    VolumeStats {
                        total_micro: row.get::<_, i64>(1)?,
                        counterparties: row.get::<_, i64>(2)?.max(0) as u64,
                    },
                ))
            })?;
            rows.collect()
        })
    }

    pub fn role_stats(&self) -> anyhow::Result<HashMap<String, RoleStats>> {
        self.with_connection("role_stats", |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT address, SUM(as_payer), SUM(as_recipient) FROM (
                    SELECT payer AS address, 1 AS as_payer, 0 AS as_recipient
                    FROM transactions WHERE payer IS NOT NULL
                    UNION ALL
                    SELECT recipient AS address, 0 AS as_payer, 1 AS as_recipient
                    FROM transactions WHERE recipient IS NOT NULL
                )
                GROUP BY address
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    RoleStats {
                        payer_count: row.get::<_, i64>(1)?.max(0) as u64,
                        recipient_count: row.get::<_, i64>(2)?.max(0) as u64,
                    },
                ))
            })?;
            rows.collect()
        })
    }

    // ---- snapshots and the dispatcher's position ---------------------------

    pub fn snapshots_after(&self, last_seen_id: i64) -> anyhow::Result<Vec<ScoreSnapshot>> {
        self.with_connection("snapshots_after", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, address, score, computed_at FROM score_history
                 WHERE id > ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![last_seen_id], |row| {
                Ok(ScoreSnapshot {
                    id: row.get(0)?,
                    address: row.get(1)?,
                    score: row.get(2)?,
                    computed_at: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Score of the snapshot immediately preceding `before_id` for an address.
    pub fn previous_score(&self, address: &str, before_id: i64) -> anyhow::Result<Option<i64>> {
        self.with_connection("previous_score", move |conn| {
            conn.query_row(
                "SELECT score FROM score_history
                 WHERE address = ?1 AND id < ?2 ORDER BY id DESC LIMIT 1",
                params![address, before_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn dispatch_cursor(&self) -> anyhow::Result<i64> {
        Ok(self
            .cursor(DISPATCH_CURSOR_ID)?
            .map(|v| v as i64)
            .unwrap_or(0))
    }

    pub fn commit_dispatch_cursor(&self, snapshot_id: i64) -> anyhow::Result<()> {
        self.commit_cursor(DISPATCH_CURSOR_ID, snapshot_id.max(0) as u64)
    }

    // ---- webhooks ----------------------------------------------------------

    pub fn add_webhook(
        &self,
        api_key_id: i64,
        url: &str,
        wallet_address: Option<&str>,
        event_type: &str,
        threshold: Option<i64>,
    ) -> anyhow::Result<i64> {
        let now = now_secs();
        self.with_connection("add_webhook", move |conn| {
            conn.execute(
                "INSERT INTO webhooks (api_key_id, url, wallet_address, event_type, threshold, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![api_key_id, url, wallet_address, event_type, threshold, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn active_webhooks(&self) -> anyhow::Result<Vec<WebhookRow>> {
        self.with_connection("active_webhooks", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, api_key_id, url, wallet_address, event_type, threshold,
                        consecutive_failures
                 FROM webhooks WHERE active = 1 ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(WebhookRow {
                    id: row.get(0)?,
                    api_key_id: row.get(1)?,
                    url: row.get(2)?,
                    wallet_address: row.get(3)?,
                    event_type: row.get(4)?,
                    threshold: row.get(5)?,
                    consecutive_failures: row.get(6)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn record_webhook_success(&self, webhook_id: i64) -> anyhow::Result<()> {
        let now = now_secs();
        self.with_connection("record_webhook_success", move |conn| {
            conn.execute(
                "UPDATE webhooks SET consecutive_failures = 0, last_delivery_at = ?2,
                        last_status = 'delivered'
                 WHERE id = ?1",
                params![webhook_id, now],
            )?;
            Ok(())
        })
    }

    /// Bump the consecutive-failure counter; past `max_consecutive` the
    /// webhook is disabled until an operator re-enables it. Returns whether
    /// this call disabled it.
    pub fn record_webhook_failure(
        &self,
        webhook_id: i64,
        status: &str,
        max_consecutive: i64,
    ) -> anyhow::Result<bool> {
        let now = now_secs();
        self.with_connection("record_webhook_failure", move |conn| {
            conn.execute(
                "UPDATE webhooks SET consecutive_failures = consecutive_failures + 1,
                        last_delivery_at = ?2, last_status = ?3
                 WHERE id = ?1",
                params![webhook_id, now, status],
            )?;
            let disabled = conn.execute(
                "UPDATE webhooks SET active = 0
                 WHERE id = ?1 AND active = 1 AND consecutive_failures >= ?2",
                params![webhook_id, max_consecutive],
            )?;
            Ok(disabled > 0)
        })
    }

    pub fn enable_webhook(&self, webhook_id: i64) -> anyhow::Result<()> {
        self.with_connection("enable_webhook", move |conn| {
            conn.execute(
                "UPDATE webhooks SET active = 1, consecutive_failures = 0 WHERE id = ?1",
                params![webhook_id],
            )?;
            Ok(())
        })
    }

    // ---- api keys ----------------------------------------------------------

    pub fn create_api_key(&self, key_hash: &str, tier: &str, daily_quota: i64) -> anyhow::Result<i64> {
        let now = now_secs();
        self.with_connection("create_api_key", move |conn| {
            conn.execute(
                "INSERT INTO api_keys (key_hash, tier, daily_quota, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![key_hash, tier, daily_quota, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Count one request against `(key, day)`; returns the day's new total so
    /// the caller can enforce the quota.
    pub fn record_api_usage(&self, key_id: i64, day: &str) -> anyhow::Result<i64> {
        self.with_connection("record_api_usage", move |conn| {
            conn.execute(
                "INSERT INTO api_usage (key_id, day, requests) VALUES (?1, ?2, 1)
                 ON CONFLICT(key_id, day) DO UPDATE SET requests = api_usage.requests + 1",
                params![key_id, day],
            )?;
            conn.query_row(
                "SELECT requests FROM api_usage WHERE key_id = ?1 AND day = ?2",
                params![key_id, day],
                |row| row.get(0),
            )
        })
    }

    // ---- run locks ---------------------------------------------------------

    /// Exclusive-run discipline for the scoring engine. A lock older than
    /// `stale_after_secs` is treated as abandoned and stolen.
    pub fn try_acquire_run_lock(&self, name: &str, stale_after_secs: i64) -> anyhow::Result<()> {
        let now = now_secs();
        let held_since: Option<i64> = self.with_connection("try_acquire_run_lock", move |conn| {
            conn.execute(
                "DELETE FROM run_locks WHERE name = ?1 AND acquired_at < ?2",
                params![name, now - stale_after_secs],
            )?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO run_locks (name, acquired_at) VALUES (?1, ?2)",
                params![name, now],
            )?;
            if inserted > 0 {
                return Ok(None);
            }
            conn.query_row(
                "SELECT acquired_at FROM run_locks WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
        })?;

        match held_since {
            None => Ok(()),
            Some(acquired_at) => Err(TrustError::Store(StoreError::RunLockHeld {
                held_for_secs: (now - acquired_at).max(0) as u64,
            })
            .into()),
        }
    }

    pub fn release_run_lock(&self, name: &str) -> anyhow::Result<()> {
        self.with_connection("release_run_lock", move |conn| {
            conn.execute("DELETE FROM run_locks WHERE name = ?1", params![name])?;
            Ok(())
        })
    }

    // ---- run summaries -----------------------------------------------------

    pub fn counts(&self) -> anyhow::Result<StoreCounts> {
        self.with_connection("counts", |conn| {
            let wallets: i64 = conn.query_row("SELECT COUNT(*) FROM wallets", [], |r| r.get(0))?;
            let transactions: i64 =
                conn.query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))?;
            let feedback: i64 =
                conn.query_row("SELECT COUNT(*) FROM feedback", [], |r| r.get(0))?;
            Ok(StoreCounts {
                wallets: wallets.max(0) as u64,
                transactions: transactions.max(0) as u64,
                feedback: feedback.max(0) as u64,
            })
        })
    }

    pub fn db_size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

fn is_sqlite_locked_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            )
        }
        _ => {
            let msg = err.to_string().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256};
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{}_{}.db", prefix, nanos))
    }

    fn mint(owner: u8, agent_id: u64) -> IdentityMint {
        IdentityMint {
            owner: Address::from([owner; 20]),
            agent_id,
            block_number: 100,
            block_timestamp: Some(1_700_000_000),
        }
    }

    fn tx_row(hash: &str, payer: &str, recipient: &str) -> TransactionRow {
        TransactionRow {
            tx_hash: hash.to_string(),
            chain: Chain::Base,
            block_number: 500,
            authorizer: Some(payer.to_string()),
            payer: Some(payer.to_string()),
            recipient: Some(recipient.to_string()),
            amount_raw: "1000000".to_string(),
            amount_micro: 1_000_000,
            facilitator: "0xfacefacefacefacefacefacefacefacefaceface".to_string(),
            is_x402: true,
            block_timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_source_promotion_is_commutative() {
        let path = temp_db_path("store_promotion");
        let store = EventStore::open(&path).expect("open");

        // identity first, payment second
        let a = mint(0x11, 7);
        let a_addr = format!("{:#x}", a.owner);
        store
            .upsert_identity_wallet(&a, Chain::Base, 1_000)
            .expect("identity upsert");
        store
            .upsert_payment_wallet(&a_addr, Chain::Base, 2_000)
            .expect("payment upsert");

        // payment first, identity second
        let b = mint(0x22, 9);
        let b_addr = format!("{:#x}", b.owner);
        store
            .upsert_payment_wallet(&b_addr, Chain::Base, 1_000)
            .expect("payment upsert");
        store
            .upsert_identity_wallet(&b, Chain::Base, 2_000)
            .expect("identity upsert");

        let a_row = store.wallet(&a_addr).expect("read").expect("exists");
        let b_row = store.wallet(&b_addr).expect("read").expect("exists");
        assert_eq!(a_row.source, SOURCE_BOTH);
        assert_eq!(b_row.source, SOURCE_BOTH);
        assert_eq!(a_row.erc8004_id, Some(7));
        assert_eq!(b_row.erc8004_id, Some(9));
        assert!(a_row.needs_rescore);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_identity_upsert_keeps_earliest_agent_id_and_first_seen() {
        let path = temp_db_path("store_identity_idem");
        let store = EventStore::open(&path).expect("open");

        let first = mint(0x33, 5);
        let addr = format!("{:#x}", first.owner);
        store
            .upsert_identity_wallet(&first, Chain::Ethereum, 1_000)
            .expect("first");
        let second = mint(0x33, 42);
        store
            .upsert_identity_wallet(&second, Chain::Ethereum, 500)
            .expect("second");

        let row = store.wallet(&addr).expect("read").expect("exists");
        assert_eq!(row.erc8004_id, Some(5));
        assert_eq!(row.first_seen_at, 1_000);
        assert_eq!(row.last_seen_at, 1_000); // never rewinds

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_transaction_insert_is_idempotent() {
        let path = temp_db_path("store_tx_idem");
        let store = EventStore::open(&path).expect("open");

        let row = tx_row("0xaaa", "0x01", "0x02");
        assert!(store.insert_transaction(&row).expect("first insert"));
        assert!(!store.insert_transaction(&row).expect("replay insert"));
        assert_eq!(store.counts().expect("counts").transactions, 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_feedback_insert_is_idempotent() {
        let path = temp_db_path("store_feedback_idem");
        let store = EventStore::open(&path).expect("open");

        let record = FeedbackRecord {
            tx_hash: B256::from([0x44; 32]),
            feedback_index: 3,
            agent_id: 12,
            client_address: Address::from([0x55; 20]),
            value: 45,
            value_decimals: 1,
            tag1: "latency".to_string(),
            tag2: String::new(),
            endpoint: "/v1/chat".to_string(),
            feedback_uri: "ipfs://feedback".to_string(),
            feedback_hash: B256::from([0x66; 32]),
            block_number: 900,
            block_timestamp: Some(1_700_000_123),
        };
        assert!(store.insert_feedback(&record, "chain").expect("first"));
        assert!(!store.insert_feedback(&record, "chain").expect("replay"));

        let stats = store.feedback_stats().expect("stats");
        let agent = stats.get(&12).expect("agent stats");
        assert_eq!(agent.count, 1);
        assert_eq!(agent.sum_micro, 4_500_000);
        assert_eq!(agent.mean(), Some(4.5));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_cursor_is_monotone() {
        let path = temp_db_path("store_cursor");
        let store = EventStore::open(&path).expect("open");

        assert_eq!(store.cursor("x402_base").expect("read"), None);
        store.commit_cursor("x402_base", 1_000_009).expect("commit");
        store.commit_cursor("x402_base", 1_000_019).expect("commit");
        // A stale commit can never rewind the cursor.
        store.commit_cursor("x402_base", 999_999).expect("commit");
        assert_eq!(store.cursor("x402_base").expect("read"), Some(1_000_019));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_aggregation_queries_cover_both_directions() {
        let path = temp_db_path("store_aggregation");
        let store = EventStore::open(&path).expect("open");

        store
            .insert_transaction(&tx_row("0x01", "0xaa", "0xbb"))
            .expect("insert");
        store
            .insert_transaction(&tx_row("0x02", "0xaa", "0xcc"))
            .expect("insert");
        store
            .insert_transaction(&tx_row("0x03", "0xbb", "0xaa"))
            .expect("insert");

        let counterparties = store.counterparty_stats().expect("counterparties");
        assert_eq!(counterparties.get("0xaa"), Some(&2));
        assert_eq!(counterparties.get("0xbb"), Some(&1));
        assert_eq!(counterparties.get("0xcc"), Some(&1));

        let volume = store.volume_stats().expect("volume");
        assert_eq!(volume.get("0xaa").expect("0xaa").total_micro, 3_000_000);
        assert_eq!(volume.get("0xcc").expect("0xcc").total_micro, 1_000_000);

        let roles = store.role_stats().expect("roles");
        let aa = roles.get("0xaa").expect("0xaa");
        assert!(aa.payer_count > 0 && aa.recipient_count > 0);
        let cc = roles.get("0xcc").expect("0xcc");
        assert_eq!(cc.payer_count, 0);
        assert_eq!(cc.recipient_count, 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_record_score_writes_snapshot_before_wallet_update() {
        let path = temp_db_path("store_record_score");
        let store = EventStore::open(&path).expect("open");

        let m = mint(0x77, 1);
        let addr = format!("{:#x}", m.owner);
        store
            .upsert_identity_wallet(&m, Chain::Base, 1_000)
            .expect("wallet");
        store
            .record_score(&addr, 61, "{\"loyalty\":25}", Some("buyer"), 2_000)
            .expect("score");

        let row = store.wallet(&addr).expect("read").expect("exists");
        assert_eq!(row.trust_score, Some(61));
        assert_eq!(row.role.as_deref(), Some("buyer"));
        assert!(!row.needs_rescore);

        let snapshots = store.snapshots_after(0).expect("snapshots");
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].address, addr);
        assert_eq!(snapshots[0].score, 61);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_webhook_failure_counter_disables_at_threshold() {
        let path = temp_db_path("store_webhook_disable");
        let store = EventStore::open(&path).expect("open");

        let key = store.create_api_key("hash1", "free", 1_000).expect("key");
        let hook = store
            .add_webhook(key, "https://example.com/hook", None, "score_change", None)
            .expect("webhook");

        for _ in 0..4 {
            assert!(!store
                .record_webhook_failure(hook, "http 500", 5)
                .expect("failure"));
        }
        assert!(store
            .record_webhook_failure(hook, "http 500", 5)
            .expect("failure"));
        assert!(store.active_webhooks().expect("active").is_empty());

        store.enable_webhook(hook).expect("enable");
        let active = store.active_webhooks().expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].consecutive_failures, 0);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_webhook_success_resets_failure_streak() {
        let path = temp_db_path("store_webhook_reset");
        let store = EventStore::open(&path).expect("open");

        let key = store.create_api_key("hash2", "free", 1_000).expect("key");
        let hook = store
            .add_webhook(key, "https://example.com/hook", None, "score_drop", Some(50))
            .expect("webhook");
        store
            .record_webhook_failure(hook, "timeout", 5)
            .expect("failure");
        store.record_webhook_success(hook).expect("success");

        let active = store.active_webhooks().expect("active");
        assert_eq!(active[0].consecutive_failures, 0);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_run_lock_excludes_second_holder_and_releases() {
        let path = temp_db_path("store_run_lock");
        let store = EventStore::open(&path).expect("open");

        store.try_acquire_run_lock("scoring", 1_800).expect("first");
        assert!(store.try_acquire_run_lock("scoring", 1_800).is_err());
        store.release_run_lock("scoring").expect("release");
        store.try_acquire_run_lock("scoring", 1_800).expect("again");

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_api_usage_counts_per_key_and_day() {
        let path = temp_db_path("store_api_usage");
        let store = EventStore::open(&path).expect("open");

        let key = store.create_api_key("hash3", "pro", 10_000).expect("key");
        assert_eq!(store.record_api_usage(key, "2025-11-02").expect("one"), 1);
        assert_eq!(store.record_api_usage(key, "2025-11-02").expect("two"), 2);
        assert_eq!(store.record_api_usage(key, "2025-11-03").expect("new day"), 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_dispatch_cursor_round_trip() {
        let path = temp_db_path("store_dispatch_cursor");
        let store = EventStore::open(&path).expect("open");

        assert_eq!(store.dispatch_cursor().expect("empty"), 0);
        store.commit_dispatch_cursor(17).expect("commit");
        assert_eq!(store.dispatch_cursor().expect("read"), 17);

        let _ = fs::remove_file(path);
    }
}
