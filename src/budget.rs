//! Compute-unit budget governor.
//!
//! One instance per process, owned by the binary root and shared with every
//! gateway. The gateway records each RPC call before it goes on the wire;
//! scanners poll `should_stop` between batches and exit cleanly when the
//! terminal flag is set. The flag is one-way within a run.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const DEFAULT_MONTHLY_BUDGET_CU: u64 = 300_000_000;
const DEFAULT_WARN_FRACTION: f64 = 0.80;
const STOP_FRACTION: f64 = 0.90;

/// Conservative fallback for methods missing from the cost table.
const DEFAULT_METHOD_COST_CU: u64 = 25;

const METHOD_COSTS: &[(&str, u64)] = &[
    ("eth_blockNumber", 10),
    ("eth_getLogs", 75),
    ("eth_getTransactionReceipt", 15),
    ("eth_getTransactionByHash", 15),
];

pub fn method_cost_cu(method: &str) -> u64 {
    METHOD_COSTS
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, cost)| *cost)
        .unwrap_or(DEFAULT_METHOD_COST_CU)
}

#[derive(Debug)]
pub struct BudgetGovernor {
    monthly_budget_cu: u64,
    warn_at_cu: u64,
    stop_at_cu: u64,
    total_cu: AtomicU64,
    calls_by_method: DashMap<String, u64>,
    warned: AtomicBool,
    stopped: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct BudgetSnapshot {
    pub total_cu: u64,
    pub monthly_budget_cu: u64,
    pub stopped: bool,
    /// (method, call count), sorted by method name.
    pub calls_by_method: Vec<(String, u64)>,
}

impl BudgetSnapshot {
    pub fn used_fraction(&self) -> f64 {
        if self.monthly_budget_cu == 0 {
            return 0.0;
        }
        self.total_cu as f64 / self.monthly_budget_cu as f64
    }
}

impl BudgetGovernor {
    pub fn from_env() -> Self {
        let budget = crate::utils::parse_u64_env("CU_MONTHLY_BUDGET", DEFAULT_MONTHLY_BUDGET_CU);
        let warn_fraction = std::env::var("CU_WARN_FRACTION")
            .ok()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v > 0.0 && *v < STOP_FRACTION)
            .unwrap_or(DEFAULT_WARN_FRACTION);
        Self::new(budget, warn_fraction)
    }

    pub fn new(monthly_budget_cu: u64, warn_fraction: f64) -> Self {
        let warn_at_cu = (monthly_budget_cu as f64 * warn_fraction) as u64;
        let stop_at_cu = (monthly_budget_cu as f64 * STOP_FRACTION) as u64;
        Self {
            monthly_budget_cu,
            warn_at_cu,
            stop_at_cu,
            total_cu: AtomicU64::new(0),
            calls_by_method: DashMap::new(),
            warned: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Record `n` calls to `method`. Crossing the warn mark logs once;
    /// crossing the stop mark latches the terminal flag.
    pub fn record(&self, method: &str, n: u64) {
        let cost = method_cost_cu(method).saturating_mul(n);
        let prev = self.total_cu.fetch_add(cost, Ordering::SeqCst);
        let total = prev.saturating_add(cost);

        *self
            .calls_by_method
            .entry(method.to_string())
            .or_insert(0) += n;

        if total >= self.warn_at_cu
            && prev < self.warn_at_cu
            && !self.warned.swap(true, Ordering::SeqCst)
        {
            tracing::warn!(
                "[BUDGET] {} of {} CU consumed ({:.0}% of monthly budget); scanners will stop at {:.0}%",
                total,
                self.monthly_budget_cu,
                100.0 * total as f64 / self.monthly_budget_cu.max(1) as f64,
                100.0 * STOP_FRACTION
            );
        }
        if total >= self.stop_at_cu && !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "[BUDGET] Terminal stop: {} CU consumed of {} budget. Scanners will exit at the next batch boundary.",
                total,
                self.monthly_budget_cu
            );
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut calls: Vec<(String, u64)> = self
            .calls_by_method
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        BudgetSnapshot {
            total_cu: self.total_cu.load(Ordering::SeqCst),
            monthly_budget_cu: self.monthly_budget_cu,
            stopped: self.should_stop(),
            calls_by_method: calls,
        }
    }

    /// Zero all counters and latches. Test-only.
    pub fn reset(&self) {
        self.total_cu.store(0, Ordering::SeqCst);
        self.calls_by_method.clear();
        self.warned.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
    }
}
