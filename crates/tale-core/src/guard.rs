//! **Budget Guard**: circuit breaker over the generative provider.
//!
//! State lives behind the key-value port under a fixed namespace so concurrent invokers share
//! one breaker. Four keys per namespace:
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `{ns}:circuit_open` | reason string | `circuit_reset_ms` |
//! | `{ns}:failure_count` | integer | `circuit_reset_ms` (fixed window) |
//! | `{ns}:total_tokens` | integer | none |
//! | `{ns}:total_cost_usd` | decimal | none |
//!
//! There is no half-open probe. The open flag expires on its own and the next call is simply
//! allowed.
//!
//! Accounting is a soft budget, not a billing ledger. Totals are updated with get-then-set, so
//! concurrent successes can undercount, and two failures racing on the counter may open the
//! circuit one call late. Store errors never block a call: they are logged and the check passes.

use crate::error::{BudgetReason, TaleError, TaleResult};
use crate::kv::KvStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const KEY_OPEN: &str = "circuit_open";
const KEY_FAILURES: &str = "failure_count";
const KEY_TOKENS: &str = "total_tokens";
const KEY_COST: &str = "total_cost_usd";

/// Thresholds for the budget guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Key prefix per provider/environment (e.g. `tale:finops:prod`).
    pub namespace: String,
    pub token_budget_per_session: u64,
    pub cost_threshold_usd: f64,
    pub failure_threshold: u32,
    pub circuit_reset_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            namespace: "tale:finops".to_string(),
            token_budget_per_session: 50_000,
            cost_threshold_usd: 0.50,
            failure_threshold: 5,
            circuit_reset_ms: 60_000,
        }
    }
}

impl GuardConfig {
    pub fn circuit_reset(&self) -> Duration {
        Duration::from_millis(self.circuit_reset_ms)
    }
}

/// Read-only breaker snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetState {
    pub is_open: bool,
    pub open_reason: Option<String>,
    pub failure_count: u32,
    pub total_tokens_used: u64,
    pub total_cost_usd: f64,
}

/// Outcome of one provider call, as seen by the breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success { tokens: u64, cost_usd: f64 },
    Failure,
}

/// Typed view of breaker state used by the invoker.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Fail with `CircuitOpen`/`BudgetExceeded` if no provider call may be attempted,
    /// opening the circuit when a ceiling has just been crossed.
    async fn check_and_maybe_open(&self) -> TaleResult<()>;

    /// Account for a finished call. Never fails: accounting is best-effort.
    async fn record_outcome(&self, outcome: Outcome);

    async fn snapshot(&self) -> TaleResult<BudgetState>;

    /// Clear all breaker state (operator escape hatch).
    async fn reset(&self) -> TaleResult<()>;
}

/// Breaker implemented on the key-value port.
#[derive(Clone)]
pub struct BudgetGuard {
    kv: Arc<dyn KvStore>,
    config: GuardConfig,
}

impl BudgetGuard {
    pub fn new(kv: Arc<dyn KvStore>, config: GuardConfig) -> Self {
        Self { kv, config }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.config.namespace, name)
    }

    /// Called before every provider call.
    pub async fn check_circuit_breaker(&self) -> TaleResult<()> {
        match self.kv.get(&self.key(KEY_OPEN)).await {
            Ok(Some(reason)) => return Err(TaleError::CircuitOpen { reason }),
            Ok(None) => {}
            Err(e) => {
                warn!(target: "tale::finops", "breaker flag unreadable, allowing call: {}", e);
                return Ok(());
            }
        }

        let (tokens, cost) = self.read_totals().await;
        if cost >= self.config.cost_threshold_usd {
            self.open_circuit(BudgetReason::CostThreshold).await;
            return Err(TaleError::BudgetExceeded(BudgetReason::CostThreshold));
        }
        if tokens >= self.config.token_budget_per_session {
            self.open_circuit(BudgetReason::TokenBudget).await;
            return Err(TaleError::BudgetExceeded(BudgetReason::TokenBudget));
        }
        Ok(())
    }

    /// Raise the open flag for one reset window.
    pub async fn open_circuit(&self, reason: BudgetReason) {
        warn!(
            target: "tale::finops",
            reason = reason.as_str(),
            reset_ms = self.config.circuit_reset_ms,
            "circuit opened"
        );
        if let Err(e) = self
            .kv
            .set(&self.key(KEY_OPEN), reason.as_str(), Some(self.config.circuit_reset()))
            .await
        {
            warn!(target: "tale::finops", "failed to persist open flag: {}", e);
        }
    }

    /// Clear the failure counter and add to the running totals (get-then-set).
    pub async fn record_success(&self, tokens_used: u64, cost_usd: f64) {
        if let Err(e) = self.kv.delete(&self.key(KEY_FAILURES)).await {
            warn!(target: "tale::finops", "failed to clear failure counter: {}", e);
        }
        let (tokens, cost) = self.read_totals().await;
        let tokens = tokens.saturating_add(tokens_used);
        let cost = cost + cost_usd.max(0.0);
        if let Err(e) = self
            .kv
            .set(&self.key(KEY_TOKENS), &tokens.to_string(), None)
            .await
        {
            warn!(target: "tale::finops", "failed to record tokens: {}", e);
        }
        if let Err(e) = self.kv.set(&self.key(KEY_COST), &cost.to_string(), None).await {
            warn!(target: "tale::finops", "failed to record cost: {}", e);
        }
        info!(
            target: "tale::finops",
            tokens = tokens_used,
            cost_usd = cost_usd,
            total_tokens = tokens,
            total_cost_usd = cost,
            "usage recorded"
        );
    }

    /// Count a failed call; opens the circuit when the threshold is reached.
    pub async fn record_failure(&self) {
        let count = match self
            .kv
            .increment(&self.key(KEY_FAILURES), Some(self.config.circuit_reset()))
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(target: "tale::finops", "failed to count failure: {}", e);
                return;
            }
        };
        warn!(target: "tale::finops", failures = count, "provider failure recorded");
        if count >= i64::from(self.config.failure_threshold) {
            self.open_circuit(BudgetReason::ConsecutiveFailures).await;
        }
    }

    /// Remove every breaker key unconditionally.
    pub async fn reset_circuit_breaker(&self) -> TaleResult<()> {
        for name in [KEY_OPEN, KEY_FAILURES, KEY_TOKENS, KEY_COST] {
            self.kv.delete(&self.key(name)).await?;
        }
        info!(target: "tale::finops", namespace = %self.config.namespace, "circuit breaker reset");
        Ok(())
    }

    pub async fn get_circuit_status(&self) -> TaleResult<BudgetState> {
        let open_reason = self.kv.get(&self.key(KEY_OPEN)).await?;
        let failure_count = self
            .kv
            .get(&self.key(KEY_FAILURES))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let total_tokens_used = parse_or_zero(self.kv.get(&self.key(KEY_TOKENS)).await?);
        let total_cost_usd = parse_or_zero(self.kv.get(&self.key(KEY_COST)).await?);
        Ok(BudgetState {
            is_open: open_reason.is_some(),
            open_reason,
            failure_count,
            total_tokens_used,
            total_cost_usd,
        })
    }

    async fn read_totals(&self) -> (u64, f64) {
        let tokens = match self.kv.get(&self.key(KEY_TOKENS)).await {
            Ok(v) => parse_or_zero(v),
            Err(e) => {
                warn!(target: "tale::finops", "token total unreadable: {}", e);
                0
            }
        };
        let cost = match self.kv.get(&self.key(KEY_COST)).await {
            Ok(v) => parse_or_zero(v),
            Err(e) => {
                warn!(target: "tale::finops", "cost total unreadable: {}", e);
                0.0
            }
        };
        (tokens, cost)
    }
}

fn parse_or_zero<T: std::str::FromStr + Default>(raw: Option<String>) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or_default()
}

#[async_trait]
impl BudgetStore for BudgetGuard {
    async fn check_and_maybe_open(&self) -> TaleResult<()> {
        self.check_circuit_breaker().await
    }

    async fn record_outcome(&self, outcome: Outcome) {
        match outcome {
            Outcome::Success { tokens, cost_usd } => self.record_success(tokens, cost_usd).await,
            Outcome::Failure => self.record_failure().await,
        }
    }

    async fn snapshot(&self) -> TaleResult<BudgetState> {
        self.get_circuit_status().await
    }

    async fn reset(&self) -> TaleResult<()> {
        self.reset_circuit_breaker().await
    }
}
