//! Error types for the provider mediation core

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for core operations
pub type TaleResult<T> = Result<T, TaleError>;

/// Which ceiling tripped the budget guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetReason {
    /// Accumulated cost reached `cost_threshold_usd`.
    CostThreshold,
    /// Accumulated tokens reached `token_budget_per_session`.
    TokenBudget,
    /// `failure_threshold` failures inside one reset window.
    ConsecutiveFailures,
}

impl BudgetReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CostThreshold => "cost_threshold",
            Self::TokenBudget => "token_budget",
            Self::ConsecutiveFailures => "consecutive_failures",
        }
    }
}

impl std::fmt::Display for BudgetReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while mediating a provider call
#[derive(Error, Debug)]
pub enum TaleError {
    #[error("Circuit open ({reason}): provider calls suspended")]
    CircuitOpen { reason: String },

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(BudgetReason),

    #[error("Provider timed out after {0:?}")]
    ProviderTimeout(Duration),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("Key-value store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TaleError {
    /// True for fail-fast policy decisions (circuit/budget). The UI shows "try again later"
    /// for these instead of a generic failure.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::BudgetExceeded(_))
    }
}

impl From<reqwest::Error> for TaleError {
    fn from(err: reqwest::Error) -> Self {
        TaleError::Provider(err.to_string())
    }
}

impl From<sled::Error> for TaleError {
    fn from(err: sled::Error) -> Self {
        TaleError::Store(err.to_string())
    }
}

impl From<config::ConfigError> for TaleError {
    fn from(err: config::ConfigError) -> Self {
        TaleError::Config(err.to_string())
    }
}
