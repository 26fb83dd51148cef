//! **FinOps**: per-call token and cost estimate from provider usage metadata.
//!
//! Providers report usage in different spellings; the estimator reads the common ones and
//! returns `None` instead of failing when nothing numeric is present. Pure and deterministic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const INPUT_KEYS: &[&str] = &[
    "tokensInput",
    "prompt_tokens",
    "input_tokens",
    "promptTokenCount",
];
const OUTPUT_KEYS: &[&str] = &[
    "tokensOutput",
    "completion_tokens",
    "output_tokens",
    "candidatesTokenCount",
];
const TOTAL_KEYS: &[&str] = &["tokensTotal", "total_tokens", "totalTokenCount"];

/// Linear per-token pricing in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRates {
    pub input_usd_per_token: f64,
    pub output_usd_per_token: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        // $0.10 / 1M input, $0.40 / 1M output
        Self {
            input_usd_per_token: 0.000_000_1,
            output_usd_per_token: 0.000_000_4,
        }
    }
}

/// Token counts reported for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Result of estimating a single call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tokens_total: u64,
    pub cost_estimate_usd: f64,
}

impl CostEstimate {
    pub fn usage(&self) -> Usage {
        Usage {
            tokens_in: self.tokens_input,
            tokens_out: self.tokens_output,
        }
    }
}

/// Estimate tokens and cost from an opaque usage object.
///
/// Returns `None` when `usage` is absent, not an object, or carries neither an input nor an
/// output count. A provided total wins over `input + output`.
pub fn estimate_cost(usage: Option<&Value>, rates: &CostRates) -> Option<CostEstimate> {
    let obj = usage?.as_object()?;
    let input = first_count(obj, INPUT_KEYS);
    let output = first_count(obj, OUTPUT_KEYS);
    if input.is_none() && output.is_none() {
        return None;
    }
    let tokens_input = input.unwrap_or(0);
    let tokens_output = output.unwrap_or(0);
    let tokens_total = first_count(obj, TOTAL_KEYS)
        .unwrap_or_else(|| tokens_input.saturating_add(tokens_output));
    let cost_estimate_usd = tokens_input as f64 * rates.input_usd_per_token
        + tokens_output as f64 * rates.output_usd_per_token;
    Some(CostEstimate {
        tokens_input,
        tokens_output,
        tokens_total,
        cost_estimate_usd,
    })
}

fn first_count(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    })
}
