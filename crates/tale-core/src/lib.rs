//! # tale-core: provider mediation for the storytelling app
//!
//! Every call to the generative provider goes through this crate.
//!
//! ```text
//!   caller ──► ResilientInvoker ──► ResponseCache (hit: return, no accounting)
//!                   │
//!                   ├──► BudgetGuard.check      (CircuitOpen / BudgetExceeded)
//!                   ├──► provider ⟷ timer      (ProviderTimeout)
//!                   └──► FinOps estimate ──► BudgetGuard.record
//!
//!   VerificationPipeline: RULE ──► MODEL (via invoker) ──► HUMAN queue
//! ```
//!
//! Breaker and cache state sit behind the `KvStore` port so several processes can share them.

pub mod cache;
pub mod config;
pub mod error;
pub mod finops;
pub mod guard;
pub mod invoker;
pub mod kv;
pub mod openrouter;
pub mod provider;
pub mod validate;
pub mod verify;

pub use cache::{cache_key, prompt_hash, ResponseCache, DEFAULT_CACHE_TTL};
pub use config::{StoreBackend, StoreConfig, TaleConfig};
pub use error::{BudgetReason, TaleError, TaleResult};
pub use finops::{estimate_cost, CostEstimate, CostRates, Usage};
pub use guard::{BudgetGuard, BudgetState, BudgetStore, GuardConfig, Outcome};
pub use invoker::{Invocation, InvokerConfig, ResilientInvoker};
pub use kv::{KvStore, MemoryKv, SledKv};
pub use openrouter::{OpenRouterProvider, ProviderConfig};
pub use provider::{
    GenerativeProvider, LiveGrant, LiveOptions, ProviderResponse, TextRequest, TextStream,
};
pub use validate::{SerdeValidator, Validator};
pub use verify::{
    verdict_validator, ContentItem, ContentKind, ModelVerdict, ReviewQueue, ReviewRequest, Stage,
    VerificationConfig, VerificationPipeline, VerificationResult,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
