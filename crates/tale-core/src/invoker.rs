//! **Resilient Invoker**: one provider call with cache, budget pre-check, timeout race and
//! cost recording.
//!
//! Order per call: cache lookup → budget check → provider call raced against a timer →
//! accounting → write-through. A cache hit touches neither the guard nor the provider.
//! Errors are never retried here; retry policy belongs to the caller.

use crate::cache::{cache_key, ResponseCache};
use crate::error::{TaleError, TaleResult};
use crate::finops::{estimate_cost, CostEstimate, CostRates, Usage};
use crate::guard::{BudgetStore, Outcome};
use crate::provider::{GenerativeProvider, TextRequest, TextStream};
use crate::validate::Validator;
use futures_util::StreamExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    /// Used when the request carries no timeout of its own.
    pub default_timeout_ms: u64,
    pub cache_ttl_secs: u64,
    pub cache_namespace: String,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            cache_ttl_secs: 30 * 60,
            cache_namespace: "tale:cache".to_string(),
        }
    }
}

impl InvokerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Result of a mediated call, returned by value.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation<T> {
    pub payload: T,
    pub usage: Usage,
    pub cost: Option<CostEstimate>,
    /// Served from the response cache; nothing was accounted.
    pub cached: bool,
}

impl<T> Invocation<T> {
    fn from_cache(payload: T) -> Self {
        Self {
            payload,
            usage: Usage::default(),
            cost: None,
            cached: true,
        }
    }
}

pub struct ResilientInvoker {
    provider: Arc<dyn GenerativeProvider>,
    budget: Arc<dyn BudgetStore>,
    cache: ResponseCache,
    rates: CostRates,
    config: InvokerConfig,
}

impl ResilientInvoker {
    pub fn new(
        provider: Arc<dyn GenerativeProvider>,
        budget: Arc<dyn BudgetStore>,
        cache: ResponseCache,
        rates: CostRates,
        config: InvokerConfig,
    ) -> Self {
        Self {
            provider,
            budget,
            cache,
            rates,
            config,
        }
    }

    pub fn budget(&self) -> &Arc<dyn BudgetStore> {
        &self.budget
    }

    /// Free-text generation, cached under `operation`.
    pub async fn invoke_text(
        &self,
        operation: &str,
        req: TextRequest,
    ) -> TaleResult<Invocation<String>> {
        let key = cache_key(operation, &req.cache_text());
        if let Some(payload) = self.cache.get::<String>(&key).await {
            return Ok(Invocation::from_cache(payload));
        }

        self.budget.check_and_maybe_open().await?;
        let response = self
            .race(operation, &req, self.provider.generate_text(&req))
            .await?;
        let cost = self.account(response.usage.as_ref()).await;

        self.cache
            .set(&key, &response.payload, self.config.cache_ttl())
            .await;
        Ok(Invocation {
            payload: response.payload,
            usage: cost.map(|c| c.usage()).unwrap_or_default(),
            cost,
            cached: false,
        })
    }

    /// Structured generation checked by `validator`.
    ///
    /// The provider call is accounted as a success before validation: tokens were spent either
    /// way. A validation failure is terminal for the call, is not cached and does not count
    /// against the breaker.
    pub async fn invoke_structured<T>(
        &self,
        operation: &str,
        req: TextRequest,
        validator: &dyn Validator<T>,
    ) -> TaleResult<Invocation<T>>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        let key = cache_key(operation, &req.cache_text());
        if let Some(payload) = self.cache.get::<T>(&key).await {
            return Ok(Invocation::from_cache(payload));
        }

        self.budget.check_and_maybe_open().await?;
        let schema: Value = validator.schema();
        let response = self
            .race(operation, &req, self.provider.generate_structured(&req, &schema))
            .await?;
        let cost = self.account(response.usage.as_ref()).await;

        let payload = validator.validate(response.payload).map_err(|e| {
            warn!(target: "tale::invoker", operation, "structured reply rejected: {}", e);
            e
        })?;

        self.cache.set(&key, &payload, self.config.cache_ttl()).await;
        Ok(Invocation {
            payload,
            usage: cost.map(|c| c.usage()).unwrap_or_default(),
            cost,
            cached: false,
        })
    }

    /// Streamed generation. The timeout bounds stream establishment; the stream records a
    /// failure before yielding its first error item, and a success once it is exhausted cleanly.
    /// A stream dropped early by the consumer records nothing. Not cached.
    pub async fn invoke_streamed(&self, req: TextRequest) -> TaleResult<TextStream> {
        self.budget.check_and_maybe_open().await?;
        let mut inner = self
            .race("stream", &req, self.provider.generate_streamed(&req))
            .await?;

        let budget = Arc::clone(&self.budget);
        let stream = async_stream::stream! {
            let mut failure = None;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(chunk) => yield Ok(chunk),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            match failure {
                Some(e) => {
                    warn!(target: "tale::invoker", "stream failed: {}", e);
                    budget.record_outcome(Outcome::Failure).await;
                    yield Err(e);
                }
                None => {
                    budget
                        .record_outcome(Outcome::Success { tokens: 0, cost_usd: 0.0 })
                        .await;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Race `call` against the timeout. The timer lives inside the `Timeout` future and is
    /// dropped on every exit path. Any failure is recorded, then returned unmodified.
    async fn race<T, F>(&self, operation: &str, req: &TextRequest, call: F) -> TaleResult<T>
    where
        F: Future<Output = TaleResult<T>>,
    {
        let limit = req.timeout.unwrap_or_else(|| self.config.default_timeout());
        let result = match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(TaleError::ProviderTimeout(limit)),
        };
        if let Err(e) = &result {
            warn!(target: "tale::invoker", operation, "provider call failed: {}", e);
            self.budget.record_outcome(Outcome::Failure).await;
        }
        result
    }

    async fn account(&self, usage: Option<&Value>) -> Option<CostEstimate> {
        let estimate = estimate_cost(usage, &self.rates);
        if estimate.is_none() {
            debug!(target: "tale::invoker", "provider reported no usage");
        }
        let (tokens, cost_usd) = estimate
            .map(|e| (e.tokens_total, e.cost_estimate_usd))
            .unwrap_or((0, 0.0));
        self.budget
            .record_outcome(Outcome::Success { tokens, cost_usd })
            .await;
        estimate
    }
}
