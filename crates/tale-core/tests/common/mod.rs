//! Fakes shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tale_core::{
    BudgetGuard, GenerativeProvider, GuardConfig, InvokerConfig, LiveGrant, LiveOptions,
    MemoryKv, ProviderResponse, ResilientInvoker, ResponseCache, ReviewQueue, ReviewRequest,
    TaleError, TaleResult, TextRequest, TextStream, CostRates,
};

/// How the fake provider answers every call.
#[derive(Clone)]
pub enum Behavior {
    Reply { text: String, usage: Option<Value> },
    Structured { value: Value, usage: Option<Value> },
    Fail(String),
    Hang,
    Stream(Vec<Result<String, String>>),
}

pub struct FakeProvider {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn reply(text: &str, tokens_in: u64, tokens_out: u64) -> Arc<Self> {
        Self::new(Behavior::Reply {
            text: text.to_string(),
            usage: Some(json!({ "tokensInput": tokens_in, "tokensOutput": tokens_out })),
        })
    }

    pub fn verdict(approved: bool, confidence: f64) -> Arc<Self> {
        Self::new(Behavior::Structured {
            value: json!({ "approved": approved, "reason": "looks fine", "confidence": confidence }),
            usage: Some(json!({ "prompt_tokens": 40, "completion_tokens": 10 })),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn current(&self) -> Behavior {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.behavior.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerativeProvider for FakeProvider {
    async fn generate_text(&self, _req: &TextRequest) -> TaleResult<ProviderResponse<String>> {
        match self.current() {
            Behavior::Reply { text, usage } => Ok(ProviderResponse { payload: text, usage }),
            Behavior::Structured { value, usage } => Ok(ProviderResponse {
                payload: value.to_string(),
                usage,
            }),
            Behavior::Fail(msg) => Err(TaleError::Provider(msg)),
            Behavior::Hang => std::future::pending().await,
            Behavior::Stream(_) => Err(TaleError::Provider("stream-only fake".into())),
        }
    }

    async fn generate_structured(
        &self,
        _req: &TextRequest,
        _schema: &Value,
    ) -> TaleResult<ProviderResponse<Value>> {
        match self.current() {
            Behavior::Structured { value, usage } => Ok(ProviderResponse { payload: value, usage }),
            Behavior::Reply { text, usage } => Ok(ProviderResponse {
                payload: Value::String(text),
                usage,
            }),
            Behavior::Fail(msg) => Err(TaleError::Provider(msg)),
            Behavior::Hang => std::future::pending().await,
            Behavior::Stream(_) => Err(TaleError::Provider("stream-only fake".into())),
        }
    }

    async fn generate_streamed(&self, _req: &TextRequest) -> TaleResult<TextStream> {
        match self.current() {
            Behavior::Stream(items) => {
                let items: Vec<TaleResult<String>> = items
                    .into_iter()
                    .map(|r| r.map_err(TaleError::Provider))
                    .collect();
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
            Behavior::Fail(msg) => Err(TaleError::Provider(msg)),
            Behavior::Hang => std::future::pending().await,
            _ => Err(TaleError::Provider("not a stream fake".into())),
        }
    }

    async fn start_live_session(&self, options: &LiveOptions) -> TaleResult<LiveGrant> {
        Ok(LiveGrant {
            url: "ws://localhost/live".into(),
            ticket: format!("ticket-for-{}", options.session_id),
            setup: json!({}),
        })
    }
}

/// Queue that records everything it is given.
#[derive(Default)]
pub struct RecordingQueue {
    pub items: Mutex<Vec<ReviewRequest>>,
}

impl RecordingQueue {
    pub fn count(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[async_trait]
impl ReviewQueue for RecordingQueue {
    async fn enqueue(&self, request: ReviewRequest) -> Result<(), String> {
        self.items.lock().unwrap().push(request);
        Ok(())
    }
}

pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub guard: Arc<BudgetGuard>,
    pub invoker: Arc<ResilientInvoker>,
}

pub fn harness(provider: Arc<FakeProvider>, guard_config: GuardConfig) -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let guard = Arc::new(BudgetGuard::new(kv.clone(), guard_config));
    let cache = ResponseCache::new(kv, "test:cache");
    let invoker = Arc::new(ResilientInvoker::new(
        provider.clone(),
        guard.clone(),
        cache,
        CostRates {
            input_usd_per_token: 0.000_001,
            output_usd_per_token: 0.000_002,
        },
        InvokerConfig {
            default_timeout_ms: 2_000,
            ..Default::default()
        },
    ));
    Harness {
        provider,
        guard,
        invoker,
    }
}
