//! Router, shared state and handlers.

use crate::review::LoggingReviewQueue;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tale_core::{
    BudgetGuard, BudgetState, BudgetStore, ContentItem, CostEstimate, GenerativeProvider,
    ResilientInvoker, ResponseCache, Stage, TaleConfig, TaleError, TaleResult, TextRequest,
    Usage, VerificationPipeline, VerificationResult,
};
use tracing::info;

pub struct AppState {
    pub invoker: Arc<ResilientInvoker>,
    pub pipeline: VerificationPipeline,
    pub budget: Arc<dyn BudgetStore>,
}

impl AppState {
    /// Wire the core from configuration around `provider`.
    pub fn build(config: &TaleConfig, provider: Arc<dyn GenerativeProvider>) -> TaleResult<Self> {
        let kv = config.store.open()?;
        let guard = Arc::new(BudgetGuard::new(Arc::clone(&kv), config.guard.clone()));
        let cache = ResponseCache::new(kv, config.invoker.cache_namespace.clone());
        let invoker = Arc::new(ResilientInvoker::new(
            provider,
            guard.clone(),
            cache,
            config.rates,
            config.invoker.clone(),
        ));
        let pipeline = VerificationPipeline::new(
            Arc::clone(&invoker),
            Arc::new(LoggingReviewQueue),
            config.verification.clone(),
        );
        Ok(Self {
            invoker,
            pipeline,
            budget: guard,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/story", post(story_handler))
        .route("/api/v1/story/stream", post(story_stream_handler))
        .route("/api/v1/moments/verify", post(verify_handler))
        .route("/api/v1/finops/circuit", get(circuit_status_handler))
        .route("/api/v1/finops/circuit/reset", post(circuit_reset_handler))
        .with_state(state)
        .layer(axum::middleware::from_fn(log_request))
}

async fn log_request(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let response = next.run(request).await;
    info!(%method, %path, status = response.status().as_u16(), "request");
    response
}

/// Core error as an HTTP response. Budget and circuit rejections are "try again later".
pub struct ApiError(pub TaleError);

impl From<TaleError> for ApiError {
    fn from(err: TaleError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    retry_later: bool,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TaleError::BudgetExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            TaleError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TaleError::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            TaleError::Provider(_) | TaleError::SchemaValidation(_) => StatusCode::BAD_GATEWAY,
            TaleError::Store(_) | TaleError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            retry_later: self.0.is_policy_rejection(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRequest {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl StoryRequest {
    fn into_text_request(self) -> TextRequest {
        let mut req = TextRequest::new(self.prompt);
        req.system = self.system;
        req.temperature = self.temperature;
        req.max_tokens = self.max_tokens;
        req
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryResponse {
    pub story: String,
    pub usage: Usage,
    pub cost: Option<CostEstimate>,
    pub cached: bool,
}

async fn story_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StoryRequest>,
) -> Result<Json<StoryResponse>, ApiError> {
    let out = state
        .invoker
        .invoke_text("story", body.into_text_request())
        .await?;
    Ok(Json(StoryResponse {
        story: out.payload,
        usage: out.usage,
        cost: out.cost,
        cached: out.cached,
    }))
}

/// Chunks as `data:` events; a mid-stream failure becomes one `error` event and ends the stream.
async fn story_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StoryRequest>,
) -> Result<Response, ApiError> {
    let chunks = state
        .invoker
        .invoke_streamed(body.into_text_request())
        .await?;
    let events = chunks
        .scan(false, |failed, item| {
            if *failed {
                return futures_util::future::ready(None);
            }
            let event = match item {
                Ok(text) => Event::default().data(text),
                Err(e) => {
                    *failed = true;
                    Event::default().event("error").data(e.to_string())
                }
            };
            futures_util::future::ready(Some(Ok::<_, Infallible>(event)))
        });
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Always 200. A body that is not a content item at all is rejected at the RULE stage.
async fn verify_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ContentItem>, JsonRejection>,
) -> Json<VerificationResult> {
    match payload {
        Ok(Json(item)) => Json(state.pipeline.verify(&item).await),
        Err(rejection) => {
            let reason = format!("Malformed content item: {}", rejection.body_text());
            info!(target: "tale::verify", %reason, "rejected at RULE");
            Json(VerificationResult {
                approved: false,
                stage: Stage::Rule,
                reason,
                confidence: 1.0,
            })
        }
    }
}

async fn circuit_status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BudgetState>, ApiError> {
    Ok(Json(state.budget.snapshot().await?))
}

async fn circuit_reset_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BudgetState>, ApiError> {
    state.budget.reset().await?;
    Ok(Json(state.budget.snapshot().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tale_core::{LiveGrant, LiveOptions, ProviderResponse, TextStream};
    use tower::ServiceExt;

    struct StubProvider {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl GenerativeProvider for StubProvider {
        async fn generate_text(&self, req: &TextRequest) -> TaleResult<ProviderResponse<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TaleError::Provider("upstream 500".into()));
            }
            Ok(ProviderResponse {
                payload: format!("A tale about {}", req.prompt),
                usage: Some(json!({ "prompt_tokens": 12, "completion_tokens": 30 })),
            })
        }

        async fn generate_structured(
            &self,
            _req: &TextRequest,
            _schema: &Value,
        ) -> TaleResult<ProviderResponse<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderResponse {
                payload: json!({ "approved": true, "reason": "gentle", "confidence": 0.92 }),
                usage: None,
            })
        }

        async fn generate_streamed(&self, _req: &TextRequest) -> TaleResult<TextStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let chunks: Vec<TaleResult<String>> = vec![Ok("Once ".into()), Ok("upon".into())];
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }

        async fn start_live_session(&self, _options: &LiveOptions) -> TaleResult<LiveGrant> {
            Err(TaleError::Provider("not here".into()))
        }
    }

    fn app(fail: bool) -> (Router, Arc<AppState>) {
        let provider = Arc::new(StubProvider {
            calls: AtomicUsize::new(0),
            fail,
        });
        let state = Arc::new(AppState::build(&TaleConfig::default(), provider).unwrap());
        (router(Arc::clone(&state)), state)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _) = app(false);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn story_returns_text_and_usage() {
        let (app, _) = app(false);
        let resp = app
            .oneshot(post_json("/api/v1/story", json!({ "prompt": "a brave snail" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["story"], "A tale about a brave snail");
        assert_eq!(body["usage"]["tokensIn"], 12);
        assert_eq!(body["cached"], false);
    }

    #[tokio::test]
    async fn open_circuit_maps_to_retry_later() {
        let (app, state) = app(true);
        for _ in 0..5 {
            let resp = app
                .clone()
                .oneshot(post_json("/api/v1/story", json!({ "prompt": "x" })))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        }
        let resp = app
            .clone()
            .oneshot(post_json("/api/v1/story", json!({ "prompt": "x" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["retryLater"], true);
        assert!(state.budget.snapshot().await.unwrap().is_open);

        let resp = app
            .oneshot(post_json("/api/v1/finops/circuit/reset", json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["isOpen"], false);
    }

    #[tokio::test]
    async fn verify_always_answers_with_a_result() {
        let (app, _) = app(false);
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/v1/moments/verify",
                json!({ "kind": "golden_moment", "description": "short", "payload": { "storyId": "s" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["approved"], false);
        assert_eq!(body["stage"], "RULE");

        let resp = app
            .oneshot(post_json(
                "/api/v1/moments/verify",
                json!({
                    "kind": "golden_moment",
                    "description": "The owl taught the moon to sing",
                    "payload": { "storyId": "s" }
                }),
            ))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["approved"], true);
        assert_eq!(body["stage"], "MODEL");
    }

    #[tokio::test]
    async fn incomplete_moment_still_gets_a_rule_verdict() {
        let (app, state) = app(false);
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/v1/moments/verify",
                json!({ "kind": "golden_moment", "payload": { "storyId": "s" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["approved"], false);
        assert_eq!(body["stage"], "RULE");
        assert_eq!(body["confidence"], 1.0);

        let resp = app
            .oneshot(post_json("/api/v1/moments/verify", json!({ "description": "no kind here" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["stage"], "RULE");
        assert_eq!(body["approved"], false);
        assert_eq!(state.budget.snapshot().await.unwrap().total_tokens_used, 0);
    }

    #[tokio::test]
    async fn stream_emits_sse_chunks() {
        let (app, _) = app(false);
        let resp = app
            .oneshot(post_json("/api/v1/story/stream", json!({ "prompt": "x" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("data: Once "));
        assert!(text.contains("data: upon"));
    }

    #[tokio::test]
    async fn circuit_status_starts_closed() {
        let (app, _) = app(false);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/finops/circuit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["isOpen"], false);
        assert_eq!(body["failureCount"], 0);
    }
}
