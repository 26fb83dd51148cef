//! Generative-provider port.
//!
//! The core never talks to a model backend directly; everything goes through this trait so the
//! invoker and the verification gate can be exercised against fakes.

use crate::error::TaleResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Lazy, finite, non-restartable sequence of text chunks.
pub type TextStream = BoxStream<'static, TaleResult<String>>;

/// One generation request. Caller-owned and short-lived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Overrides the invoker's default timeout.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl TextRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Text the cache key is derived from.
    pub fn cache_text(&self) -> String {
        match &self.system {
            Some(system) => format!("{}\n{}", system, self.prompt),
            None => self.prompt.clone(),
        }
    }
}

/// Raw provider output plus its opaque usage metadata.
#[derive(Debug, Clone)]
pub struct ProviderResponse<T> {
    pub payload: T,
    pub usage: Option<Value>,
}

/// Options forwarded to the trusted backend when asking for a live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveOptions {
    pub session_id: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
}

/// Server-issued connection material for one live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveGrant {
    /// Transport endpoint (ws:// or wss://).
    pub url: String,
    /// Short-lived, single-connection ticket.
    pub ticket: String,
    /// Opaque provider configuration sent verbatim in the `setup` envelope.
    #[serde(default)]
    pub setup: Value,
}

#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    async fn generate_text(&self, req: &TextRequest) -> TaleResult<ProviderResponse<String>>;

    /// Structured generation. Returns the parsed JSON value, unvalidated; a reply that is not
    /// JSON comes back as `Value::String` so the caller's validator rejects it.
    async fn generate_structured(
        &self,
        req: &TextRequest,
        schema: &Value,
    ) -> TaleResult<ProviderResponse<Value>>;

    async fn generate_streamed(&self, req: &TextRequest) -> TaleResult<TextStream>;

    async fn start_live_session(&self, options: &LiveOptions) -> TaleResult<LiveGrant>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_text_includes_system_prompt() {
        let bare = TextRequest::new("a fox");
        let framed = TextRequest::new("a fox").with_system("be brief");
        assert_eq!(bare.cache_text(), "a fox");
        assert_eq!(framed.cache_text(), "be brief\na fox");
    }

    #[test]
    fn grant_tolerates_missing_setup() {
        let grant: LiveGrant =
            serde_json::from_str(r#"{"url":"wss://x","ticket":"t1"}"#).unwrap();
        assert!(grant.setup.is_null());
    }
}
