//! OpenRouter adapter for the generative-provider port.
//!
//! OpenAI-compatible `/chat/completions`: plain text, JSON-object mode for structured output,
//! and SSE streaming. Live sessions are not an OpenRouter feature; `start_live_session`
//! delegates to the trusted ticket endpoint configured in `ProviderConfig::live_ticket_url`.

use crate::error::{TaleError, TaleResult};
use crate::provider::{
    GenerativeProvider, LiveGrant, LiveOptions, ProviderResponse, TextRequest, TextStream,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "google/gemini-2.0-flash-001";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    /// Trusted backend that issues live-session tickets.
    pub live_ticket_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: OPENROUTER_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            live_ticket_url: None,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenRouterProvider {
    api_key: String,
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenRouterProvider {
    pub fn new(api_key: impl Into<String>, config: ProviderConfig) -> TaleResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            api_key: api_key.into().trim().to_string(),
            config,
            client,
        })
    }

    /// Key from `TALE_API_KEY`, falling back to `OPENROUTER_API_KEY`. `None` if unset or blank.
    pub fn api_key_from_env() -> Option<String> {
        std::env::var("TALE_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    fn body<'a>(&'a self, req: &TextRequest, system_extra: Option<String>) -> ChatRequest<'a> {
        let system = match (req.system.as_deref(), system_extra) {
            (Some(s), Some(extra)) => Some(format!("{}\n\n{}", s, extra)),
            (Some(s), None) => Some(s.to_string()),
            (None, extra) => extra,
        };
        let mut messages = Vec::with_capacity(2);
        if let Some(content) = system {
            messages.push(ChatMessage {
                role: "system",
                content,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: req.prompt.clone(),
        });
        ChatRequest {
            model: &self.config.model,
            messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: None,
            stream: false,
        }
    }

    async fn complete(&self, body: &ChatRequest<'_>) -> TaleResult<(String, Option<Value>)> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Tale")
            .json(body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(TaleError::Provider(format!("OpenRouter API error {}: {}", status, text)));
        }
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| TaleError::Provider(format!("OpenRouter response parse failed: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TaleError::Provider("OpenRouter returned no choices".to_string()))?;
        Ok((content, parsed.usage))
    }
}

/// Strip a Markdown code fence some models wrap JSON in.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Content delta of one SSE `data:` payload.
fn sse_delta(data: &str) -> Option<String> {
    let v: Value = serde_json::from_str(data).ok()?;
    v.pointer("/choices/0/delta/content")?
        .as_str()
        .map(str::to_string)
}

/// Bytes from the SSE body, released one complete line at a time. Network chunks may split a
/// multi-byte character, so decoding waits for the terminating `\n`.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(match String::from_utf8(line) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }
}

#[async_trait]
impl GenerativeProvider for OpenRouterProvider {
    async fn generate_text(&self, req: &TextRequest) -> TaleResult<ProviderResponse<String>> {
        let (payload, usage) = self.complete(&self.body(req, None)).await?;
        Ok(ProviderResponse { payload, usage })
    }

    async fn generate_structured(
        &self,
        req: &TextRequest,
        schema: &Value,
    ) -> TaleResult<ProviderResponse<Value>> {
        let mut body = self.body(
            req,
            Some(format!(
                "Respond only with a JSON object matching this JSON schema:\n{}",
                schema
            )),
        );
        body.response_format = Some(serde_json::json!({ "type": "json_object" }));
        let (raw, usage) = self.complete(&body).await?;
        let payload = serde_json::from_str(strip_fence(&raw)).unwrap_or(Value::String(raw));
        Ok(ProviderResponse { payload, usage })
    }

    async fn generate_streamed(&self, req: &TextRequest) -> TaleResult<TextStream> {
        let mut body = self.body(req, None);
        body.stream = true;
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(TaleError::Provider(format!("OpenRouter API error {}: {}", status, text)));
        }

        let mut bytes = res.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut lines = LineBuffer::default();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(TaleError::from)?;
                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'read;
                    }
                    if let Some(delta) = sse_delta(data).filter(|d| !d.is_empty()) {
                        yield delta;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn start_live_session(&self, options: &LiveOptions) -> TaleResult<LiveGrant> {
        let url = self
            .config
            .live_ticket_url
            .as_deref()
            .ok_or_else(|| TaleError::Provider("live sessions are not configured".to_string()))?;
        debug!(target: "tale::invoker", session_id = %options.session_id, "requesting live ticket");
        let res = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(options)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(TaleError::Provider(format!(
                "live ticket request failed: {}",
                res.status()
            )));
        }
        res.json::<LiveGrant>()
            .await
            .map_err(|e| TaleError::Provider(format!("live ticket parse failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_code_fences() {
        assert_eq!(strip_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn reads_sse_deltas() {
        let data = r#"{"choices":[{"delta":{"content":"Once"}}]}"#;
        assert_eq!(sse_delta(data).as_deref(), Some("Once"));
        assert_eq!(sse_delta(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(sse_delta("garbage"), None);
    }

    #[test]
    fn line_buffer_keeps_characters_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut lines = LineBuffer::default();
        lines.push(&line[..split]);
        assert_eq!(lines.next_line(), None);
        lines.push(&line[split..]);
        let got = lines.next_line().unwrap();
        let data = got.trim().strip_prefix("data:").unwrap().trim();
        assert_eq!(sse_delta(data).as_deref(), Some("café"));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn line_buffer_holds_partial_line_until_newline() {
        let mut lines = LineBuffer::default();
        lines.push(b"data: a\ndata: ");
        assert_eq!(lines.next_line().as_deref(), Some("data: a\n"));
        assert_eq!(lines.next_line(), None);
        lines.push(b"b\n");
        assert_eq!(lines.next_line().as_deref(), Some("data: b\n"));
    }

    #[test]
    fn body_merges_system_prompts() {
        let p = OpenRouterProvider::new("k", ProviderConfig::default()).unwrap();
        let req = TextRequest::new("tell a story").with_system("be kind");
        let body = p.body(&req, Some("json only".to_string()));
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].content, "be kind\n\njson only");
        assert_eq!(body.messages[1].role, "user");
    }
}
