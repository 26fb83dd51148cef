//! Blind tool relay: tool calls from the live model are forwarded to a trusted backend and
//! never executed here.

use crate::error::{LiveError, LiveResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Body POSTed to the backend tool executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRelayRequest {
    pub tool_name: String,
    pub arguments: Value,
    pub session_id: String,
    pub trace_id: String,
    pub tool_call_id: String,
}

/// Backend reply: exactly one of `result` / `error` is expected.
#[derive(Debug, Default, Deserialize)]
struct ToolRelayReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl ToolRelayReply {
    fn into_result(self) -> LiveResult<Value> {
        match (self.error, self.result) {
            (Some(error), _) => Err(LiveError::ToolRelay(error_text(error))),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

fn error_text(error: Value) -> String {
    match error {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
pub trait ToolRelay: Send + Sync {
    /// Result value of the tool, or `LiveError::ToolRelay` carrying the backend's message.
    async fn relay(&self, request: &ToolRelayRequest) -> LiveResult<Value>;
}

/// The text placed in a `toolResponse` when relaying failed.
pub fn relay_error_text(error: &LiveError) -> String {
    match error {
        LiveError::ToolRelay(message) => message.clone(),
        other => other.to_string(),
    }
}

/// Relay over HTTP to the trusted backend.
pub struct HttpToolRelay {
    endpoint: String,
    bearer: Option<String>,
    client: reqwest::Client,
}

impl HttpToolRelay {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> LiveResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            bearer: None,
            client,
        })
    }

    /// Short-lived session credential for the backend, if it wants one.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

#[async_trait]
impl ToolRelay for HttpToolRelay {
    async fn relay(&self, request: &ToolRelayRequest) -> LiveResult<Value> {
        debug!(
            target: "tale::live",
            tool = %request.tool_name,
            tool_call_id = %request.tool_call_id,
            "relaying tool call"
        );
        let mut call = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.bearer {
            call = call.bearer_auth(token);
        }
        let res = call.send().await?;
        let status = res.status();
        let reply: ToolRelayReply = match res.json().await {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => {
                return Err(LiveError::ToolRelay(format!("tool backend returned {}", status)))
            }
            Err(e) => return Err(LiveError::ToolRelay(format!("unreadable tool reply: {}", e))),
        };
        if !status.is_success() && reply.error.is_none() {
            return Err(LiveError::ToolRelay(format!("tool backend returned {}", status)));
        }
        reply.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_keys() {
        let req = ToolRelayRequest {
            tool_name: "lookup_character".into(),
            arguments: json!({ "name": "Pip" }),
            session_id: "s".into(),
            trace_id: "t".into(),
            tool_call_id: "42".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["toolName"], "lookup_character");
        assert_eq!(v["toolCallId"], "42");
        assert_eq!(v["sessionId"], "s");
    }

    #[test]
    fn reply_error_wins_over_result() {
        let reply: ToolRelayReply = serde_json::from_value(json!({ "error": "boom" })).unwrap();
        let err = reply.into_result().unwrap_err();
        assert_eq!(relay_error_text(&err), "boom");

        let reply: ToolRelayReply =
            serde_json::from_value(json!({ "result": { "ok": true } })).unwrap();
        assert_eq!(reply.into_result().unwrap(), json!({ "ok": true }));
    }

    #[test]
    fn structured_errors_are_stringified() {
        let reply: ToolRelayReply =
            serde_json::from_value(json!({ "error": { "code": 7 } })).unwrap();
        assert_eq!(
            relay_error_text(&reply.into_result().unwrap_err()),
            r#"{"code":7}"#
        );
    }

    #[test]
    fn other_errors_use_display() {
        let err = LiveError::Transport("reset".into());
        assert_eq!(relay_error_text(&err), "Transport error: reset");
    }
}
