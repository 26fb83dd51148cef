//! Live wire protocol.
//!
//! Binary frames are raw PCM16 audio. Text frames are JSON envelopes keyed at the top level:
//!
//! | Direction | Key | Meaning |
//! |-----------|-----|---------|
//! | out | `setup` | server-issued config plus `sessionId` / `traceId`, first frame after open |
//! | out | `toolResponse.functionResponses[]` | relayed tool results, correlated by `id` |
//! | in | `setupComplete` | setup acknowledged |
//! | in | `serverContent.{interrupted,turnComplete,sleepDetection,modelTurn}` | playback control, inline audio |
//! | in | `toolCall.functionCalls[]` | tool calls to relay |
//!
//! The connection ticket travels as a subprotocol token next to the protocol tag, never in the
//! URL or a custom header.

use crate::error::{LiveError, LiveResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROTOCOL_TAG: &str = "tale.live.v1";
pub const TICKET_PREFIX: &str = "ticket.";

/// `Sec-WebSocket-Protocol` tokens for a ticket: the fixed tag, then `ticket.<value>`.
pub fn subprotocols(ticket: &str) -> LiveResult<Vec<String>> {
    let ticket = ticket.trim();
    if ticket.is_empty() {
        return Err(LiveError::Protocol("empty connection ticket".to_string()));
    }
    if !ticket.chars().all(is_token_char) {
        return Err(LiveError::Protocol(
            "connection ticket is not a valid subprotocol token".to_string(),
        ));
    }
    Ok(vec![
        PROTOCOL_TAG.to_string(),
        format!("{}{}", TICKET_PREFIX, ticket),
    ])
}

/// Server side of [`subprotocols`]: the ticket offered by a client, if any.
pub fn ticket_from_subprotocols<'a, I>(offered: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    offered
        .into_iter()
        .map(str::trim)
        .find_map(|p| p.strip_prefix(TICKET_PREFIX))
        .filter(|t| !t.is_empty())
}

// RFC 7230 tchar
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// First outbound frame: the server-issued setup object with session identifiers added.
pub fn setup_envelope(config: &Value, session_id: &str, trace_id: &str) -> LiveResult<String> {
    let mut setup = match config {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(LiveError::Protocol(format!(
                "setup config must be an object, got {}",
                other
            )))
        }
    };
    setup.insert("sessionId".to_string(), Value::String(session_id.to_string()));
    setup.insert("traceId".to_string(), Value::String(trace_id.to_string()));
    Ok(serde_json::to_string(&serde_json::json!({ "setup": setup }))?)
}

/// One inbound text envelope. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<ToolCall>,
}

impl ServerEnvelope {
    pub fn parse(text: &str) -> LiveResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub sleep_detection: Option<Value>,
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
}

impl ServerContent {
    /// `sleepDetection` counts when present and not `false`/`null`.
    pub fn sleep_signal(&self) -> Option<&Value> {
        self.sleep_detection
            .as_ref()
            .filter(|v| !matches!(v, Value::Null | Value::Bool(false)))
    }

    /// Base64 PCM16 payloads carried inline, in part order.
    pub fn inline_audio(&self) -> impl Iterator<Item = &str> {
        self.model_turn
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|data| {
                data.mime_type
                    .as_deref()
                    .map_or(true, |m| m.starts_with("audio/"))
            })
            .map(|data| data.data.as_str())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default, alias = "arguments")]
    pub args: Value,
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseEnvelope<'a> {
    tool_response: ToolResponse<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponse<'a> {
    function_responses: [FunctionResponse<'a>; 1],
}

#[derive(Debug, Serialize)]
struct FunctionResponse<'a> {
    id: &'a str,
    name: &'a str,
    response: ResponseBody,
}

#[derive(Debug, Serialize)]
struct ResponseBody {
    result: Value,
}

/// `toolResponse` frame for one call. A relay failure is carried as `{"error": ...}` inside
/// `result`; the remote agent decides how to recover.
pub fn tool_response_envelope(call: &FunctionCall, outcome: Result<Value, String>) -> LiveResult<String> {
    let result = match outcome {
        Ok(value) => value,
        Err(error) => serde_json::json!({ "error": error }),
    };
    let envelope = ToolResponseEnvelope {
        tool_response: ToolResponse {
            function_responses: [FunctionResponse {
                id: &call.id,
                name: &call.name,
                response: ResponseBody { result },
            }],
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}
