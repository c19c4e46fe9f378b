//! ACP (Agent Client Protocol) JSON-RPC frames, spoken by Gemini and OpenCode.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::permission::{Decision, PermissionOutcome};

pub const METHOD_SESSION_UPDATE: &str = "session/update";
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_SESSION_NEW: &str = "session/new";
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";

/// ACP wire version this bridge speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// One JSON-RPC frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AcpFrame {
    Request {
        id: Value,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: Value,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    },
}

/// `session/update` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub update: SessionUpdate,
}

/// Update payload, tagged by `sessionUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageChunk { content: AcpContent },
    AgentThoughtChunk { content: AcpContent },
    ToolCall(AcpToolCall),
    ToolCallUpdate(AcpToolCall),
    #[serde(other)]
    Other,
}

/// Content block inside a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcpContent {
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Tool call as reported in `tool_call`, `tool_call_update` and permission
/// requests. Every field except the id may be absent on updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcpToolCall {
    pub tool_call_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub raw_input: Option<Value>,
    #[serde(default)]
    pub raw_output: Option<Value>,
    #[serde(default)]
    pub content: Option<Value>,
}

/// `session/request_permission` params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    #[serde(default)]
    pub session_id: Option<String>,
    pub tool_call: AcpToolCall,
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

/// A choice offered by the agent for a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    #[serde(default)]
    pub name: String,
    pub kind: String,
}

/// Build a JSON-RPC request.
#[must_use]
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

/// Build a JSON-RPC notification.
#[must_use]
pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

/// `initialize` params.
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {"fs": {"readTextFile": false, "writeTextFile": false}}
    })
}

/// `session/new` params.
#[must_use]
pub fn new_session_params(cwd: &str) -> Value {
    json!({"cwd": cwd, "mcpServers": []})
}

/// `session/prompt` params.
#[must_use]
pub fn prompt_params(session_id: &str, text: &str) -> Value {
    json!({"sessionId": session_id, "prompt": [{"type": "text", "text": text}]})
}

/// Answer a permission request by picking the option matching the outcome.
///
/// Aborts answer with a cancelled outcome. When the agent did not offer an
/// option of the wanted kind, the closest allow/reject option is used.
#[must_use]
pub fn permission_reply(id: &Value, options: &[PermissionOption], outcome: &PermissionOutcome) -> Value {
    let preferred: &[&str] = match outcome.decision() {
        Decision::Approved => &["allow_once", "allow_always"],
        Decision::ApprovedForSession => &["allow_always", "allow_once"],
        Decision::Denied => &["reject_once", "reject_always"],
        Decision::Abort => {
            return json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"outcome": {"outcome": "cancelled"}}
            });
        }
    };

    let option_id = preferred
        .iter()
        .find_map(|kind| options.iter().find(|o| o.kind == *kind))
        .map_or_else(|| preferred[0].to_string(), |o| o.option_id.clone());

    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {"outcome": {"outcome": "selected", "optionId": option_id}}
    })
}
