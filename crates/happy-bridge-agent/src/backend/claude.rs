//! Claude Code stream-json messages.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::permission::{PermissionMode, PermissionOutcome};

/// Message read from Claude's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: ClaudeContent,
    },
    User {
        message: ClaudeContent,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },
    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },
    ControlResponse {
        #[serde(default)]
        response: Value,
    },
    #[serde(other)]
    Other,
}

/// Message body carrying content blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaudeContent {
    #[serde(default)]
    pub content: MessageContent,
}

/// Content is either a bare string or a list of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

/// One content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

/// Control request issued by Claude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    HookCallback {
        callback_id: String,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// A user turn written to Claude's stdin.
#[must_use]
pub fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": {"role": "user", "content": text}
    })
}

/// Answer to a `can_use_tool` control request.
#[must_use]
pub fn permission_reply(request_id: &str, outcome: &PermissionOutcome) -> Value {
    let verdict = match outcome {
        PermissionOutcome::Approved { input, .. } => json!({
            "behavior": "allow",
            "updatedInput": input,
        }),
        PermissionOutcome::Denied { reason } => json!({
            "behavior": "deny",
            "message": reason.as_deref().unwrap_or("Permission denied by user"),
        }),
        PermissionOutcome::Aborted { reason } => json!({
            "behavior": "deny",
            "message": reason.as_deref().unwrap_or("Aborted by user"),
            "interrupt": true,
        }),
    };
    success_reply(request_id, verdict)
}

/// Answer to a hook callback: defer to the regular permission prompt.
#[must_use]
pub fn hook_reply(request_id: &str, callback_id: &str) -> Value {
    success_reply(
        request_id,
        json!({
            "hookSpecificOutput": {
                "hookEventName": "PreToolUse",
                "permissionDecision": "ask",
                "permissionDecisionReason": format!("Forwarding {callback_id} to remote approval"),
            }
        }),
    )
}

/// Answer to a control request this bridge does not implement.
#[must_use]
pub fn error_reply(request_id: &str, error: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {"subtype": "error", "request_id": request_id, "error": error}
    })
}

fn success_reply(request_id: &str, response: Value) -> Value {
    json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": request_id, "response": response}
    })
}

/// Interrupt the current turn.
#[must_use]
pub fn interrupt_request(request_id: &str) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": {"subtype": "interrupt"}
    })
}

/// Switch Claude's own permission mode.
#[must_use]
pub fn set_permission_mode_request(request_id: &str, mode: PermissionMode) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": {"subtype": "set_permission_mode", "mode": mode.claude_mode()}
    })
}
