//! Canonical agent events produced by the agent bridge.
//!
//! Every backend is normalized into [`AgentEvent`] before anything leaves the
//! bridge. Backend-specific identifiers never appear here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Pending,
    Completed,
    Error,
}

/// A tool invocation reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub state: ToolCallState,
}

/// A permission prompt as seen by remote clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPrompt {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Normalized event stream of one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEvent {
    /// Assistant text (complete or chunk).
    Text { text: String },
    /// Reasoning text.
    Thinking { text: String },
    /// A tool call started or changed state.
    ToolCall(ToolCall),
    /// A tool produced output.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        output: Value,
        is_error: bool,
    },
    /// A tool is waiting on a permission decision.
    PermissionRequest(PermissionPrompt),
    /// The agent started working on a turn.
    TaskStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// The agent finished a turn.
    TaskComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// The current turn was aborted.
    TurnAborted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Token accounting, passed through as reported.
    TokenCount { usage: Value },
    /// The agent reported its own session identifier (used for resume).
    #[serde(rename_all = "camelCase")]
    AgentSession { agent_session_id: String },
}

impl AgentEvent {
    /// Tool call id this event refers to, if any.
    #[must_use]
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall(call) => Some(&call.tool_call_id),
            Self::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            Self::PermissionRequest(prompt) => Some(&prompt.tool_call_id),
            _ => None,
        }
    }
}

/// Plaintext of a session message, encrypted into an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageRecord {
    /// A message typed by a user on a remote client.
    User {
        content: UserContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    /// A normalized agent event.
    Agent { content: AgentEvent },
}

/// User message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UserContent {
    Text { text: String },
}

impl MessageRecord {
    /// Build a user text message.
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User {
            content: UserContent::Text { text: text.into() },
            meta: None,
        }
    }

    /// Wrap an agent event.
    #[must_use]
    pub const fn agent(event: AgentEvent) -> Self {
        Self::Agent { content: event }
    }
}
