//! Codex `proto` events and submissions.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::permission::{Decision, PermissionOutcome};

/// Event line read from Codex's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodexEvent {
    #[serde(default)]
    pub id: String,
    pub msg: CodexMsg,
}

/// Event payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodexMsg {
    SessionConfigured {
        session_id: String,
    },
    TaskStarted {},
    AgentMessage {
        message: String,
    },
    AgentMessageDelta {
        delta: String,
    },
    AgentReasoning {
        text: String,
    },
    ExecCommandBegin {
        call_id: String,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    ExecCommandEnd {
        call_id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        exit_code: i32,
    },
    ExecApprovalRequest {
        call_id: String,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    ApplyPatchApprovalRequest {
        call_id: String,
        #[serde(default)]
        changes: Value,
        #[serde(default)]
        reason: Option<String>,
    },
    PatchApplyBegin {
        call_id: String,
        #[serde(default)]
        changes: Value,
    },
    PatchApplyEnd {
        call_id: String,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
    },
    McpToolCallBegin {
        call_id: String,
        invocation: McpInvocation,
    },
    McpToolCallEnd {
        call_id: String,
        #[serde(default)]
        result: Value,
    },
    TaskComplete {
        #[serde(default)]
        last_agent_message: Option<String>,
    },
    TurnAborted {
        #[serde(default)]
        reason: Option<String>,
    },
    TokenCount {
        #[serde(default)]
        info: Value,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

/// MCP tool invocation reported by Codex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpInvocation {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Which approval op answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    Exec,
    Patch,
}

/// Codex's own decision vocabulary.
#[must_use]
pub const fn decision_str(decision: Decision) -> &'static str {
    match decision {
        Decision::Approved => "approved",
        Decision::ApprovedForSession => "approved_for_session",
        Decision::Denied => "denied",
        Decision::Abort => "abort",
    }
}

/// Submission answering an approval request.
#[must_use]
pub fn approval_submission(
    submission_id: &str,
    call_id: &str,
    kind: ApprovalKind,
    outcome: &PermissionOutcome,
) -> Value {
    let op = match kind {
        ApprovalKind::Exec => "exec_approval",
        ApprovalKind::Patch => "patch_approval",
    };
    json!({
        "id": submission_id,
        "op": {"type": op, "id": call_id, "decision": decision_str(outcome.decision())}
    })
}

/// Submission carrying a user turn.
#[must_use]
pub fn user_input_submission(submission_id: &str, text: &str) -> Value {
    json!({
        "id": submission_id,
        "op": {"type": "user_input", "items": [{"type": "text", "text": text}]}
    })
}

/// Submission interrupting the current turn.
#[must_use]
pub fn interrupt_submission(submission_id: &str) -> Value {
    json!({"id": submission_id, "op": {"type": "interrupt"}})
}
