//! Normalization of backend messages into [`AgentEvent`]s.
//!
//! Backend-specific identifiers needed to answer the agent (Claude request
//! ids, JSON-RPC ids, Codex call ids) stay in a [`ReplyRoute`] and never
//! appear in the normalized events.

use std::collections::{HashMap, HashSet};

use happy_bridge_core::{AgentEvent, PermissionPrompt, ToolCall, ToolCallState};
use serde_json::{Value, json};

use crate::backend::{
    AgentKind, BackendMessage,
    acp::{self, AcpContent, AcpFrame, AcpToolCall, PermissionOption, RequestPermissionParams, SessionUpdate, SessionUpdateParams},
    claude::{self, ClaudeMessage, ContentBlock, ControlRequest, MessageContent},
    codex::{self, ApprovalKind, CodexEvent, CodexMsg},
    decode,
};
use crate::permission::{PermissionOutcome, ToolInputCache, extract_permission_input};
use crate::tool_name::{ResolvedToolName, ToolPatternTable};

/// How to deliver a permission answer back to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyRoute {
    Claude { request_id: String },
    Codex { call_id: String, kind: ApprovalKind },
    Acp { id: Value, options: Vec<PermissionOption> },
}

impl ReplyRoute {
    /// Frame answering the request with `outcome`. Codex answers are new
    /// submissions and need a fresh `submission_id`.
    #[must_use]
    pub fn reply(&self, outcome: &PermissionOutcome, submission_id: &str) -> Value {
        match self {
            Self::Claude { request_id } => claude::permission_reply(request_id, outcome),
            Self::Codex { call_id, kind } => {
                codex::approval_submission(submission_id, call_id, *kind, outcome)
            }
            Self::Acp { id, options } => acp::permission_reply(id, options, outcome),
        }
    }
}

/// A permission request extracted from a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPermission {
    pub prompt: PermissionPrompt,
    pub resolved: ResolvedToolName,
    pub route: ReplyRoute,
}

/// Result of normalizing one frame.
#[derive(Debug, Default, PartialEq)]
pub struct Normalized {
    pub events: Vec<AgentEvent>,
    pub permission: Option<PendingPermission>,
    /// Frames to write back immediately.
    pub replies: Vec<Value>,
}

/// Per-session normalization state.
#[derive(Debug)]
pub struct Normalizer {
    kind: AgentKind,
    table: ToolPatternTable,
    inputs: ToolInputCache,
    names: HashMap<String, ResolvedToolName>,
    agent_session_id: Option<String>,
    prompts: HashSet<String>,
}

impl Normalizer {
    #[must_use]
    pub fn new(kind: AgentKind) -> Self {
        Self {
            kind,
            table: ToolPatternTable::for_backend(kind),
            inputs: ToolInputCache::new(),
            names: HashMap::new(),
            agent_session_id: None,
            prompts: HashSet::new(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Session id the agent reported for itself.
    #[must_use]
    pub fn agent_session_id(&self) -> Option<&str> {
        self.agent_session_id.as_deref()
    }

    /// Remember that the JSON-RPC request `id` is a prompt, so its response
    /// ends the turn.
    pub fn track_prompt(&mut self, id: &Value) {
        self.prompts.insert(id.to_string());
    }

    /// Normalize one parsed stdout frame.
    pub fn normalize(&mut self, frame: Value) -> Normalized {
        match decode(self.kind, frame) {
            Ok(BackendMessage::Claude(msg)) => self.claude(msg),
            Ok(BackendMessage::Codex(event)) => self.codex(event),
            Ok(BackendMessage::Acp(frame)) => self.acp(frame),
            Err(e) => {
                tracing::debug!(agent = %self.kind, error = %e, "Ignoring unrecognized agent frame");
                Normalized::default()
            }
        }
    }

    fn resolve(&self, reported: Option<&str>, call_id: &str, input: &Value) -> ResolvedToolName {
        let resolved = self.table.resolve(reported, call_id, input);
        if resolved.is_resolved() {
            return resolved;
        }
        self.names.get(call_id).cloned().unwrap_or(resolved)
    }

    fn tool_call(&mut self, id: &str, resolved: &ResolvedToolName, input: Value, state: ToolCallState) -> AgentEvent {
        self.inputs.record(id, &input);
        if state == ToolCallState::Pending {
            self.names.insert(id.to_string(), resolved.clone());
        } else {
            self.names.remove(id);
            self.inputs.remove(id);
        }
        AgentEvent::ToolCall(ToolCall {
            tool_call_id: id.to_string(),
            tool_name: resolved.name.clone(),
            input,
            state,
        })
    }

    fn permission(&self, id: &str, resolved: ResolvedToolName, input: Value, route: ReplyRoute) -> Normalized {
        let prompt = PermissionPrompt {
            tool_call_id: id.to_string(),
            tool_name: resolved.name.clone(),
            input,
        };
        Normalized {
            events: vec![AgentEvent::PermissionRequest(prompt.clone())],
            permission: Some(PendingPermission { prompt, resolved, route }),
            replies: Vec::new(),
        }
    }

    fn finish_tool(&mut self, id: &str) {
        self.names.remove(id);
        self.inputs.remove(id);
    }

    fn claude(&mut self, msg: ClaudeMessage) -> Normalized {
        let mut out = Normalized::default();
        match msg {
            ClaudeMessage::System { session_id: Some(id), .. } => {
                if self.agent_session_id.as_deref() != Some(id.as_str()) {
                    self.agent_session_id = Some(id.clone());
                    out.events.push(AgentEvent::AgentSession { agent_session_id: id });
                }
            }
            ClaudeMessage::Assistant { message } => {
                let MessageContent::Blocks(blocks) = message.content else {
                    return out;
                };
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => out.events.push(AgentEvent::Text { text }),
                        ContentBlock::Thinking { thinking } => {
                            out.events.push(AgentEvent::Thinking { text: thinking });
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            let resolved = self.resolve(Some(&name), &id, &input);
                            let event = self.tool_call(&id, &resolved, input, ToolCallState::Pending);
                            out.events.push(event);
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
                    }
                }
            }
            // User frames echo our own turns; only tool results are news.
            ClaudeMessage::User { message } => {
                let MessageContent::Blocks(blocks) = message.content else {
                    return out;
                };
                for block in blocks {
                    if let ContentBlock::ToolResult { tool_use_id, content, is_error } = block {
                        self.finish_tool(&tool_use_id);
                        out.events.push(AgentEvent::ToolResult {
                            tool_call_id: tool_use_id,
                            output: content,
                            is_error: is_error.unwrap_or(false),
                        });
                    }
                }
            }
            ClaudeMessage::Result { is_error, subtype, .. } => {
                out.events.push(if is_error {
                    AgentEvent::TurnAborted { reason: subtype }
                } else {
                    AgentEvent::TaskComplete { id: None }
                });
            }
            ClaudeMessage::ControlRequest { request_id, request } => match request {
                ControlRequest::CanUseTool { tool_name, input, tool_use_id } => {
                    let id = tool_use_id.unwrap_or_else(|| request_id.clone());
                    let input = extract_permission_input(Some(&input), &Value::Null, &self.inputs, &id);
                    let resolved = self.resolve(Some(&tool_name), &id, &input);
                    return self.permission(&id, resolved, input, ReplyRoute::Claude { request_id });
                }
                ControlRequest::HookCallback { callback_id, .. } => {
                    out.replies.push(claude::hook_reply(&request_id, &callback_id));
                }
                ControlRequest::Other => {
                    out.replies.push(claude::error_reply(&request_id, "Unsupported control request"));
                }
            },
            ClaudeMessage::System { .. } | ClaudeMessage::ControlResponse { .. } | ClaudeMessage::Other => {}
        }
        out
    }

    fn codex(&mut self, event: CodexEvent) -> Normalized {
        let mut out = Normalized::default();
        let CodexEvent { id: submission_id, msg } = event;
        let event = match msg {
            CodexMsg::SessionConfigured { session_id } => {
                self.agent_session_id = Some(session_id.clone());
                AgentEvent::AgentSession { agent_session_id: session_id }
            }
            CodexMsg::TaskStarted {} => AgentEvent::TaskStarted { id: Some(submission_id) },
            CodexMsg::AgentMessage { message } => AgentEvent::Text { text: message },
            CodexMsg::AgentReasoning { text } => AgentEvent::Thinking { text },
            CodexMsg::ExecCommandBegin { call_id, command, cwd } => {
                let input = json!({"command": command, "cwd": cwd});
                let resolved = self.resolve(Some("bash"), &call_id, &input);
                self.tool_call(&call_id, &resolved, input, ToolCallState::Pending)
            }
            CodexMsg::ExecCommandEnd { call_id, stdout, stderr, exit_code } => {
                self.finish_tool(&call_id);
                AgentEvent::ToolResult {
                    tool_call_id: call_id,
                    output: json!({"stdout": stdout, "stderr": stderr, "exitCode": exit_code}),
                    is_error: exit_code != 0,
                }
            }
            CodexMsg::ExecApprovalRequest { call_id, command, cwd, reason } => {
                let request = json!({"input": {"command": command, "cwd": cwd}, "reason": reason});
                let input = extract_permission_input(None, &request, &self.inputs, &call_id);
                let resolved = self.resolve(Some("bash"), &call_id, &input);
                let route = ReplyRoute::Codex { call_id: call_id.clone(), kind: ApprovalKind::Exec };
                return self.permission(&call_id, resolved, input, route);
            }
            CodexMsg::ApplyPatchApprovalRequest { call_id, changes, reason } => {
                let request = json!({"input": {"changes": changes}, "reason": reason});
                let input = extract_permission_input(None, &request, &self.inputs, &call_id);
                let resolved = self.resolve(Some("edit"), &call_id, &input);
                let route = ReplyRoute::Codex { call_id: call_id.clone(), kind: ApprovalKind::Patch };
                return self.permission(&call_id, resolved, input, route);
            }
            CodexMsg::PatchApplyBegin { call_id, changes } => {
                let input = json!({"changes": changes});
                let resolved = self.resolve(Some("edit"), &call_id, &input);
                self.tool_call(&call_id, &resolved, input, ToolCallState::Pending)
            }
            CodexMsg::PatchApplyEnd { call_id, success, stdout, stderr } => {
                self.finish_tool(&call_id);
                AgentEvent::ToolResult {
                    tool_call_id: call_id,
                    output: json!({"stdout": stdout, "stderr": stderr}),
                    is_error: !success,
                }
            }
            CodexMsg::McpToolCallBegin { call_id, invocation } => {
                let name = format!("mcp__{}__{}", invocation.server, invocation.tool);
                let resolved = self.resolve(Some(&name), &call_id, &invocation.arguments);
                self.tool_call(&call_id, &resolved, invocation.arguments, ToolCallState::Pending)
            }
            CodexMsg::McpToolCallEnd { call_id, result } => {
                self.finish_tool(&call_id);
                AgentEvent::ToolResult {
                    tool_call_id: call_id,
                    is_error: result.get("Err").is_some(),
                    output: result,
                }
            }
            CodexMsg::TaskComplete { .. } => AgentEvent::TaskComplete { id: Some(submission_id) },
            CodexMsg::TurnAborted { reason } => AgentEvent::TurnAborted { reason },
            CodexMsg::TokenCount { info } => AgentEvent::TokenCount { usage: info },
            CodexMsg::Error { message } => AgentEvent::TurnAborted { reason: Some(message) },
            CodexMsg::AgentMessageDelta { .. } | CodexMsg::Other => return out,
        };
        out.events.push(event);
        out
    }

    fn acp(&mut self, frame: AcpFrame) -> Normalized {
        let mut out = Normalized::default();
        match frame {
            AcpFrame::Notification { method, params } if method == acp::METHOD_SESSION_UPDATE => {
                match serde_json::from_value::<SessionUpdateParams>(params) {
                    Ok(params) => self.acp_update(params.update, &mut out),
                    Err(e) => tracing::debug!(error = %e, "Ignoring malformed session/update"),
                }
            }
            AcpFrame::Request { id, method, params } if method == acp::METHOD_REQUEST_PERMISSION => {
                match serde_json::from_value::<RequestPermissionParams>(params.clone()) {
                    Ok(request) => {
                        let call = &request.tool_call;
                        let input = extract_permission_input(call.raw_input.as_ref(), &params, &self.inputs, &call.tool_call_id);
                        let resolved = self.resolve(call.kind.as_deref(), &call.tool_call_id, &input);
                        let route = ReplyRoute::Acp { id, options: request.options.clone() };
                        return self.permission(&call.tool_call_id, resolved, input, route);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Malformed permission request");
                        out.replies.push(rpc_error(&id, -32602, "Invalid params"));
                    }
                }
            }
            AcpFrame::Request { id, method, .. } => {
                tracing::debug!(method, "Rejecting unsupported agent request");
                out.replies.push(rpc_error(&id, -32601, "Method not found"));
            }
            AcpFrame::Response { id, result, error } => {
                if let Some(session_id) = result
                    .as_ref()
                    .and_then(|r| r.get("sessionId"))
                    .and_then(Value::as_str)
                {
                    self.agent_session_id = Some(session_id.to_string());
                    out.events.push(AgentEvent::AgentSession {
                        agent_session_id: session_id.to_string(),
                    });
                }
                if self.prompts.remove(&id.to_string()) {
                    let stop_reason = result
                        .as_ref()
                        .and_then(|r| r.get("stopReason"))
                        .and_then(Value::as_str);
                    out.events.push(match (error, stop_reason) {
                        (Some(error), _) => AgentEvent::TurnAborted {
                            reason: error.get("message").and_then(Value::as_str).map(str::to_string),
                        },
                        (None, Some("cancelled")) => AgentEvent::TurnAborted {
                            reason: Some("cancelled".to_string()),
                        },
                        (None, _) => AgentEvent::TaskComplete { id: None },
                    });
                }
            }
            AcpFrame::Notification { .. } => {}
        }
        out
    }

    fn acp_update(&mut self, update: SessionUpdate, out: &mut Normalized) {
        match update {
            SessionUpdate::AgentMessageChunk { content: AcpContent::Text { text } } => {
                out.events.push(AgentEvent::Text { text });
            }
            SessionUpdate::AgentThoughtChunk { content: AcpContent::Text { text } } => {
                out.events.push(AgentEvent::Thinking { text });
            }
            SessionUpdate::ToolCall(call) | SessionUpdate::ToolCallUpdate(call) => {
                self.acp_tool_call(call, out);
            }
            SessionUpdate::AgentMessageChunk { .. }
            | SessionUpdate::AgentThoughtChunk { .. }
            | SessionUpdate::Other => {}
        }
    }

    fn acp_tool_call(&mut self, call: AcpToolCall, out: &mut Normalized) {
        let AcpToolCall { tool_call_id: id, kind, status, raw_input, raw_output, content, .. } = call;
        let input = raw_input
            .or_else(|| self.inputs.get(&id).cloned())
            .unwrap_or(Value::Null);
        let resolved = self.resolve(kind.as_deref(), &id, &input);
        let state = match status.as_deref() {
            Some("completed") => ToolCallState::Completed,
            Some("failed") => ToolCallState::Error,
            _ => ToolCallState::Pending,
        };
        out.events.push(self.tool_call(&id, &resolved, input, state));
        if state != ToolCallState::Pending {
            if let Some(output) = raw_output.or(content) {
                out.events.push(AgentEvent::ToolResult {
                    tool_call_id: id,
                    output,
                    is_error: state == ToolCallState::Error,
                });
            }
        }
    }
}

fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
