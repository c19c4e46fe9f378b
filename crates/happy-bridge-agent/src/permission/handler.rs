//! Permission request state machine.
//!
//! [`PermissionHandler`] is the only writer of the pending/completed tables.
//! Every transition publishes an [`AgentStateRequests`] snapshot on a watch
//! channel; that snapshot is what ends up in the session's `agentState`.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use happy_bridge_core::{PermissionPrompt, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use super::policy::{PermissionMode, RequestShape};
use crate::tool_name::ResolvedToolName;

/// Completed requests kept for `agentState.completedRequests`.
pub const COMPLETED_CAPACITY: usize = 100;

/// A decision on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    ApprovedForSession,
    Denied,
    Abort,
}

impl Decision {
    #[must_use]
    pub const fn is_approval(self) -> bool {
        matches!(self, Self::Approved | Self::ApprovedForSession)
    }

    const fn status(self) -> RequestStatus {
        match self {
            Self::Approved | Self::ApprovedForSession => RequestStatus::Approved,
            Self::Denied => RequestStatus::Denied,
            Self::Abort => RequestStatus::Canceled,
        }
    }
}

/// Final status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Approved,
    Denied,
    Canceled,
}

/// Answer from a remote client (`permission` RPC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Mode change requested together with the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PermissionMode>,
}

impl PermissionResponse {
    /// Explicit decision, or the one implied by `approved`.
    #[must_use]
    pub fn effective_decision(&self) -> Decision {
        self.decision.unwrap_or(if self.approved {
            Decision::Approved
        } else {
            Decision::Denied
        })
    }
}

/// Entry of `agentState.requests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub tool: String,
    pub arguments: Value,
    pub created_at: i64,
}

/// Entry of `agentState.completedRequests`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRequest {
    pub tool: String,
    pub arguments: Value,
    pub created_at: i64,
    pub completed_at: i64,
    pub status: RequestStatus,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Projection of the handler's tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateRequests {
    pub requests: BTreeMap<String, PendingRequest>,
    pub completed_requests: BTreeMap<String, CompletedRequest>,
}

/// What the agent is told.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionOutcome {
    Approved {
        input: Value,
        decision: Decision,
        /// Approved by policy or allow-list rather than by a person.
        automatic: bool,
    },
    Denied {
        reason: Option<String>,
    },
    Aborted {
        reason: Option<String>,
    },
}

impl PermissionOutcome {
    #[must_use]
    pub const fn decision(&self) -> Decision {
        match self {
            Self::Approved { decision, .. } => *decision,
            Self::Denied { .. } => Decision::Denied,
            Self::Aborted { .. } => Decision::Abort,
        }
    }

    #[must_use]
    pub const fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    fn reason(&self) -> Option<String> {
        match self {
            Self::Approved { .. } => None,
            Self::Denied { reason } | Self::Aborted { reason } => reason.clone(),
        }
    }
}

/// Permission error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("Unknown permission request: {0}")]
    UnknownRequest(String),
    #[error("Permission request already resolved: {0}")]
    AlreadyResolved(String),
}

struct Pending {
    request: PendingRequest,
    shape: RequestShape,
    reply: oneshot::Sender<PermissionOutcome>,
    /// Tells a request apart from a later one under the same id.
    ticket: u64,
}

#[derive(Default)]
struct Inner {
    mode: PermissionMode,
    pending: HashMap<String, Pending>,
    completed: BTreeMap<String, CompletedRequest>,
    /// Completed ids, oldest first.
    completed_order: VecDeque<String>,
    allowed: HashSet<RequestShape>,
    next_ticket: u64,
}

impl Inner {
    fn projection(&self) -> AgentStateRequests {
        AgentStateRequests {
            requests: self
                .pending
                .iter()
                .map(|(id, p)| (id.clone(), p.request.clone()))
                .collect(),
            completed_requests: self.completed.clone(),
        }
    }

    fn forget_completed(&mut self, id: &str) {
        if self.completed.remove(id).is_some() {
            self.completed_order.retain(|known| known != id);
        }
    }

    fn complete(&mut self, id: &str, request: PendingRequest, outcome: &PermissionOutcome) {
        let decision = outcome.decision();
        self.forget_completed(id);
        self.completed_order.push_back(id.to_string());
        self.completed.insert(
            id.to_string(),
            CompletedRequest {
                tool: request.tool,
                arguments: request.arguments,
                created_at: request.created_at,
                completed_at: now_millis(),
                status: decision.status(),
                decision,
                reason: outcome.reason(),
            },
        );
        while self.completed.len() > COMPLETED_CAPACITY {
            let Some(oldest) = self.completed_order.pop_front() else {
                break;
            };
            self.completed.remove(&oldest);
        }
    }

    fn cancel_all(&mut self, reason: Option<&str>) {
        let outcome = PermissionOutcome::Aborted {
            reason: reason.map(str::to_string),
        };
        for (id, pending) in std::mem::take(&mut self.pending) {
            self.complete(&id, pending.request, &outcome);
            let _ = pending.reply.send(outcome.clone());
        }
    }
}

/// Withdraws a pending request when its waiter goes away without an answer.
struct Withdraw<'a> {
    handler: &'a PermissionHandler,
    id: String,
    ticket: u64,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        let mut inner = self.handler.lock();
        if !inner.pending.get(&self.id).is_some_and(|p| p.ticket == self.ticket) {
            return;
        }
        let Some(pending) = inner.pending.remove(&self.id) else {
            return;
        };
        tracing::debug!(tool_call_id = %self.id, "Permission request withdrawn");
        let outcome = PermissionOutcome::Aborted {
            reason: Some("request withdrawn".to_string()),
        };
        inner.complete(&self.id, pending.request, &outcome);
        self.handler.publish(&inner);
    }
}

/// Single writer of a session's permission requests.
pub struct PermissionHandler {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<AgentStateRequests>,
}

impl Default for PermissionHandler {
    fn default() -> Self {
        Self::new(PermissionMode::default())
    }
}

impl PermissionHandler {
    #[must_use]
    pub fn new(mode: PermissionMode) -> Self {
        let (state_tx, _) = watch::channel(AgentStateRequests::default());
        Self {
            inner: Mutex::new(Inner {
                mode,
                ..Inner::default()
            }),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.projection());
    }

    #[must_use]
    pub fn mode(&self) -> PermissionMode {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        let mut inner = self.lock();
        if inner.mode != mode {
            tracing::info!(from = %inner.mode, to = %mode, "Permission mode changed");
            inner.mode = mode;
        }
    }

    /// Watch the request tables.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AgentStateRequests> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> AgentStateRequests {
        self.lock().projection()
    }

    /// Number of requests waiting on a decision.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Ask for permission and wait for the answer.
    ///
    /// Requests covered by the mode or the session allow-list resolve
    /// immediately. A second request under an id that is still pending
    /// aborts the first one. Dropping the returned future withdraws the
    /// request.
    pub async fn request(&self, prompt: PermissionPrompt, tool: &ResolvedToolName) -> PermissionOutcome {
        let shape = RequestShape::of(&prompt.tool_name, &prompt.input);
        let request = PendingRequest {
            tool: prompt.tool_name,
            arguments: prompt.input,
            created_at: now_millis(),
        };
        let id = prompt.tool_call_id;

        let (rx, _withdraw) = {
            let mut inner = self.lock();
            let by_mode = inner.mode.auto_approves(tool);
            let by_allow_list = inner.allowed.contains(&shape);
            if by_mode || by_allow_list {
                tracing::info!(
                    tool_call_id = %id,
                    tool = %request.tool,
                    mode = %inner.mode,
                    by_allow_list,
                    "Auto-approved tool call"
                );
                let decision = if by_allow_list {
                    Decision::ApprovedForSession
                } else {
                    Decision::Approved
                };
                let outcome = PermissionOutcome::Approved {
                    input: request.arguments.clone(),
                    decision,
                    automatic: true,
                };
                inner.complete(&id, request, &outcome);
                self.publish(&inner);
                return outcome;
            }

            let (tx, rx) = oneshot::channel();
            inner.next_ticket += 1;
            let ticket = inner.next_ticket;
            let pending = Pending {
                request,
                shape,
                reply: tx,
                ticket,
            };
            if let Some(previous) = inner.pending.insert(id.clone(), pending) {
                tracing::warn!(tool_call_id = %id, "Duplicate permission request, aborting previous");
                let _ = previous.reply.send(PermissionOutcome::Aborted {
                    reason: Some("superseded".to_string()),
                });
            }
            inner.forget_completed(&id);
            self.publish(&inner);
            let withdraw = Withdraw {
                handler: self,
                id,
                ticket,
            };
            (rx, withdraw)
        };

        rx.await.unwrap_or(PermissionOutcome::Aborted {
            reason: Some("permission handler dropped".to_string()),
        })
    }

    /// Apply a remote answer.
    ///
    /// # Errors
    /// Returns error if no request with this id is pending.
    pub fn respond(&self, response: PermissionResponse) -> Result<(), PermissionError> {
        let mut inner = self.lock();
        let Some(pending) = inner.pending.remove(&response.id) else {
            return Err(if inner.completed.contains_key(&response.id) {
                PermissionError::AlreadyResolved(response.id)
            } else {
                PermissionError::UnknownRequest(response.id)
            });
        };

        if let Some(mode) = response.mode {
            inner.mode = mode;
        }

        let decision = response.effective_decision();
        let outcome = match decision {
            Decision::Approved | Decision::ApprovedForSession => {
                if decision == Decision::ApprovedForSession {
                    inner.allowed.insert(pending.shape.clone());
                }
                PermissionOutcome::Approved {
                    input: pending.request.arguments.clone(),
                    decision,
                    automatic: false,
                }
            }
            Decision::Denied => PermissionOutcome::Denied {
                reason: response.reason,
            },
            Decision::Abort => PermissionOutcome::Aborted {
                reason: response.reason,
            },
        };
        tracing::debug!(tool_call_id = %response.id, ?decision, "Permission request resolved");

        inner.complete(&response.id, pending.request, &outcome);
        self.publish(&inner);
        let _ = pending.reply.send(outcome);
        Ok(())
    }

    /// Clear the session allow-list and cancel every pending request.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.allowed.clear();
        inner.cancel_all(None);
        self.publish(&inner);
    }

    /// Abort every pending request.
    pub fn abort_all(&self, reason: &str) {
        let mut inner = self.lock();
        if !inner.pending.is_empty() {
            tracing::info!(count = inner.pending.len(), reason, "Aborting pending permission requests");
        }
        inner.cancel_all(Some(reason));
        self.publish(&inner);
    }
}
