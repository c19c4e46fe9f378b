//! Bidirectional stdio peer for one agent process.

use std::sync::{
    Arc, Mutex as StdMutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use happy_bridge_core::AgentEvent;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};

use crate::backend::{AgentKind, WireFormat, acp, claude, codex};
use crate::frame::{encode_line, parse_line};
use crate::normalize::{Normalized, Normalizer, PendingPermission};
use crate::permission::{PermissionHandler, PermissionMode};

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Agent has not reported a session yet")]
    NoAgentSession,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Handles stdio communication with one agent.
///
/// Normalized events go out on the channel given to [`ProtocolPeer::spawn`].
/// Permission requests are decided by the shared [`PermissionHandler`] and
/// answered on the agent's stdin without blocking the read loop.
#[derive(Clone)]
pub struct ProtocolPeer {
    kind: AgentKind,
    stdin: Arc<Mutex<Writer>>,
    normalizer: Arc<StdMutex<Normalizer>>,
    permissions: Arc<PermissionHandler>,
    next_id: Arc<AtomicU64>,
}

impl ProtocolPeer {
    /// Spawn a new protocol peer.
    ///
    /// This starts a background task reading `stdout`. The task ends at EOF,
    /// aborting any permission request still pending.
    pub fn spawn<R, W>(
        kind: AgentKind,
        stdin: W,
        stdout: R,
        permissions: Arc<PermissionHandler>,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> (Self, JoinHandle<()>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = Self {
            kind,
            stdin: Arc::new(Mutex::new(Box::new(stdin))),
            normalizer: Arc::new(StdMutex::new(Normalizer::new(kind))),
            permissions,
            next_id: Arc::new(AtomicU64::new(1)),
        };

        let reader_peer = peer.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = reader_peer.read_loop(stdout, &events).await {
                tracing::error!(agent = %reader_peer.kind, "Protocol reader loop error: {}", e);
            }
            reader_peer.permissions.abort_all("agent exited");
        });

        (peer, handle)
    }

    #[must_use]
    pub const fn kind(&self) -> AgentKind {
        self.kind
    }

    #[must_use]
    pub fn permissions(&self) -> &Arc<PermissionHandler> {
        &self.permissions
    }

    /// Session id the agent reported for itself.
    #[must_use]
    pub fn agent_session_id(&self) -> Option<String> {
        self.with_normalizer(|n| n.agent_session_id().map(str::to_string))
    }

    fn with_normalizer<T>(&self, f: impl FnOnce(&mut Normalizer) -> T) -> T {
        let mut normalizer = self.normalizer.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut normalizer)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn read_loop<R>(&self, stdout: R, events: &mpsc::UnboundedSender<AgentEvent>) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(frame) = parse_line(&line) else {
                continue;
            };
            let Normalized { events: normalized, permission, replies } =
                self.with_normalizer(|n| n.normalize(frame));

            for event in normalized {
                if events.send(event).is_err() {
                    tracing::debug!(agent = %self.kind, "Event receiver dropped");
                }
            }
            for reply in replies {
                self.send_json(&reply).await?;
            }
            if let Some(permission) = permission {
                self.spawn_permission(permission);
            }
        }
        tracing::debug!(agent = %self.kind, "Agent stdout closed");
        Ok(())
    }

    fn spawn_permission(&self, pending: PendingPermission) {
        let peer = self.clone();
        tokio::spawn(async move {
            let PendingPermission { prompt, resolved, route } = pending;
            let tool_call_id = prompt.tool_call_id.clone();
            let outcome = peer.permissions.request(prompt, &resolved).await;
            let reply = route.reply(&outcome, &peer.next_id().to_string());
            if let Err(e) = peer.send_json(&reply).await {
                tracing::error!(%tool_call_id, "Failed to send permission result: {e}");
            }
        });
    }

    async fn send_json(&self, message: &Value) -> Result<(), ProtocolError> {
        let bytes = encode_line(message)?;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Initialize the protocol.
    ///
    /// ACP agents get `initialize` and `session/new`; Claude is told the
    /// current permission mode. Codex needs no handshake.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn initialize(&self, cwd: &str) -> Result<(), ProtocolError> {
        match self.kind.wire_format() {
            WireFormat::Acp => {
                let init = acp::request(self.next_id(), acp::METHOD_INITIALIZE, acp::initialize_params());
                self.send_json(&init).await?;
                let new = acp::request(self.next_id(), acp::METHOD_SESSION_NEW, acp::new_session_params(cwd));
                self.send_json(&new).await
            }
            WireFormat::ClaudeStream => {
                let mode = self.permissions.mode();
                let request = claude::set_permission_mode_request(&self.next_id().to_string(), mode);
                self.send_json(&request).await
            }
            WireFormat::CodexProto => Ok(()),
        }
    }

    /// Send a user message.
    ///
    /// # Errors
    /// Returns error if write fails, or if an ACP agent has no session yet.
    pub async fn send_user_message(&self, text: &str) -> Result<(), ProtocolError> {
        let message = match self.kind.wire_format() {
            WireFormat::ClaudeStream => claude::user_message(text),
            WireFormat::CodexProto => codex::user_input_submission(&self.next_id().to_string(), text),
            WireFormat::Acp => {
                let session_id = self.agent_session_id().ok_or(ProtocolError::NoAgentSession)?;
                let id = self.next_id();
                self.with_normalizer(|n| n.track_prompt(&json!(id)));
                acp::request(id, acp::METHOD_SESSION_PROMPT, acp::prompt_params(&session_id, text))
            }
        };
        self.send_json(&message).await
    }

    /// Interrupt the current turn. Pending permission requests are aborted.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn interrupt(&self) -> Result<(), ProtocolError> {
        self.permissions.abort_all("interrupted");
        let message = match self.kind.wire_format() {
            WireFormat::ClaudeStream => claude::interrupt_request(&self.next_id().to_string()),
            WireFormat::CodexProto => codex::interrupt_submission(&self.next_id().to_string()),
            WireFormat::Acp => {
                let Some(session_id) = self.agent_session_id() else {
                    return Ok(());
                };
                acp::notification(acp::METHOD_SESSION_CANCEL, json!({"sessionId": session_id}))
            }
        };
        self.send_json(&message).await
    }

    /// Set permission mode.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), ProtocolError> {
        self.permissions.set_mode(mode);
        if self.kind.wire_format() == WireFormat::ClaudeStream {
            let request = claude::set_permission_mode_request(&self.next_id().to_string(), mode);
            self.send_json(&request).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::permission::{PermissionMode, PermissionResponse};

    struct Harness {
        peer: ProtocolPeer,
        agent_stdout: DuplexStream,
        agent_stdin: BufReader<DuplexStream>,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        reader: JoinHandle<()>,
    }

    fn harness(kind: AgentKind, mode: PermissionMode) -> Harness {
        let (stdin_w, stdin_r) = duplex(64 * 1024);
        let (stdout_w, stdout_r) = duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let (peer, reader) = ProtocolPeer::spawn(
            kind,
            stdin_w,
            stdout_r,
            Arc::new(PermissionHandler::new(mode)),
            tx,
        );
        Harness {
            peer,
            agent_stdout: stdout_w,
            agent_stdin: BufReader::new(stdin_r),
            events: rx,
            reader,
        }
    }

    impl Harness {
        async fn emit(&mut self, frame: Value) {
            let line = format!("{frame}\n");
            self.agent_stdout.write_all(line.as_bytes()).await.unwrap();
        }

        async fn read_stdin(&mut self) -> Value {
            let mut line = String::new();
            self.agent_stdin.read_line(&mut line).await.unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_claude_permission_round_trip() {
        let mut h = harness(AgentKind::Claude, PermissionMode::Default);
        h.agent_stdout.write_all(b"Welcome to Claude\n").await.unwrap();
        h.emit(json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {"subtype": "can_use_tool", "tool_name": "Edit", "input": {"file_path": "a"}, "tool_use_id": "toolu_1"}
        }))
        .await;

        let event = h.events.recv().await.unwrap();
        assert!(matches!(event, AgentEvent::PermissionRequest(ref p) if p.tool_call_id == "toolu_1"));

        let mut state = h.peer.permissions().subscribe();
        state.wait_for(|s| s.requests.contains_key("toolu_1")).await.unwrap();
        h.peer
            .permissions()
            .respond(PermissionResponse {
                id: "toolu_1".into(),
                approved: true,
                decision: None,
                reason: None,
                mode: None,
            })
            .unwrap();

        let reply = h.read_stdin().await;
        assert_eq!(reply["type"], "control_response");
        assert_eq!(reply["response"]["request_id"], "req-1");
        assert_eq!(reply["response"]["response"]["behavior"], "allow");
    }

    #[tokio::test]
    async fn test_yolo_answers_without_remote_decision() {
        let mut h = harness(AgentKind::Codex, PermissionMode::Yolo);
        h.emit(json!({
            "id": "3",
            "msg": {"type": "exec_approval_request", "call_id": "call_1", "command": ["ls"]}
        }))
        .await;
        let reply = h.read_stdin().await;
        assert_eq!(reply["op"]["type"], "exec_approval");
        assert_eq!(reply["op"]["decision"], "approved");
    }

    #[tokio::test]
    async fn test_acp_prompt_requires_session() {
        let mut h = harness(AgentKind::Gemini, PermissionMode::Default);
        assert!(matches!(
            h.peer.send_user_message("hi").await,
            Err(ProtocolError::NoAgentSession)
        ));

        h.peer.initialize("/repo").await.unwrap();
        let init = h.read_stdin().await;
        assert_eq!(init["method"], "initialize");
        let new = h.read_stdin().await;
        assert_eq!(new["method"], "session/new");
        assert_eq!(new["params"]["cwd"], "/repo");

        h.emit(json!({"jsonrpc": "2.0", "id": new["id"], "result": {"sessionId": "s-1"}})).await;
        assert_eq!(
            h.events.recv().await.unwrap(),
            AgentEvent::AgentSession { agent_session_id: "s-1".into() }
        );

        h.peer.send_user_message("hi").await.unwrap();
        let prompt = h.read_stdin().await;
        assert_eq!(prompt["params"]["sessionId"], "s-1");

        h.emit(json!({"jsonrpc": "2.0", "id": prompt["id"], "result": {"stopReason": "end_turn"}})).await;
        assert_eq!(h.events.recv().await.unwrap(), AgentEvent::TaskComplete { id: None });
    }

    #[tokio::test]
    async fn test_eof_aborts_pending_requests() {
        let mut h = harness(AgentKind::Claude, PermissionMode::Default);
        h.emit(json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {"subtype": "can_use_tool", "tool_name": "Bash", "input": {"command": "ls"}, "tool_use_id": "toolu_1"}
        }))
        .await;
        let mut state = h.peer.permissions().subscribe();
        state.wait_for(|s| s.requests.contains_key("toolu_1")).await.unwrap();

        drop(h.agent_stdout);
        h.reader.await.unwrap();
        state
            .wait_for(|s| s.completed_requests.contains_key("toolu_1"))
            .await
            .unwrap();
        assert_eq!(h.peer.permissions().pending_count(), 0);
    }
}
