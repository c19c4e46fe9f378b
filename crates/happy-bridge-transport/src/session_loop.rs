//! The per-session loop.
//!
//! Connects one agent peer to one relay session:
//! - agent events go through the outgoing queue to the relay
//! - user messages wait in the pending queue and reach the agent one turn
//!   at a time
//! - relay RPCs are answered from the session's router
//! - the pending queue and the permission requests are mirrored into
//!   metadata and agent state

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use happy_bridge_agent::{PermissionMode, PermissionResponse, ProtocolPeer};
use happy_bridge_core::{
    AgentEvent, DecodedMessage, MessageRecord, RetryPolicy, ToolCallState, UpdateContainer, event::UserContent,
    retry_with_backoff,
};
use happy_bridge_delivery::{
    EnqueueOptions, InvalidateSync, OutgoingQueue, PendingMessage, PendingQueue, PersistedQueue, RelayListing,
    SyncConfig, Work,
};
use serde_json::{Value, json};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    capabilities::CapabilityRegistry,
    protocol::{Frame, RPC_REGISTER, RPC_REQUEST, RpcRequest, UPDATE},
    rpc::{RpcError, RpcRouter},
    session_client::{SessionChange, SessionClient},
    transport::RelayTransport,
};

/// Session loop configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLoopConfig {
    /// How long a pending tool call is held back waiting for its
    /// permission request or result.
    pub tool_call_delay: Duration,
    /// Retry policy for sending agent messages.
    pub retry: RetryPolicy,
    /// Retry policy of the metadata and agent state mirrors.
    pub sync: SyncConfig,
    pub keep_alive: Duration,
    /// Upper bound on the final metadata write at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SessionLoopConfig {
    fn default() -> Self {
        Self {
            tool_call_delay: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            sync: SyncConfig::default(),
            keep_alive: Duration::from_secs(20),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Drives one session until it is killed or the agent exits.
pub struct SessionLoop<T> {
    client: Arc<SessionClient<T>>,
    peer: ProtocolPeer,
    router: Arc<RpcRouter>,
    pending: Arc<PendingQueue>,
    queue_sync: InvalidateSync,
    state_sync: InvalidateSync,
    cancel: CancellationToken,
    config: SessionLoopConfig,
}

impl<T: RelayTransport + 'static> SessionLoop<T> {
    pub fn new(
        client: Arc<SessionClient<T>>,
        peer: ProtocolPeer,
        capabilities: CapabilityRegistry,
        config: SessionLoopConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let pending = Arc::new(PendingQueue::new());
        let router = Arc::new(RpcRouter::new(client.session_id(), client.codec()));
        register_handlers(&router, &peer, Arc::new(capabilities), &cancel);

        let queue_sync = {
            let client = client.clone();
            let pending = pending.clone();
            InvalidateSync::new(
                "pending-queue",
                config.sync,
                move || {
                    let client = client.clone();
                    let pending = pending.clone();
                    async move {
                        // Each attempt merges the relay's latest listing first.
                        let written = AtomicU64::new(0);
                        client
                            .update_metadata(|current| {
                                let mut metadata = as_object(current);
                                if let Some(listing) = RelayListing::from_metadata(&metadata) {
                                    pending.merge_relay(listing);
                                }
                                let checkpoint = pending.checkpoint();
                                written.store(checkpoint.generation, Ordering::SeqCst);
                                if let Err(e) = checkpoint.persisted.write_into(&mut metadata) {
                                    tracing::warn!(error = %e, "Cannot write pending queue into metadata");
                                }
                                metadata
                            })
                            .await?;
                        pending.mark_persisted(written.load(Ordering::SeqCst));
                        Ok(())
                    }
                    .boxed()
                },
                |e| tracing::error!(error = %e, "Pending queue no longer mirrored to metadata"),
            )
        };

        let state_sync = {
            let client = client.clone();
            let peer = peer.clone();
            InvalidateSync::new(
                "agent-state",
                config.sync,
                move || {
                    let client = client.clone();
                    let requests = peer.permissions().snapshot();
                    async move {
                        let requests = serde_json::to_value(requests)?;
                        client
                            .update_agent_state(move |current| {
                                let mut state = as_object(current);
                                for key in ["requests", "completedRequests"] {
                                    state[key] = requests[key].clone();
                                }
                                state
                            })
                            .await?;
                        Ok(())
                    }
                    .boxed()
                },
                |e| tracing::error!(error = %e, "Permission requests no longer mirrored to agent state"),
            )
        };

        Self {
            client,
            peer,
            router,
            pending,
            queue_sync,
            state_sync,
            cancel,
            config,
        }
    }

    #[must_use]
    pub const fn pending(&self) -> &Arc<PendingQueue> {
        &self.pending
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<RpcRouter> {
        &self.router
    }

    /// Token that stops the loop when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until `killSession`, cancellation, or the end of `events`.
    ///
    /// A message still in flight at shutdown goes back to the head of the
    /// pending queue, and the queue is written to metadata a last time.
    ///
    /// # Errors
    /// Returns error if the session-end notice cannot be sent.
    pub async fn run(self, events: mpsc::UnboundedReceiver<AgentEvent>) -> anyhow::Result<()> {
        let session_id = self.client.session_id();
        tracing::info!(session_id = %session_id, agent = %self.peer.kind(), "Session loop started");

        if let Some(metadata) = self.client.metadata() {
            self.pending.restore(PersistedQueue::from_metadata(&metadata.value));
        }
        self.register_methods().await;

        let (outgoing, outgoing_rx) = OutgoingQueue::new();
        tokio::join!(
            self.pump_agent_events(events, outgoing),
            self.drain_outgoing(outgoing_rx),
            self.pump_relay(),
            self.pump_pending(),
            self.mirror_state(),
            self.keep_alive(),
        );

        if let Some(message) = self.pending.in_flight() {
            self.pending.release(&message.local_id);
        }
        self.peer.permissions().abort_all("session ended");
        self.queue_sync.invalidate();
        self.state_sync.invalidate();
        let flushed = tokio::time::timeout(self.config.shutdown_grace, async {
            self.queue_sync.await_queue().await;
            self.state_sync.await_queue().await;
        })
        .await;
        if flushed.is_err() {
            tracing::warn!(session_id = %session_id, "Final metadata write did not finish");
        }

        self.client.send_session_end().await?;
        tracing::info!(session_id = %session_id, "Session loop finished");
        Ok(())
    }

    async fn register_methods(&self) {
        for method in self.router.methods() {
            if let Err(e) = self.client.transport().emit(RPC_REGISTER, json!({ "method": method })).await {
                tracing::warn!(%method, error = %e, "RPC registration failed");
            }
        }
    }

    async fn pump_agent_events(
        &self,
        mut events: mpsc::UnboundedReceiver<AgentEvent>,
        outgoing: OutgoingQueue<MessageRecord>,
    ) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                tracing::info!(session_id = %self.client.session_id(), "Agent event stream ended");
                self.cancel.cancel();
                break;
            };
            self.route_event(&outgoing, event);
        }
        let flushed = outgoing.flush();
        if flushed > 0 {
            tracing::debug!(flushed, "Flushed delayed agent messages");
        }
    }

    fn route_event(&self, outgoing: &OutgoingQueue<MessageRecord>, event: AgentEvent) {
        if matches!(event, AgentEvent::TaskComplete { .. } | AgentEvent::TurnAborted { .. }) {
            if let Some(message) = self.pending.in_flight() {
                self.pending.consume(&message.local_id);
            }
        }

        let options = match &event {
            AgentEvent::ToolCall(call) if call.state == ToolCallState::Pending => {
                EnqueueOptions::delayed(self.config.tool_call_delay).gated_on(call.tool_call_id.clone())
            }
            AgentEvent::ToolCall(_) | AgentEvent::ToolResult { .. } | AgentEvent::PermissionRequest(_) => {
                if let Some(id) = event.tool_call_id() {
                    outgoing.release(id);
                }
                EnqueueOptions::default()
            }
            _ => EnqueueOptions::default(),
        };
        outgoing.enqueue(MessageRecord::agent(event), options);
    }

    async fn drain_outgoing(&self, mut rx: mpsc::UnboundedReceiver<MessageRecord>) {
        while let Some(record) = rx.recv().await {
            let sent = retry_with_backoff(self.config.retry, |_| self.client.send_message(&record, None)).await;
            if let Err(e) = sent {
                tracing::error!(session_id = %self.client.session_id(), error = %e, "Dropping agent message after retries");
            }
        }
    }

    async fn pump_relay(&self) {
        let mut frames = self.client.transport().subscribe();
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break,
                frame = frames.recv() => frame,
            };
            match frame {
                Ok(frame) => self.handle_frame(frame),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        session_id = %self.client.session_id(),
                        skipped,
                        "Relay frames dropped, user messages may be missing"
                    );
                    // Queue entries mirrored in metadata can still be recovered.
                    self.pending.notify_metadata_changed();
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn handle_frame(&self, frame: Frame) {
        match frame.event.as_str() {
            UPDATE => {
                let update: UpdateContainer = match serde_json::from_value(frame.data) {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::debug!(error = %e, "Dropping malformed update");
                        return;
                    }
                };
                for change in self.client.handle_update(&update) {
                    match change {
                        SessionChange::Message(message) => self.accept_user_message(&message),
                        SessionChange::Metadata => self.pending.notify_metadata_changed(),
                        SessionChange::AgentState => {}
                    }
                }
            }
            RPC_REQUEST => {
                let Some(ack_id) = frame.ack_id else {
                    tracing::debug!("RPC request without ack id");
                    return;
                };
                let request: RpcRequest = match serde_json::from_value(frame.data) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::debug!(error = %e, "Dropping malformed RPC request");
                        return;
                    }
                };
                let router = self.router.clone();
                let client = self.client.clone();
                tokio::spawn(async move {
                    let reply = router.handle(&request).await;
                    let sent = match serde_json::to_value(reply) {
                        Ok(data) => client.transport().ack(ack_id, data).await.map_err(anyhow::Error::from),
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = sent {
                        tracing::warn!(method = %request.method, error = %e, "RPC reply failed");
                    }
                });
            }
            _ => {}
        }
    }

    fn accept_user_message(&self, message: &DecodedMessage) {
        let Some(content) = &message.content else {
            return;
        };
        if content.get("role").and_then(Value::as_str) != Some("user") {
            return;
        }
        let local_id = message.local_id.clone().unwrap_or_else(|| message.id.clone());
        if self.pending.enqueue(PendingMessage::new(local_id.clone(), content.clone())) {
            tracing::debug!(%local_id, "User message queued");
        }
    }

    async fn pump_pending(&self) {
        loop {
            match self.pending.wait_for_work(&self.cancel).await {
                Work::Message(message) => self.deliver(message).await,
                Work::MetadataChanged => {
                    if let Some(listing) = self
                        .client
                        .metadata()
                        .and_then(|metadata| RelayListing::from_metadata(&metadata.value))
                    {
                        self.pending.merge_relay(listing);
                    }
                }
                Work::Cancelled => break,
            }
        }
    }

    async fn deliver(&self, message: PendingMessage) {
        let Some(text) = prompt_text(&message.content) else {
            self.pending.discard(&message.local_id, "unreadable content");
            return;
        };
        if let Some(mode) = requested_mode(&message.content).filter(|m| *m != self.peer.permissions().mode()) {
            if let Err(e) = self.peer.set_permission_mode(mode).await {
                tracing::warn!(%mode, error = %e, "Cannot switch permission mode");
            }
        }
        if let Err(e) = self.peer.send_user_message(&text).await {
            tracing::warn!(local_id = %message.local_id, error = %e, "Delivering user message failed");
            self.pending.discard(&message.local_id, &format!("delivery failed: {e}"));
        }
    }

    async fn mirror_state(&self) {
        let mut queue = self.pending.subscribe();
        let mut requests = self.peer.permissions().subscribe();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                changed = queue.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.queue_sync.invalidate();
                }
                changed = requests.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.state_sync.invalidate();
                }
            }
        }
    }

    async fn keep_alive(&self) {
        let mut ticker = tokio::time::interval(self.config.keep_alive);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let thinking = self.pending.in_flight().is_some();
                    if let Err(e) = self.client.keep_alive(thinking).await {
                        tracing::debug!(error = %e, "Keep-alive failed");
                    }
                }
            }
        }
    }
}

fn register_handlers(
    router: &RpcRouter,
    peer: &ProtocolPeer,
    capabilities: Arc<CapabilityRegistry>,
    cancel: &CancellationToken,
) {
    let token = cancel.clone();
    router.register("killSession", move |_| {
        let token = token.clone();
        async move {
            tracing::info!("Session kill requested");
            token.cancel();
            Ok(json!({ "success": true }))
        }
    });

    let agent = peer.clone();
    router.register("abort", move |_| {
        let agent = agent.clone();
        async move {
            agent.interrupt().await.map_err(|e| RpcError::Failed(e.to_string()))?;
            Ok(json!({ "success": true }))
        }
    });

    let agent = peer.clone();
    router.register("permission", move |params| {
        let agent = agent.clone();
        async move {
            let response: PermissionResponse = serde_json::from_value(params)?;
            let mode = response.mode;
            agent
                .permissions()
                .respond(response)
                .map_err(|e| RpcError::Failed(e.to_string()))?;
            if let Some(mode) = mode {
                agent
                    .set_permission_mode(mode)
                    .await
                    .map_err(|e| RpcError::Failed(e.to_string()))?;
            }
            Ok(json!({ "success": true }))
        }
    });

    let registry = capabilities.clone();
    router.register("capabilities.describe", move |_| {
        let registry = registry.clone();
        async move { Ok(serde_json::to_value(registry.describe())?) }
    });

    let registry = capabilities.clone();
    router.register("capabilities.detect", move |_| {
        let registry = registry.clone();
        async move { Ok(serde_json::to_value(registry.detect().await)?) }
    });

    let registry = capabilities;
    router.register("capabilities.invoke", move |params| {
        let registry = registry.clone();
        async move {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| RpcError::InvalidParams("missing name".into()))?;
            let invocation = registry
                .invoke(name)
                .await
                .map_err(|e| RpcError::Failed(e.to_string()))?;
            Ok(serde_json::to_value(invocation)?)
        }
    });
}

fn as_object(value: Value) -> Value {
    if value.is_object() { value } else { json!({}) }
}

/// Prompt text of a queued message: a bare string, a user record, or an
/// object with a `text` field.
fn prompt_text(content: &Value) -> Option<String> {
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    if let Ok(MessageRecord::User {
        content: UserContent::Text { text },
        ..
    }) = serde_json::from_value(content.clone())
    {
        return Some(text);
    }
    content.get("text").and_then(Value::as_str).map(str::to_string)
}

fn requested_mode(content: &Value) -> Option<PermissionMode> {
    content
        .pointer("/meta/permissionMode")
        .and_then(Value::as_str)
        .and_then(|mode| mode.parse().ok())
}
