//! Reconnecting WebSocket channel to the relay.
//!
//! A background task owns the socket. Frames emitted while the socket is
//! down stay queued and are written in order once it is back. A frame
//! whose write fails is retried first on the next connection.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use happy_bridge_core::RetryPolicy;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;

use crate::{
    protocol::Frame,
    transport::{RelayTransport, TransportError},
};

/// Default relay server.
pub const DEFAULT_SERVER_URL: &str = "https://api.cluster-fluster.com";
const UPDATES_PATH: &str = "/v1/updates";

/// Relay channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// `ws://` or `wss://` address of the updates endpoint.
    pub url: String,
    /// Sent as a bearer token on every handshake.
    pub auth_token: Option<String>,
    /// Reconnect backoff. `max_attempts` is ignored; the channel never
    /// gives up.
    pub retry: RetryPolicy,
    /// Inbound frames buffered per subscriber. A subscriber that falls
    /// further behind skips the oldest frames.
    pub inbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::for_server(DEFAULT_SERVER_URL)
    }
}

impl ChannelConfig {
    /// Config for the updates endpoint of an `http(s)://` server.
    #[must_use]
    pub fn for_server(server_url: &str) -> Self {
        let base = server_url.trim_end_matches('/');
        let base = base
            .strip_prefix("https://")
            .map(|rest| format!("wss://{rest}"))
            .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
            .unwrap_or_else(|| base.to_string());
        Self {
            url: format!("{base}{UPDATES_PATH}"),
            auth_token: None,
            retry: RetryPolicy::unbounded(),
            inbound_capacity: 1024,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request(&self) -> Result<Request, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {e}", self.url)))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::InvalidAddress(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

struct Shared {
    inbound: broadcast::Sender<Frame>,
    acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_ack: AtomicU64,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn acks(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, text: &str) {
        let Some(frame) = Frame::parse(text) else {
            return;
        };
        if frame.is_ack() {
            let waiter = frame.ack_id.and_then(|id| self.acks().remove(&id));
            match waiter {
                Some(waiter) => {
                    let _ = waiter.send(frame.data);
                }
                None => tracing::debug!(ack_id = ?frame.ack_id, "Ack with no waiter"),
            }
            return;
        }
        // No subscribers is fine.
        let _ = self.inbound.send(frame);
    }
}

/// WebSocket [`RelayTransport`] that reconnects with backoff.
pub struct RelayChannel {
    outbound: mpsc::UnboundedSender<Frame>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl RelayChannel {
    /// Start the channel. Connection happens in the background.
    #[must_use]
    pub fn connect(config: ChannelConfig) -> Self {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));
        let (connected, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            inbound,
            acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
            connected,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(run(config, rx, shared.clone(), cancel.clone()));
        Self {
            outbound,
            shared,
            cancel,
        }
    }

    /// Watch the connection state.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Stop the background task and close the socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl RelayTransport for RelayChannel {
    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        self.send(Frame::new(event, data))
    }

    async fn emit_with_ack(&self, event: &str, data: Value, timeout: Duration) -> Result<Value, TransportError> {
        let ack_id = self.shared.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.acks().insert(ack_id, tx);
        if let Err(e) = self.send(Frame::new(event, data).with_ack_id(ack_id)) {
            self.shared.acks().remove(&ack_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.shared.acks().remove(&ack_id);
                Err(TransportError::AckTimeout {
                    event: event.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn ack(&self, ack_id: u64, data: Value) -> Result<(), TransportError> {
        self.send(Frame::ack(ack_id, data))
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.shared.inbound.subscribe()
    }

    fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }
}

enum PumpExit {
    Disconnected,
    Stopped,
}

async fn run(
    config: ChannelConfig,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    let mut carry: Option<Frame> = None;
    loop {
        let request = match config.request() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(error = %e, "Relay channel cannot start");
                return;
            }
        };
        let connected = tokio::select! {
            () = cancel.cancelled() => return,
            result = connect_async(request) => result,
        };
        match connected {
            Ok((ws, _)) => {
                tracing::info!(url = %config.url, "Connected to relay");
                failures = 0;
                shared.connected.send_replace(true);
                let exit = pump(ws, &mut rx, &mut carry, &shared, &cancel).await;
                shared.connected.send_replace(false);
                match exit {
                    PumpExit::Stopped => return,
                    PumpExit::Disconnected => tracing::warn!(url = %config.url, "Relay connection lost"),
                }
            }
            Err(e) => tracing::warn!(url = %config.url, error = %e, "Relay connect failed"),
        }
        failures = failures.saturating_add(1);
        let delay = config.retry.delay_for(failures);
        tracing::debug!(failures, ?delay, "Reconnecting to relay");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    rx: &mut mpsc::UnboundedReceiver<Frame>,
    carry: &mut Option<Frame>,
    shared: &Shared,
    cancel: &CancellationToken,
) -> PumpExit {
    let (mut sink, mut stream) = ws.split();

    if let Some(frame) = carry.take() {
        if let Err(frame) = write_frame(&mut sink, frame).await {
            *carry = Some(frame);
            return PumpExit::Disconnected;
        }
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return PumpExit::Stopped;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => shared.dispatch(&text),
                    Err(_) => tracing::debug!("Dropping non-UTF-8 relay frame"),
                },
                Some(Ok(Message::Close(_))) | None => return PumpExit::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Relay socket error");
                    return PumpExit::Disconnected;
                }
            },
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(frame) = write_frame(&mut sink, frame).await {
                        *carry = Some(frame);
                        return PumpExit::Disconnected;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpExit::Stopped;
                }
            },
        }
    }
}

/// Write one frame. Hands the frame back if the socket failed.
async fn write_frame<S>(sink: &mut S, frame: Frame) -> Result<(), Frame>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(event = %frame.event, error = %e, "Failed to serialize frame");
            return Ok(());
        }
    };
    match sink.send(Message::Text(text)).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::warn!(event = %frame.event, error = %e, "Relay write failed");
            Err(frame)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::accept_async;

    use super::*;

    async fn listener() -> (TcpListener, ChannelConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ChannelConfig::for_server(&format!("http://{addr}")).with_retry(RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        });
        (listener, config)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                return Frame::parse(&text).unwrap();
            }
        }
    }

    #[test]
    fn test_for_server_urls() {
        assert_eq!(
            ChannelConfig::for_server("https://api.example.com/").url,
            "wss://api.example.com/v1/updates"
        );
        assert_eq!(
            ChannelConfig::for_server("http://127.0.0.1:3005").url,
            "ws://127.0.0.1:3005/v1/updates"
        );
        assert_eq!(ChannelConfig::default().url, "wss://api.cluster-fluster.com/v1/updates");
    }

    #[tokio::test]
    async fn test_frames_emitted_before_connect_are_delivered() {
        let (listener, config) = listener().await;
        let channel = RelayChannel::connect(config);
        channel.emit("message", json!({"n": 1})).await.unwrap();
        channel.emit("message", json!({"n": 2})).await.unwrap();

        let mut ws = accept(&listener).await;
        assert_eq!(next_frame(&mut ws).await.data, json!({"n": 1}));
        assert_eq!(next_frame(&mut ws).await.data, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_ack_round_trip_and_inbound() {
        let (listener, config) = listener().await;
        let channel = Arc::new(RelayChannel::connect(config));
        let mut inbound = channel.subscribe();

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let frame = next_frame(&mut ws).await;
            let ack = Frame::ack(frame.ack_id.unwrap(), json!({"result": "success", "version": 2}));
            ws.send(Message::Text(serde_json::to_string(&ack).unwrap())).await.unwrap();
            let update = Frame::new("update", json!({"id": "u1"}));
            ws.send(Message::Text(serde_json::to_string(&update).unwrap())).await.unwrap();
            ws
        });

        let reply = channel
            .emit_with_ack("update-metadata", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply["version"], 2);
        let frame = inbound.recv().await.unwrap();
        assert_eq!(frame.event, "update");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnects_after_close() {
        let (listener, config) = listener().await;
        let channel = RelayChannel::connect(config);
        let mut state = channel.connection_state();

        let mut first = accept(&listener).await;
        state.wait_for(|up| *up).await.unwrap();
        first.close(None).await.unwrap();
        state.wait_for(|up| !*up).await.unwrap();

        channel.emit("message", json!({"after": "reconnect"})).await.unwrap();
        let mut second = accept(&listener).await;
        assert_eq!(next_frame(&mut second).await.data, json!({"after": "reconnect"}));
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let (listener, config) = listener().await;
        let channel = RelayChannel::connect(config);
        let _ws = accept(&listener).await;
        let err = channel
            .emit_with_ack("update-state", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AckTimeout { .. }));
    }
}
