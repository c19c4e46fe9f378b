//! The relay transport seam and its telemetry decorator.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::protocol::Frame;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("No ack for {event} within {timeout:?}")]
    AckTimeout { event: String, timeout: Duration },
    #[error("Relay rejected {event}: {message}")]
    Rejected { event: String, message: String },
    #[error("Invalid relay address: {0}")]
    InvalidAddress(String),
    #[error("Malformed ack for {0}")]
    MalformedAck(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] happy_bridge_core::CodecError),
}

/// Bidirectional frame channel to the relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Send a frame without waiting for a reply.
    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError>;

    /// Send a frame and wait for its ack data.
    async fn emit_with_ack(&self, event: &str, data: Value, timeout: Duration) -> Result<Value, TransportError>;

    /// Answer an inbound frame that carried `ack_id`.
    async fn ack(&self, ack_id: u64, data: Value) -> Result<(), TransportError>;

    /// Inbound frames other than acks.
    fn subscribe(&self) -> broadcast::Receiver<Frame>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl<T: RelayTransport + ?Sized> RelayTransport for Arc<T> {
    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        (**self).emit(event, data).await
    }

    async fn emit_with_ack(&self, event: &str, data: Value, timeout: Duration) -> Result<Value, TransportError> {
        (**self).emit_with_ack(event, data, timeout).await
    }

    async fn ack(&self, ack_id: u64, data: Value) -> Result<(), TransportError> {
        (**self).ack(ack_id, data).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        (**self).subscribe()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Sink for transport telemetry.
pub trait TransportObserver: Send + Sync {
    fn on_emit(&self, _event: &str, _ok: bool) {}

    fn on_round_trip(&self, _event: &str, _elapsed: Duration, _ok: bool) {}
}

/// Observer that logs every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TransportObserver for TracingObserver {
    fn on_emit(&self, event: &str, ok: bool) {
        tracing::trace!(event, ok, "Relay emit");
    }

    fn on_round_trip(&self, event: &str, elapsed: Duration, ok: bool) {
        tracing::debug!(event, ok, elapsed_ms = elapsed.as_millis(), "Relay round trip");
    }
}

/// Counters over transport calls.
#[derive(Debug, Default)]
pub struct TransportStats {
    emitted: AtomicU64,
    failed: AtomicU64,
    round_trips: AtomicU64,
    round_trip_micros: AtomicU64,
}

impl TransportStats {
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Mean ack latency, zero before the first round trip.
    #[must_use]
    pub fn mean_round_trip(&self) -> Duration {
        let trips = self.round_trips();
        if trips == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.round_trip_micros.load(Ordering::Relaxed) / trips)
    }
}

impl TransportObserver for TransportStats {
    fn on_emit(&self, _event: &str, ok: bool) {
        let counter = if ok { &self.emitted } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn on_round_trip(&self, _event: &str, elapsed: Duration, ok: bool) {
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.round_trip_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Wraps a transport and reports each call to an observer.
pub struct InstrumentedTransport<T> {
    inner: T,
    observer: Arc<dyn TransportObserver>,
}

impl<T: RelayTransport> InstrumentedTransport<T> {
    pub fn new(inner: T, observer: Arc<dyn TransportObserver>) -> Self {
        Self { inner, observer }
    }

    #[must_use]
    pub const fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: RelayTransport> RelayTransport for InstrumentedTransport<T> {
    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        let result = self.inner.emit(event, data).await;
        self.observer.on_emit(event, result.is_ok());
        result
    }

    async fn emit_with_ack(&self, event: &str, data: Value, timeout: Duration) -> Result<Value, TransportError> {
        let started = Instant::now();
        let result = self.inner.emit_with_ack(event, data, timeout).await;
        self.observer.on_round_trip(event, started.elapsed(), result.is_ok());
        result
    }

    async fn ack(&self, ack_id: u64, data: Value) -> Result<(), TransportError> {
        let result = self.inner.ack(ack_id, data).await;
        self.observer.on_emit(crate::protocol::ACK, result.is_ok());
        result
    }

    fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.inner.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process transport for tests.

    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::broadcast;

    use super::{RelayTransport, TransportError};
    use crate::protocol::Frame;

    type Responder = Box<dyn Fn(&str, &Value) -> Option<Value> + Send + Sync>;

    /// Records every outbound frame. Acks are answered by a responder
    /// closure, or by queued replies.
    pub struct FakeTransport {
        pub sent: Mutex<Vec<Frame>>,
        replies: Mutex<VecDeque<Value>>,
        responder: Mutex<Option<Responder>>,
        inbound: broadcast::Sender<Frame>,
        fail_emits: Mutex<u32>,
    }

    impl FakeTransport {
        pub fn new() -> Arc<Self> {
            let (inbound, _) = broadcast::channel(64);
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                replies: Mutex::new(VecDeque::new()),
                responder: Mutex::new(None),
                inbound,
                fail_emits: Mutex::new(0),
            })
        }

        pub fn queue_reply(&self, reply: Value) {
            self.replies.lock().unwrap().push_back(reply);
        }

        pub fn respond_with<F>(&self, f: F)
        where
            F: Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
        {
            *self.responder.lock().unwrap() = Some(Box::new(f));
        }

        /// Make the next `n` emits fail.
        pub fn fail_next_emits(&self, n: u32) {
            *self.fail_emits.lock().unwrap() = n;
        }

        pub async fn wait_for_subscriber(&self) {
            while self.inbound.receiver_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        pub fn push_inbound(&self, frame: Frame) {
            let _ = self.inbound.send(frame);
        }

        pub fn sent_events(&self, event: &str) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.event == event)
                .map(|f| f.data.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RelayTransport for FakeTransport {
        async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
            {
                let mut fail = self.fail_emits.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(TransportError::Closed);
                }
            }
            self.sent.lock().unwrap().push(Frame::new(event, data));
            Ok(())
        }

        async fn emit_with_ack(&self, event: &str, data: Value, timeout: Duration) -> Result<Value, TransportError> {
            let reply = self
                .responder
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|f| f(event, &data))
                .or_else(|| self.replies.lock().unwrap().pop_front());
            self.sent.lock().unwrap().push(Frame::new(event, data));
            reply.ok_or_else(|| TransportError::AckTimeout {
                event: event.to_string(),
                timeout,
            })
        }

        async fn ack(&self, ack_id: u64, data: Value) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(Frame::ack(ack_id, data));
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<Frame> {
            self.inbound.subscribe()
        }

        fn is_connected(&self) -> bool {
            true
        }
    }
}
