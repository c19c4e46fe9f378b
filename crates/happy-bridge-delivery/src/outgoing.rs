//! Outgoing message queue with per-item delays.
//!
//! Items without a delay are released at once, in enqueue order. A delayed
//! item is released when its timer fires or when one of its gating tool call
//! ids is released, whichever comes first, and never twice.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};

/// Release options of one item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    /// Tool call ids whose release also releases this item.
    pub tool_call_ids: Vec<String>,
}

impl EnqueueOptions {
    #[must_use]
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            tool_call_ids: Vec::new(),
        }
    }

    #[must_use]
    pub fn gated_on(mut self, tool_call_id: impl Into<String>) -> Self {
        self.tool_call_ids.push(tool_call_id.into());
        self
    }
}

struct Delayed<T> {
    payload: T,
    tool_call_ids: Vec<String>,
    timer: Option<JoinHandle<()>>,
}

struct Inner<T> {
    next_seq: u64,
    delayed: BTreeMap<u64, Delayed<T>>,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Inner<T> {
    fn emit(&self, payload: T) {
        if self.tx.send(payload).is_err() {
            tracing::debug!("Outgoing receiver dropped");
        }
    }

    fn release_where(&mut self, mut pred: impl FnMut(&Delayed<T>) -> bool) -> usize {
        let seqs: Vec<u64> = self
            .delayed
            .iter()
            .filter(|(_, item)| pred(item))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &seqs {
            if let Some(item) = self.delayed.remove(seq) {
                if let Some(timer) = item.timer {
                    timer.abort();
                }
                self.emit(item.payload);
            }
        }
        seqs.len()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        for item in self.delayed.values_mut() {
            if let Some(timer) = item.timer.take() {
                timer.abort();
            }
        }
    }
}

/// Outgoing queue feeding an unbounded channel.
pub struct OutgoingQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Send + 'static> OutgoingQueue<T> {
    /// Create a queue and the receiver of released items.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            next_seq: 0,
            delayed: BTreeMap::new(),
            tx,
        };
        (
            Self {
                inner: Arc::new(Mutex::new(inner)),
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        lock(&self.inner)
    }

    /// Queue an item.
    pub fn enqueue(&self, payload: T, options: EnqueueOptions) {
        let mut inner = self.lock();
        let Some(delay) = options.delay.filter(|d| !d.is_zero()) else {
            inner.emit(payload);
            return;
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let weak = Arc::downgrade(&self.inner);
        inner.delayed.insert(
            seq,
            Delayed {
                payload,
                tool_call_ids: options.tool_call_ids,
                timer: None,
            },
        );
        let timer = tokio::spawn(fire_after(weak, seq, delay));
        if let Some(item) = inner.delayed.get_mut(&seq) {
            item.timer = Some(timer);
        }
    }

    /// Release every delayed item gated on `tool_call_id`.
    pub fn release(&self, tool_call_id: &str) -> usize {
        self.lock()
            .release_where(|item| item.tool_call_ids.iter().any(|id| id == tool_call_id))
    }

    /// Release every delayed item now, in enqueue order.
    pub fn flush(&self) -> usize {
        self.lock().release_where(|_| true)
    }

    /// Number of delayed items still held.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().delayed.len()
    }
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn fire_after<T>(inner: Weak<Mutex<Inner<T>>>, seq: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut guard = lock(&inner);
    if let Some(item) = guard.delayed.remove(&seq) {
        guard.emit(item.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_immediate_not_blocked_by_delayed() {
        let (queue, mut rx) = OutgoingQueue::new();
        queue.enqueue("A", EnqueueOptions::delayed(Duration::from_secs(5)).gated_on("t1"));
        queue.enqueue("B", EnqueueOptions::default());

        assert_eq!(rx.recv().await, Some("B"));
        assert!(rx.try_recv().is_err());

        assert_eq!(queue.release("t1"), 1);
        assert_eq!(rx.recv().await, Some("A"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_expiry_releases_once() {
        let (queue, mut rx) = OutgoingQueue::new();
        queue.enqueue(1, EnqueueOptions::delayed(Duration::from_millis(100)).gated_on("t1"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(queue.release("t1"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_timers() {
        let (queue, mut rx) = OutgoingQueue::new();
        queue.enqueue("slow", EnqueueOptions::delayed(Duration::from_millis(300)));
        queue.enqueue("fast", EnqueueOptions::delayed(Duration::from_millis(100)));
        assert_eq!(rx.recv().await, Some("fast"));
        assert_eq!(rx.recv().await, Some("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_in_enqueue_order() {
        let (queue, mut rx) = OutgoingQueue::new();
        queue.enqueue(1, EnqueueOptions::delayed(Duration::from_secs(3)));
        queue.enqueue(2, EnqueueOptions::delayed(Duration::from_secs(1)));
        queue.enqueue(3, EnqueueOptions::delayed(Duration::from_secs(2)));
        assert_eq!(queue.flush(), 3);
        assert_eq!(queue.pending(), 0);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_is_immediate() {
        let (queue, mut rx) = OutgoingQueue::new();
        queue.enqueue("x", EnqueueOptions::delayed(Duration::ZERO));
        assert_eq!(rx.try_recv().ok(), Some("x"));
    }
}
