//! Seq-ordered message history with live broadcast.

use std::{
    collections::{BTreeMap, HashSet},
    sync::RwLock,
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::envelope::DecodedMessage;

/// Default number of messages kept in history.
const HISTORY_LIMIT: usize = 5_000;

struct Inner {
    by_seq: BTreeMap<u64, DecodedMessage>,
    ids: HashSet<String>,
}

/// Message log for one session.
///
/// Messages are ordered by relay `seq`, never by arrival. Replays of an id
/// already held are ignored, so catch-up fetches after a reconnect can overlap
/// with live updates.
pub struct MessageLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<DecodedMessage>,
    limit: usize,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    /// Create a log with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(HISTORY_LIMIT)
    }

    /// Create a log keeping at most `limit` messages.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                by_seq: BTreeMap::new(),
                ids: HashSet::new(),
            }),
            sender,
            limit: limit.max(1),
        }
    }

    /// Insert a message. Returns `false` if its id or seq was already held.
    pub fn insert(&self, msg: DecodedMessage) -> bool {
        {
            let Ok(mut inner) = self.inner.write() else {
                tracing::error!("Message log lock poisoned");
                return false;
            };
            if inner.ids.contains(&msg.id) || inner.by_seq.contains_key(&msg.seq) {
                return false;
            }
            inner.ids.insert(msg.id.clone());
            inner.by_seq.insert(msg.seq, msg.clone());
            while inner.by_seq.len() > self.limit {
                if let Some((_, evicted)) = inner.by_seq.pop_first() {
                    inner.ids.remove(&evicted.id);
                }
            }
        }
        let _ = self.sender.send(msg);
        true
    }

    /// Highest seq held, used to resume fetching after a reconnect.
    #[must_use]
    pub fn last_seq(&self) -> Option<u64> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.by_seq.keys().next_back().copied())
    }

    /// Number of messages held, including unreadable ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.by_seq.len()).unwrap_or(0)
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a receiver for live inserts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DecodedMessage> {
        self.sender.subscribe()
    }

    /// Snapshot of the history in seq order.
    #[must_use]
    pub fn history(&self) -> Vec<DecodedMessage> {
        self.inner
            .read()
            .map(|inner| inner.by_seq.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stream that yields history first, then live inserts with a higher seq.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, DecodedMessage> {
        let rx = self.subscribe();
        let history = self.history();
        let floor = history.last().map(|m| m.seq);

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(move |res| async move {
            res.ok().filter(|m| floor.is_none_or(|floor| m.seq > floor))
        });

        Box::pin(hist.chain(live))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn msg(id: &str, seq: u64) -> DecodedMessage {
        DecodedMessage {
            id: id.into(),
            seq,
            local_id: None,
            created_at: 0,
            content: Some(json!({"n": seq})),
        }
    }

    #[test]
    fn test_history_is_ordered_by_seq() {
        let log = MessageLog::new();
        log.insert(msg("c", 3));
        log.insert(msg("a", 1));
        log.insert(msg("b", 2));
        let seqs: Vec<u64> = log.history().iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(log.last_seq(), Some(3));
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let log = MessageLog::new();
        assert!(log.insert(msg("a", 1)));
        assert!(!log.insert(msg("a", 1)));
        assert!(!log.insert(msg("other", 1)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_unreadable_messages_are_counted() {
        let log = MessageLog::new();
        let mut unreadable = msg("x", 4);
        unreadable.content = None;
        log.insert(unreadable);
        assert_eq!(log.len(), 1);
        assert!(log.history()[0].content.is_none());
    }

    #[test]
    fn test_limit_evicts_lowest_seq() {
        let log = MessageLog::with_limit(2);
        log.insert(msg("a", 1));
        log.insert(msg("b", 2));
        log.insert(msg("c", 3));
        let ids: Vec<String> = log.history().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(log.insert(msg("a", 1)));
    }

    #[test]
    fn test_duplicates_are_not_broadcast() {
        let log = MessageLog::new();
        let mut rx = log.subscribe();
        log.insert(msg("a", 1));
        log.insert(msg("a", 1));

        let mut first = tokio_test::task::spawn(rx.recv());
        assert_eq!(tokio_test::assert_ready!(first.poll()).unwrap().id, "a");
        drop(first);
        let mut second = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(second.poll());
    }

    #[tokio::test]
    async fn test_history_plus_stream() {
        let log = MessageLog::new();
        log.insert(msg("a", 1));
        let mut stream = log.history_plus_stream();
        log.insert(msg("b", 2));
        assert_eq!(stream.next().await.unwrap().id, "a");
        assert_eq!(stream.next().await.unwrap().id, "b");
    }
}
