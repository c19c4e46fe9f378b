//! Pending queue of user messages waiting for the agent.
//!
//! Remote clients append messages to the session metadata under
//! `messageQueueV1`; the session loop claims them one at a time. The full
//! state is republished on a watch channel after every mutation so it can be
//! written back to metadata.
//!
//! A local id changed locally stays under local control until a write that
//! includes the change succeeds; every other id follows the relay's listing.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use happy_bridge_core::now_millis;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::reconcile::{LocalId, reconcile};

/// Metadata key of the live queue.
pub const QUEUE_METADATA_KEY: &str = "messageQueueV1";
/// Metadata key of the discard log.
pub const DISCARDED_METADATA_KEY: &str = "messageQueueV1Discarded";
/// Discard log capacity.
pub const DISCARD_LOG_CAPACITY: usize = 50;
/// Discard reason of a message another client took out of the queue.
pub const REMOVED_REMOTELY: &str = "removed by another client";

const QUEUE_FORMAT_VERSION: u32 = 1;

/// A queued user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub local_id: String,
    pub content: Value,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
}

impl PendingMessage {
    #[must_use]
    pub fn new(local_id: impl Into<String>, content: Value) -> Self {
        Self {
            local_id: local_id.into(),
            content,
            created_at: now_millis(),
            claimed_at: None,
        }
    }
}

impl LocalId for PendingMessage {
    fn local_id(&self) -> &str {
        &self.local_id
    }
}

/// A message moved out of the queue without being delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscardedMessage {
    #[serde(flatten)]
    pub message: PendingMessage,
    pub discarded_at: i64,
    pub discarded_reason: String,
}

impl LocalId for DiscardedMessage {
    fn local_id(&self) -> &str {
        &self.message.local_id
    }
}

/// Wire form of `messageQueueV1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub v: u32,
    #[serde(default)]
    pub queue: Vec<PendingMessage>,
    #[serde(default)]
    pub in_flight: Option<PendingMessage>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            v: QUEUE_FORMAT_VERSION,
            queue: Vec::new(),
            in_flight: None,
        }
    }
}

/// Everything the queue persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedQueue {
    pub state: QueueState,
    pub discarded: Vec<DiscardedMessage>,
}

impl PersistedQueue {
    /// Read from session metadata. Missing or malformed fields read as empty.
    #[must_use]
    pub fn from_metadata(metadata: &Value) -> Self {
        let state = metadata
            .get(QUEUE_METADATA_KEY)
            .and_then(|v| serde_json::from_value::<QueueState>(v.clone()).ok())
            .filter(|s| s.v == QUEUE_FORMAT_VERSION)
            .unwrap_or_default();
        let discarded = metadata
            .get(DISCARDED_METADATA_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        Self { state, discarded }
    }

    /// Write into session metadata, leaving other fields untouched.
    ///
    /// # Errors
    /// Returns error if `metadata` is not an object.
    pub fn write_into(&self, metadata: &mut Value) -> Result<(), serde_json::Error> {
        let state = serde_json::to_value(&self.state)?;
        let discarded = serde_json::to_value(&self.discarded)?;
        let Some(obj) = metadata.as_object_mut() else {
            return Err(serde::de::Error::custom("metadata is not an object"));
        };
        obj.insert(QUEUE_METADATA_KEY.to_string(), state);
        obj.insert(DISCARDED_METADATA_KEY.to_string(), discarded);
        Ok(())
    }
}

/// A snapshot to persist, tagged with the last local change it includes.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub generation: u64,
    pub persisted: PersistedQueue,
}

/// The queue and discard log as the relay stores them.
///
/// Entries are `(localId, decoded)` in relay order; `decoded` is `None`
/// when the entry does not parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayListing {
    pub queue: Vec<(String, Option<PendingMessage>)>,
    pub discarded: Vec<(String, Option<DiscardedMessage>)>,
}

impl RelayListing {
    /// `None` when metadata carries neither list.
    #[must_use]
    pub fn from_metadata(metadata: &Value) -> Option<Self> {
        let queue = metadata.get(QUEUE_METADATA_KEY);
        let discarded = metadata.get(DISCARDED_METADATA_KEY);
        if queue.is_none() && discarded.is_none() {
            return None;
        }
        Some(Self {
            queue: listed(queue.and_then(|q| q.get("queue"))),
            discarded: listed(discarded),
        })
    }
}

fn listed<T: DeserializeOwned>(list: Option<&Value>) -> Vec<(String, Option<T>)> {
    let Some(entries) = list.and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let local_id = entry.get("localId")?.as_str()?.to_string();
            Some((local_id, serde_json::from_value(entry.clone()).ok()))
        })
        .collect()
}

/// Result of [`PendingQueue::wait_for_work`].
#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    /// A message was claimed and is now in flight.
    Message(PendingMessage),
    /// Session metadata changed; the caller should re-read it.
    MetadataChanged,
    Cancelled,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<PendingMessage>,
    in_flight: Option<PendingMessage>,
    discarded: VecDeque<DiscardedMessage>,
    /// Local ids changed since the last persisted write, by generation.
    unsynced: HashMap<String, u64>,
    generation: u64,
}

impl State {
    fn touch(&mut self, local_id: &str) {
        self.generation += 1;
        self.unsynced.insert(local_id.to_string(), self.generation);
    }

    fn contains(&self, local_id: &str) -> bool {
        self.in_flight.as_ref().is_some_and(|m| m.local_id == local_id)
            || self.queue.iter().any(|m| m.local_id == local_id)
    }

    fn persisted(&self) -> PersistedQueue {
        PersistedQueue {
            state: QueueState {
                v: QUEUE_FORMAT_VERSION,
                queue: self.queue.iter().cloned().collect(),
                in_flight: self.in_flight.clone(),
            },
            discarded: self.discarded.iter().cloned().collect(),
        }
    }

    fn push_discarded(&mut self, mut message: PendingMessage, reason: &str) {
        message.claimed_at = None;
        self.discarded.push_back(DiscardedMessage {
            message,
            discarded_at: now_millis(),
            discarded_reason: reason.to_string(),
        });
        self.trim_discarded();
    }

    fn trim_discarded(&mut self) {
        while self.discarded.len() > DISCARD_LOG_CAPACITY {
            self.discarded.pop_front();
        }
    }

    /// Apply the relay's listing to every id without an unpersisted local
    /// change. The in-flight message is always left alone.
    fn merge(&mut self, listing: RelayListing) {
        let in_flight = self.in_flight.as_ref().map(|m| m.local_id.clone());
        let governed = |id: &str| !self.unsynced.contains_key(id) && in_flight.as_deref() != Some(id);

        let relay_discarded: Vec<(String, Option<DiscardedMessage>)> =
            listing.discarded.into_iter().filter(|(id, _)| governed(id.as_str())).collect();
        let relay_queue: Vec<(String, Option<PendingMessage>)> = listing
            .queue
            .into_iter()
            .filter(|(id, _)| governed(id.as_str()) && !relay_discarded.iter().any(|(d, _)| d == id))
            .collect();

        let local_queue: Vec<PendingMessage> = self.queue.iter().cloned().collect();
        let local_discarded: Vec<DiscardedMessage> = self.discarded.iter().cloned().collect();
        let mut queue = reconcile(&local_queue, relay_queue);
        let mut discarded = reconcile(&local_discarded, relay_discarded);

        splice_unsynced(&mut queue, &local_queue, &self.unsynced);
        discarded.extend(
            local_discarded
                .into_iter()
                .filter(|d| self.unsynced.contains_key(d.local_id())),
        );

        let removed: Vec<PendingMessage> = local_queue
            .into_iter()
            .filter(|m| {
                governed(m.local_id.as_str())
                    && !queue.iter().any(|q| q.local_id == m.local_id)
                    && !discarded.iter().any(|d| d.local_id() == m.local_id)
            })
            .collect();

        self.queue = queue.into();
        self.discarded = discarded.into();
        self.trim_discarded();
        for message in removed {
            tracing::info!(local_id = %message.local_id, "Pending message removed remotely");
            let local_id = message.local_id.clone();
            self.push_discarded(message, REMOVED_REMOTELY);
            self.touch(&local_id);
        }
    }
}

/// Put each locally changed item back into `merged` right after the item
/// that preceded it locally.
fn splice_unsynced(merged: &mut Vec<PendingMessage>, local: &[PendingMessage], unsynced: &HashMap<String, u64>) {
    let mut anchor: Option<usize> = None;
    for item in local {
        if unsynced.contains_key(&item.local_id) {
            let at = anchor.map_or(0, |i| i + 1);
            merged.insert(at, item.clone());
            anchor = Some(at);
        } else if let Some(i) = merged.iter().position(|m| m.local_id == item.local_id) {
            anchor = Some(i);
        }
    }
}

/// Per-session pending queue with a single in-flight slot.
pub struct PendingQueue {
    state: Mutex<State>,
    snapshot_tx: watch::Sender<PersistedQueue>,
    work: Notify,
    metadata: Notify,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    #[must_use]
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(PersistedQueue::default());
        Self {
            state: Mutex::new(State::default()),
            snapshot_tx,
            work: Notify::new(),
            metadata: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        self.snapshot_tx.send_replace(state.persisted());
    }

    /// Subscribe to persisted snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PersistedQueue> {
        self.snapshot_tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> PersistedQueue {
        self.lock().persisted()
    }

    /// Snapshot for a metadata write. Pass its generation to
    /// [`Self::mark_persisted`] once the write succeeds.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        let state = self.lock();
        Checkpoint {
            generation: state.generation,
            persisted: state.persisted(),
        }
    }

    /// Hand every id changed at or before `generation` back to the relay.
    pub fn mark_persisted(&self, generation: u64) {
        self.lock().unsynced.retain(|_, changed| *changed > generation);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    #[must_use]
    pub fn in_flight(&self) -> Option<PendingMessage> {
        self.lock().in_flight.clone()
    }

    /// Append a message. Returns `false` if its `localId` is already queued
    /// or in flight.
    pub fn enqueue(&self, message: PendingMessage) -> bool {
        let mut state = self.lock();
        if state.contains(&message.local_id) {
            tracing::debug!(local_id = %message.local_id, "Ignoring duplicate pending message");
            return false;
        }
        state.touch(&message.local_id);
        state.queue.push_back(message);
        self.publish(&state);
        drop(state);
        self.work.notify_one();
        true
    }

    /// Move the head of the queue into the in-flight slot.
    ///
    /// Returns `None` if the queue is empty or a message is already in flight.
    pub fn claim(&self) -> Option<PendingMessage> {
        let mut state = self.lock();
        if state.in_flight.is_some() {
            return None;
        }
        let mut message = state.queue.pop_front()?;
        message.claimed_at = Some(now_millis());
        state.touch(&message.local_id);
        state.in_flight = Some(message.clone());
        self.publish(&state);
        Some(message)
    }

    /// Remove a delivered message.
    pub fn consume(&self, local_id: &str) -> bool {
        let mut state = self.lock();
        let removed = if state.in_flight.as_ref().is_some_and(|m| m.local_id == local_id) {
            state.in_flight = None;
            true
        } else {
            let before = state.queue.len();
            state.queue.retain(|m| m.local_id != local_id);
            state.queue.len() != before
        };
        if removed {
            state.touch(local_id);
            self.publish(&state);
            drop(state);
            self.work.notify_one();
        }
        removed
    }

    /// Return the in-flight message to the head of the queue.
    pub fn release(&self, local_id: &str) -> bool {
        let mut state = self.lock();
        if !state.in_flight.as_ref().is_some_and(|m| m.local_id == local_id) {
            return false;
        }
        if let Some(mut message) = state.in_flight.take() {
            message.claimed_at = None;
            state.queue.push_front(message);
        }
        state.touch(local_id);
        self.publish(&state);
        drop(state);
        self.work.notify_one();
        true
    }

    /// Move a queued or in-flight message to the discard log.
    pub fn discard(&self, local_id: &str, reason: &str) -> bool {
        let mut state = self.lock();
        let message = if state.in_flight.as_ref().is_some_and(|m| m.local_id == local_id) {
            state.in_flight.take()
        } else {
            state
                .queue
                .iter()
                .position(|m| m.local_id == local_id)
                .and_then(|i| state.queue.remove(i))
        };
        let Some(message) = message else {
            return false;
        };
        tracing::info!(%local_id, reason, "Discarding pending message");
        state.push_discarded(message, reason);
        state.touch(local_id);
        self.publish(&state);
        drop(state);
        self.work.notify_one();
        true
    }

    /// Load persisted state. A stale in-flight message goes back to the head
    /// of the queue.
    pub fn restore(&self, persisted: PersistedQueue) {
        let mut state = self.lock();
        let PersistedQueue { state: queue_state, discarded } = persisted;
        let mut queue: VecDeque<PendingMessage> = queue_state.queue.into();
        state.unsynced.clear();
        if let Some(mut stale) = queue_state.in_flight {
            tracing::info!(local_id = %stale.local_id, "Requeueing stale in-flight message");
            stale.claimed_at = None;
            queue.retain(|m| m.local_id != stale.local_id);
            state.touch(&stale.local_id);
            queue.push_front(stale);
        }
        state.queue = queue;
        state.in_flight = None;
        state.discarded = discarded.into();
        state.trim_discarded();
        self.publish(&state);
        drop(state);
        self.work.notify_one();
    }

    /// Merge the relay's queue and discard log into local state.
    ///
    /// Ids with a local change the relay has not persisted keep their local
    /// state, as does the in-flight message. For every other id the relay
    /// decides: its queue order and content win, its discard log wins, and
    /// a queued message it lists nowhere is discarded as
    /// [`REMOVED_REMOTELY`].
    pub fn merge_relay(&self, listing: RelayListing) {
        let mut state = self.lock();
        let before = state.persisted();
        state.merge(listing);
        if state.persisted() != before {
            self.publish(&state);
            drop(state);
            self.work.notify_one();
        }
    }

    /// Wake a waiter with [`Work::MetadataChanged`].
    pub fn notify_metadata_changed(&self) {
        self.metadata.notify_one();
    }

    /// Wait until a message can be claimed, metadata changes, or `cancel`
    /// fires. A cancelled wait claims nothing.
    pub async fn wait_for_work(&self, cancel: &CancellationToken) -> Work {
        loop {
            if cancel.is_cancelled() {
                return Work::Cancelled;
            }
            let work = self.work.notified();
            let metadata = self.metadata.notified();
            tokio::pin!(work, metadata);
            work.as_mut().enable();
            metadata.as_mut().enable();

            if let Some(message) = self.claim() {
                return Work::Message(message);
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Work::Cancelled,
                () = &mut metadata => return Work::MetadataChanged,
                () = &mut work => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::json;

    use super::*;

    fn msg(id: &str) -> PendingMessage {
        PendingMessage::new(id, json!({"text": id}))
    }

    #[test]
    fn test_single_in_flight() {
        let queue = PendingQueue::new();
        assert!(queue.enqueue(msg("a")));
        assert!(queue.enqueue(msg("b")));
        assert!(!queue.enqueue(msg("a")));

        let claimed = queue.claim().unwrap();
        assert_eq!(claimed.local_id, "a");
        assert!(claimed.claimed_at.is_some());
        assert_eq!(queue.claim(), None);

        assert!(queue.consume("a"));
        assert_eq!(queue.claim().unwrap().local_id, "b");
    }

    #[test]
    fn test_release_returns_to_head() {
        let queue = PendingQueue::new();
        queue.enqueue(msg("a"));
        queue.enqueue(msg("b"));
        queue.claim();
        assert!(queue.release("a"));
        assert!(!queue.release("a"));
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.state.queue[0].local_id, "a");
        assert_eq!(snapshot.state.queue[0].claimed_at, None);
        assert_eq!(snapshot.state.in_flight, None);
    }

    #[test]
    fn test_discard_log_is_bounded() {
        let queue = PendingQueue::new();
        for i in 0..60 {
            let id = format!("m{i}");
            queue.enqueue(msg(&id));
            assert!(queue.discard(&id, "agent exited"));
        }
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.discarded.len(), DISCARD_LOG_CAPACITY);
        assert_eq!(snapshot.discarded[0].message.local_id, "m10");
        assert_eq!(snapshot.discarded[0].discarded_reason, "agent exited");
        assert!(!queue.discard("missing", "x"));
    }

    #[test]
    fn test_restore_requeues_stale_in_flight() {
        let queue = PendingQueue::new();
        let mut stale = msg("a");
        stale.claimed_at = Some(1);
        queue.restore(PersistedQueue {
            state: QueueState {
                v: 1,
                queue: vec![msg("b")],
                in_flight: Some(stale),
            },
            discarded: Vec::new(),
        });
        assert_eq!(queue.in_flight(), None);
        assert_eq!(queue.claim().unwrap().local_id, "a");
    }

    #[test]
    fn test_metadata_round_trip_keeps_other_fields() {
        let queue = PendingQueue::new();
        queue.enqueue(msg("a"));
        queue.claim();
        queue.enqueue(msg("b"));

        let mut metadata = json!({"path": "/repo"});
        queue.snapshot().write_into(&mut metadata).unwrap();
        assert_eq!(metadata["path"], "/repo");
        assert_eq!(metadata["messageQueueV1"]["v"], 1);
        assert_eq!(metadata["messageQueueV1"]["inFlight"]["localId"], "a");
        assert_eq!(metadata["messageQueueV1"]["queue"][0]["localId"], "b");

        assert_eq!(PersistedQueue::from_metadata(&metadata), queue.snapshot());
        assert_eq!(PersistedQueue::from_metadata(&json!({})), PersistedQueue::default());
    }

    #[test]
    fn test_snapshots_published() {
        let queue = PendingQueue::new();
        let rx = queue.subscribe();
        queue.enqueue(msg("a"));
        assert_eq!(rx.borrow().state.queue.len(), 1);
    }

    fn queued(entries: &[&str]) -> RelayListing {
        RelayListing {
            queue: entries.iter().map(|id| ((*id).to_string(), Some(msg(id)))).collect(),
            discarded: Vec::new(),
        }
    }

    fn discarded_entry(id: &str, reason: &str) -> (String, Option<DiscardedMessage>) {
        let entry = DiscardedMessage {
            message: msg(id),
            discarded_at: 1,
            discarded_reason: reason.into(),
        };
        (id.to_string(), Some(entry))
    }

    fn queue_ids(queue: &PendingQueue) -> Vec<String> {
        queue.snapshot().state.queue.into_iter().map(|m| m.local_id).collect()
    }

    fn discarded_ids(queue: &PendingQueue) -> Vec<String> {
        queue
            .snapshot()
            .discarded
            .into_iter()
            .map(|d| d.message.local_id)
            .collect()
    }

    fn persist(queue: &PendingQueue) {
        queue.mark_persisted(queue.checkpoint().generation);
    }

    #[test]
    fn test_unpersisted_message_survives_stale_listing() {
        let queue = PendingQueue::new();
        queue.enqueue(msg("a"));
        queue.claim();
        queue.enqueue(msg("b"));
        queue.merge_relay(RelayListing::default());
        assert_eq!(queue_ids(&queue), vec!["b"]);
        assert_eq!(queue.in_flight().unwrap().local_id, "a");

        let queue = PendingQueue::new();
        queue.enqueue(msg("a"));
        persist(&queue);
        queue.enqueue(msg("b"));
        queue.merge_relay(queued(&["a"]));
        assert_eq!(queue_ids(&queue), vec!["a", "b"]);
        assert!(discarded_ids(&queue).is_empty());
    }

    #[test]
    fn test_merge_relay_follows_relay_for_persisted_ids() {
        let queue = PendingQueue::new();
        queue.enqueue(msg("a"));
        queue.claim();
        queue.enqueue(msg("b"));
        queue.enqueue(msg("gone"));
        persist(&queue);

        let mut edited = msg("c");
        edited.content = json!({"text": "edited"});
        queue.merge_relay(RelayListing {
            queue: vec![
                ("a".into(), Some(msg("a"))),
                ("c".into(), Some(edited)),
                ("b".into(), None),
            ],
            discarded: Vec::new(),
        });

        let snapshot = queue.snapshot();
        assert_eq!(queue_ids(&queue), vec!["c", "b"]);
        assert_eq!(snapshot.state.queue[0].content, json!({"text": "edited"}));
        assert_eq!(queue.in_flight().unwrap().local_id, "a");
        assert_eq!(snapshot.discarded[0].message.local_id, "gone");
        assert_eq!(snapshot.discarded[0].discarded_reason, REMOVED_REMOTELY);
    }

    #[test]
    fn test_persisted_generation_bounds_local_control() {
        let queue = PendingQueue::new();
        queue.enqueue(msg("a"));
        let checkpoint = queue.checkpoint();
        queue.enqueue(msg("b"));
        queue.mark_persisted(checkpoint.generation);

        queue.merge_relay(queued(&[]));
        assert_eq!(queue_ids(&queue), vec!["b"]);
        assert_eq!(discarded_ids(&queue), vec!["a"]);
    }

    #[test]
    fn test_consumed_message_is_not_requeued_by_stale_listing() {
        let queue = PendingQueue::new();
        queue.enqueue(msg("a"));
        persist(&queue);
        queue.claim();
        queue.consume("a");
        queue.merge_relay(queued(&["a"]));
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), None);
    }

    #[test]
    fn test_relay_discard_log_is_reconciled() {
        let queue = PendingQueue::new();
        for id in ["a", "b", "r"] {
            queue.enqueue(msg(id));
        }
        queue.discard("r", "agent exited");
        persist(&queue);
        queue.enqueue(msg("l"));
        queue.discard("l", "unreadable content");

        queue.merge_relay(RelayListing {
            queue: vec![("r".into(), Some(msg("r"))), ("b".into(), Some(msg("b")))],
            discarded: vec![discarded_entry("a", "cancelled")],
        });

        assert_eq!(queue_ids(&queue), vec!["r", "b"]);
        let snapshot = queue.snapshot();
        assert_eq!(discarded_ids(&queue), vec!["a", "l"]);
        assert_eq!(snapshot.discarded[0].discarded_reason, "cancelled");

        let flood = (0..60).map(|i| discarded_entry(&format!("d{i}"), "x")).collect();
        queue.merge_relay(RelayListing {
            queue: vec![("r".into(), None), ("b".into(), None)],
            discarded: flood,
        });
        let discarded = discarded_ids(&queue);
        assert_eq!(discarded.len(), DISCARD_LOG_CAPACITY);
        assert_eq!(discarded.last().map(String::as_str), Some("l"));
        assert_eq!(queue_ids(&queue), vec!["r", "b"]);
    }

    #[test]
    fn test_relay_listing_from_metadata() {
        let metadata = json!({
            QUEUE_METADATA_KEY: {"v": 1, "queue": [
                {"localId": "a", "content": "x", "createdAt": 1},
                {"localId": "b", "content": "y"},
                {"nope": true}
            ]},
            DISCARDED_METADATA_KEY: [
                {"localId": "d", "content": "z", "createdAt": 1, "discardedAt": 2, "discardedReason": "cancelled"}
            ]
        });
        let listing = RelayListing::from_metadata(&metadata).unwrap();
        assert_eq!(listing.queue.len(), 2);
        assert_eq!(listing.queue[0].0, "a");
        assert!(listing.queue[0].1.is_some());
        assert_eq!(listing.queue[1].0, "b");
        assert!(listing.queue[1].1.is_none());
        assert_eq!(listing.discarded[0].1.as_ref().unwrap().discarded_reason, "cancelled");

        assert_eq!(RelayListing::from_metadata(&json!({"path": "/repo"})), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_work_claims_on_enqueue() {
        let queue = Arc::new(PendingQueue::new());
        let cancel = CancellationToken::new();
        let waiter = tokio::spawn({
            let queue = queue.clone();
            let cancel = cancel.clone();
            async move { queue.wait_for_work(&cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(msg("a"));
        assert!(matches!(waiter.await.unwrap(), Work::Message(m) if m.local_id == "a"));
        assert_eq!(queue.in_flight().unwrap().local_id, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_work_metadata_and_cancel() {
        let queue = Arc::new(PendingQueue::new());
        let cancel = CancellationToken::new();

        queue.notify_metadata_changed();
        assert_eq!(queue.wait_for_work(&cancel).await, Work::MetadataChanged);

        let waiter = tokio::spawn({
            let queue = queue.clone();
            let cancel = cancel.clone();
            async move { queue.wait_for_work(&cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Work::Cancelled);

        queue.enqueue(msg("late"));
        assert_eq!(queue.wait_for_work(&cancel).await, Work::Cancelled);
        assert_eq!(queue.in_flight(), None);
        assert_eq!(queue.len(), 1);
    }
}
