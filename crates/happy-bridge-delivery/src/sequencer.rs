//! Per-session sequence allocation.

use futures::FutureExt;
use happy_bridge_core::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::storage::{TransactionalStore, TxError, in_tx};

const BROADCAST_CAPACITY: usize = 256;

/// An update with its allocated sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedUpdate {
    pub id: String,
    pub session_id: String,
    pub seq: u64,
    pub created_at: i64,
    pub body: Value,
}

fn seq_key(session_id: &str) -> String {
    format!("session/{session_id}/seq")
}

fn update_key(session_id: &str, seq: u64) -> String {
    format!("session/{session_id}/update/{seq:020}")
}

/// Allocates increasing `seq` per session and broadcasts committed updates.
///
/// The broadcast happens in an after-commit hook, so subscribers never see
/// an update whose transaction was retried or rolled back.
pub struct SessionSequencer<S> {
    store: S,
    updates: broadcast::Sender<SequencedUpdate>,
}

impl<S: TransactionalStore> SessionSequencer<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { store, updates }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Subscribe to committed updates of every session.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SequencedUpdate> {
        self.updates.subscribe()
    }

    /// Persist `body` as the next update of `session_id`.
    ///
    /// # Errors
    /// Returns error if the transaction fails or keeps conflicting.
    pub async fn append(&self, session_id: &str, body: Value) -> Result<SequencedUpdate, TxError> {
        let session_id = session_id.to_string();
        let updates = self.updates.clone();
        in_tx(&self.store, move |ctx| {
            let session_id = session_id.clone();
            let body = body.clone();
            let updates = updates.clone();
            async move {
                let key = seq_key(&session_id);
                let seq = ctx
                    .get(&key)
                    .await?
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
                    + 1;
                ctx.put(&key, json!(seq)).await?;

                let update = SequencedUpdate {
                    id: Uuid::new_v4().to_string(),
                    session_id: session_id.clone(),
                    seq,
                    created_at: now_millis(),
                    body,
                };
                ctx.put(&update_key(&session_id, seq), serde_json::to_value(&update)?)
                    .await?;

                let committed = update.clone();
                ctx.after_commit(move || {
                    async move {
                        // No subscribers is fine.
                        let _ = updates.send(committed);
                        Ok(())
                    }
                    .boxed()
                });
                Ok(update)
            }
            .boxed()
        })
        .await
    }

    /// Highest allocated `seq` of a session, 0 if none.
    ///
    /// # Errors
    /// Returns error if the read fails.
    pub async fn last_seq(&self, session_id: &str) -> Result<u64, TxError> {
        let key = seq_key(session_id);
        in_tx(&self.store, move |ctx| {
            let key = key.clone();
            async move { Ok(ctx.get(&key).await?.and_then(|v| v.as_u64()).unwrap_or(0)) }.boxed()
        })
        .await
    }

    /// Updates of a session with `seq > after`, in order.
    ///
    /// # Errors
    /// Returns error if a read fails or a stored update is malformed.
    pub async fn updates_after(&self, session_id: &str, after: u64) -> Result<Vec<SequencedUpdate>, TxError> {
        let session_id = session_id.to_string();
        in_tx(&self.store, move |ctx| {
            let session_id = session_id.clone();
            async move {
                let last = ctx
                    .get(&seq_key(&session_id))
                    .await?
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let mut out: Vec<SequencedUpdate> = Vec::new();
                for seq in after + 1..=last {
                    if let Some(value) = ctx.get(&update_key(&session_id, seq)).await? {
                        out.push(serde_json::from_value(value)?);
                    }
                }
                Ok(out)
            }
            .boxed()
        })
        .await
    }
}
