//! Relay client for one session.
//!
//! Encrypts outbound messages, applies inbound updates to the local
//! [`Session`] and writes metadata and agent state optimistically.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use happy_bridge_core::{
    ApplyOutcome, DecodedMessage, EnvelopeCodec, MessageLog, MessageRecord, OutboundMessage, Session,
    UpdateBody, UpdateContainer, Versioned, now_millis, session::EncryptedVersioned,
};
use serde_json::{Value, json};

use crate::{
    protocol::{
        MESSAGE, SESSION_ALIVE, SESSION_END, SessionAlive, UPDATE_METADATA, UPDATE_STATE, UpdateMetadataRequest,
        UpdateStateRequest, VersionedWriteAck, WriteResult,
    },
    transport::{RelayTransport, TransportError},
};

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Version-mismatch retries before a write gives up.
pub const MAX_VERSION_RETRIES: u32 = 8;

/// What an inbound update changed.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    Message(DecodedMessage),
    Metadata,
    AgentState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Metadata,
    AgentState,
}

impl Slot {
    const fn event(self) -> &'static str {
        match self {
            Self::Metadata => UPDATE_METADATA,
            Self::AgentState => UPDATE_STATE,
        }
    }
}

/// One session's view of the relay.
pub struct SessionClient<T> {
    transport: T,
    session: Mutex<Session>,
    log: MessageLog,
    ack_timeout: Duration,
}

impl<T: RelayTransport> SessionClient<T> {
    pub fn new(session: Session, transport: T) -> Self {
        Self {
            transport,
            session: Mutex::new(session),
            log: MessageLog::new(),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        self.session().id().to_string()
    }

    #[must_use]
    pub fn codec(&self) -> EnvelopeCodec {
        self.session().codec().clone()
    }

    #[must_use]
    pub fn metadata(&self) -> Option<Versioned<Value>> {
        self.session().metadata().cloned()
    }

    #[must_use]
    pub fn agent_state(&self) -> Option<Versioned<Value>> {
        self.session().agent_state().cloned()
    }

    /// Messages received for this session.
    #[must_use]
    pub const fn log(&self) -> &MessageLog {
        &self.log
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Encrypt and send one message record.
    ///
    /// # Errors
    /// Returns error if encryption or the transport fails.
    pub async fn send_message(&self, record: &MessageRecord, local_id: Option<String>) -> Result<(), TransportError> {
        let (sid, message) = {
            let session = self.session();
            (session.id().to_string(), session.codec().encrypt(record)?)
        };
        let data = serde_json::to_value(OutboundMessage { sid, message, local_id })?;
        self.transport.emit(MESSAGE, data).await
    }

    /// # Errors
    /// Returns error if the transport fails.
    pub async fn keep_alive(&self, thinking: bool) -> Result<(), TransportError> {
        let data = serde_json::to_value(SessionAlive {
            sid: self.session_id(),
            time: now_millis(),
            thinking,
        })?;
        self.transport.emit(SESSION_ALIVE, data).await
    }

    /// # Errors
    /// Returns error if the transport fails.
    pub async fn send_session_end(&self) -> Result<(), TransportError> {
        let data = json!({ "sid": self.session_id(), "time": now_millis() });
        self.transport.emit(SESSION_END, data).await
    }

    /// Apply an inbound update. Updates for other sessions, stale versions
    /// and replayed messages change nothing.
    pub fn handle_update(&self, update: &UpdateContainer) -> Vec<SessionChange> {
        let mut changes = Vec::new();
        let mut session = self.session();
        if update.body.session_id() != Some(session.id()) {
            return changes;
        }
        match &update.body {
            UpdateBody::NewMessage { message, .. } => {
                let decoded = message.decode(session.codec());
                drop(session);
                if self.log.insert(decoded.clone()) {
                    changes.push(SessionChange::Message(decoded));
                }
            }
            UpdateBody::NewSession {
                metadata, agent_state, ..
            }
            | UpdateBody::UpdateSession {
                metadata, agent_state, ..
            } => {
                if metadata
                    .as_ref()
                    .is_some_and(|m| session.apply_metadata(m) == ApplyOutcome::Applied)
                {
                    changes.push(SessionChange::Metadata);
                }
                if agent_state
                    .as_ref()
                    .is_some_and(|s| session.apply_agent_state(s) == ApplyOutcome::Applied)
                {
                    changes.push(SessionChange::AgentState);
                }
            }
            UpdateBody::Unknown => {}
        }
        changes
    }

    /// Replace metadata with `f(current)`, retrying on version mismatch
    /// against the relay's value.
    ///
    /// # Errors
    /// Returns error if the transport fails, the relay rejects the write,
    /// or the version keeps moving.
    pub async fn update_metadata<F>(&self, f: F) -> Result<Versioned<Value>, TransportError>
    where
        F: Fn(Value) -> Value + Send + Sync,
    {
        self.versioned_write(Slot::Metadata, f).await
    }

    /// Replace agent state with `f(current)`, retrying on version mismatch.
    ///
    /// # Errors
    /// Same as [`Self::update_metadata`].
    pub async fn update_agent_state<F>(&self, f: F) -> Result<Versioned<Value>, TransportError>
    where
        F: Fn(Value) -> Value + Send + Sync,
    {
        self.versioned_write(Slot::AgentState, f).await
    }

    async fn versioned_write<F>(&self, slot: Slot, f: F) -> Result<Versioned<Value>, TransportError>
    where
        F: Fn(Value) -> Value + Send + Sync,
    {
        let event = slot.event();
        for attempt in 0..=MAX_VERSION_RETRIES {
            let (sid, version, next, ciphertext) = {
                let session = self.session();
                let held = match slot {
                    Slot::Metadata => session.metadata(),
                    Slot::AgentState => session.agent_state(),
                };
                let version = held.map_or(0, |v| v.version);
                let next = f(held.map_or(Value::Null, |v| v.value.clone()));
                let ciphertext = session.codec().encrypt(&next)?;
                (session.id().to_string(), version, next, ciphertext)
            };

            let data = match slot {
                Slot::Metadata => serde_json::to_value(UpdateMetadataRequest {
                    sid,
                    expected_version: version,
                    metadata: ciphertext,
                })?,
                Slot::AgentState => serde_json::to_value(UpdateStateRequest {
                    sid,
                    expected_version: version,
                    agent_state: Some(ciphertext),
                })?,
            };
            let reply = self.transport.emit_with_ack(event, data, self.ack_timeout).await?;
            let ack: VersionedWriteAck =
                serde_json::from_value(reply).map_err(|_| TransportError::MalformedAck(event.to_string()))?;

            match ack.result {
                WriteResult::Success => {
                    let written = Versioned::new(ack.version.unwrap_or(version + 1), next);
                    let mut session = self.session();
                    match slot {
                        Slot::Metadata => session.set_metadata(written.clone()),
                        Slot::AgentState => session.set_agent_state(written.clone()),
                    };
                    return Ok(written);
                }
                WriteResult::VersionMismatch => {
                    let relay_version = ack
                        .version
                        .ok_or_else(|| TransportError::MalformedAck(event.to_string()))?;
                    tracing::debug!(event, attempt, expected = version, relay_version, "Version mismatch, adopting relay value");
                    self.adopt(slot, relay_version, &ack);
                }
                WriteResult::Error => {
                    return Err(TransportError::Rejected {
                        event: event.to_string(),
                        message: ack.message.unwrap_or_default(),
                    });
                }
            }
        }
        Err(TransportError::Rejected {
            event: event.to_string(),
            message: format!("version still moving after {MAX_VERSION_RETRIES} retries"),
        })
    }

    fn adopt(&self, slot: Slot, version: u64, ack: &VersionedWriteAck) {
        let mut session = self.session();
        let ciphertext = match slot {
            Slot::Metadata => ack.metadata.clone(),
            Slot::AgentState => ack.agent_state.clone(),
        };
        let outcome = match (slot, ciphertext) {
            (Slot::Metadata, Some(value)) => session.apply_metadata(&EncryptedVersioned::new(version, value)),
            (Slot::AgentState, Some(value)) => session.apply_agent_state(&EncryptedVersioned::new(version, value)),
            (Slot::Metadata, None) => session.set_metadata(Versioned::new(version, Value::Null)),
            (Slot::AgentState, None) => session.set_agent_state(Versioned::new(version, Value::Null)),
        };
        if outcome != ApplyOutcome::Applied {
            tracing::warn!(event = slot.event(), version, ?outcome, "Relay value not adopted");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use happy_bridge_core::{EncryptionVariant, MessageEnvelope, SessionKey, envelope::EnvelopeContent};

    use super::*;
    use crate::transport::testing::FakeTransport;

    fn client() -> (SessionClient<Arc<FakeTransport>>, Arc<FakeTransport>, EnvelopeCodec) {
        let session = Session::new("s1", SessionKey::generate(), EncryptionVariant::DataKey).unwrap();
        let codec = session.codec().clone();
        let fake = FakeTransport::new();
        (SessionClient::new(session, fake.clone()), fake, codec)
    }

    fn update(body: UpdateBody) -> UpdateContainer {
        UpdateContainer {
            id: "u".into(),
            seq: 1,
            created_at: 0,
            body,
        }
    }

    #[tokio::test]
    async fn test_send_message_is_encrypted() {
        let (client, fake, codec) = client();
        client
            .send_message(&MessageRecord::user_text("hi"), Some("l1".into()))
            .await
            .unwrap();
        let sent = fake.sent_events(MESSAGE);
        assert_eq!(sent[0]["sid"], "s1");
        assert_eq!(sent[0]["localId"], "l1");
        let record: MessageRecord = codec.decrypt(sent[0]["message"].as_str().unwrap()).unwrap();
        assert_eq!(record, MessageRecord::user_text("hi"));
    }

    #[test]
    fn test_update_session_discards_stale() {
        let (client, _, codec) = client();
        let v = |version, value: Value| EncryptedVersioned::new(version, codec.encrypt(&value).unwrap());
        let body = |m| UpdateBody::UpdateSession {
            id: "s1".into(),
            agent_state: None,
            metadata: Some(m),
        };

        assert_eq!(client.handle_update(&update(body(v(2, json!("b"))))), vec![SessionChange::Metadata]);
        assert!(client.handle_update(&update(body(v(1, json!("a"))))).is_empty());
        assert!(client.handle_update(&update(body(v(2, json!("c"))))).is_empty());
        assert_eq!(client.metadata(), Some(Versioned::new(2, json!("b"))));

        let other = UpdateBody::UpdateSession {
            id: "s2".into(),
            agent_state: None,
            metadata: Some(v(9, json!("x"))),
        };
        assert!(client.handle_update(&update(other)).is_empty());
    }

    #[test]
    fn test_new_message_logged_once() {
        let (client, _, codec) = client();
        let message = MessageEnvelope {
            id: "m1".into(),
            seq: 4,
            local_id: None,
            content: EnvelopeContent::Encrypted {
                c: codec.encrypt(&MessageRecord::user_text("go")).unwrap(),
            },
            created_at: 0,
        };
        let body = UpdateBody::NewMessage {
            sid: "s1".into(),
            message,
        };
        let changes = client.handle_update(&update(body.clone()));
        assert!(matches!(&changes[..], [SessionChange::Message(m)] if m.content.is_some()));
        assert!(client.handle_update(&update(body)).is_empty());
        assert_eq!(client.log().last_seq(), Some(4));
    }

    #[tokio::test]
    async fn test_metadata_write_retries_on_mismatch() {
        let (client, fake, codec) = client();
        let relay_version = Arc::new(AtomicU64::new(3));
        let relay = codec.clone();
        let version = relay_version.clone();
        fake.respond_with(move |_, data| {
            let current = version.load(Ordering::SeqCst);
            if data["expectedVersion"].as_u64() == Some(current) {
                version.store(current + 1, Ordering::SeqCst);
                Some(json!({"result": "success", "version": current + 1}))
            } else {
                Some(json!({
                    "result": "version-mismatch",
                    "version": current,
                    "metadata": relay.encrypt(&json!({"remote": true})).unwrap()
                }))
            }
        });

        let written = client
            .update_metadata(|mut current| {
                if !current.is_object() {
                    current = json!({});
                }
                current["local"] = json!(true);
                current
            })
            .await
            .unwrap();

        assert_eq!(written.version, 4);
        assert_eq!(written.value, json!({"remote": true, "local": true}));
        assert_eq!(client.metadata(), Some(written));
        assert_eq!(fake.sent_events(UPDATE_METADATA).len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_write_surfaces() {
        let (client, fake, _) = client();
        fake.queue_reply(json!({"result": "error", "message": "forbidden"}));
        let err = client.update_agent_state(|v| v).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { message, .. } if message == "forbidden"));
        assert_eq!(client.agent_state(), None);
    }
}
