//! Session model with versioned, encrypted metadata and agent state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::{CodecError, EncryptionVariant, EnvelopeCodec, SessionKey};

/// Relay-assigned session identifier.
pub type SessionId = String;

/// A value tagged with an optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

impl<T> Versioned<T> {
    /// Create a versioned value.
    #[must_use]
    pub const fn new(version: u64, value: T) -> Self {
        Self { version, value }
    }

    /// Whether this value should replace one held at `held` version.
    #[must_use]
    pub fn is_newer_than(&self, held: Option<u64>) -> bool {
        held.is_none_or(|held| self.version > held)
    }
}

/// Wire form of metadata and agent state: `value` is ciphertext.
pub type EncryptedVersioned = Versioned<String>;

/// Session construction error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session id is empty")]
    EmptyId,
    #[error("Session {0} has no encryption key")]
    MissingEncryptionKey(SessionId),
    #[error("Invalid encryption key: {0}")]
    InvalidKey(#[from] CodecError),
}

/// Result of offering a remote update to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update was newer and readable; it replaced the held value.
    Applied,
    /// The update's version was not strictly newer; it was ignored.
    Stale,
    /// The update was newer but could not be decrypted; it was ignored.
    Unreadable,
}

/// Minimum record needed to open a session, as handed over by the relay or
/// by the process that created the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    pub id: SessionId,
    /// Base64 session key.
    #[serde(default)]
    pub encryption_key: Option<String>,
    #[serde(default)]
    pub encryption_variant: EncryptionVariant,
}

/// One agent run as seen by the bridge.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    codec: EnvelopeCodec,
    metadata: Option<Versioned<Value>>,
    agent_state: Option<Versioned<Value>>,
}

impl Session {
    /// Create a session from an id and key.
    ///
    /// # Errors
    /// Returns error if the id is empty.
    pub fn new(
        id: impl Into<SessionId>,
        key: SessionKey,
        variant: EncryptionVariant,
    ) -> Result<Self, SessionError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SessionError::EmptyId);
        }
        Ok(Self {
            id,
            codec: EnvelopeCodec::new(key, variant),
            metadata: None,
            agent_state: None,
        })
    }

    /// Open a session from its credentials record.
    ///
    /// # Errors
    /// Returns error if the key is missing, undecodable, or not 32 bytes.
    pub fn from_credentials(credentials: &SessionCredentials) -> Result<Self, SessionError> {
        let encoded = credentials
            .encryption_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| SessionError::MissingEncryptionKey(credentials.id.clone()))?;
        let key = SessionKey::from_base64(encoded)?;
        Self::new(credentials.id.clone(), key, credentials.encryption_variant)
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Codec for this session's envelopes.
    #[must_use]
    pub const fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Decrypted metadata, if any has been received.
    #[must_use]
    pub const fn metadata(&self) -> Option<&Versioned<Value>> {
        self.metadata.as_ref()
    }

    /// Decrypted agent state, if any has been received.
    #[must_use]
    pub const fn agent_state(&self) -> Option<&Versioned<Value>> {
        self.agent_state.as_ref()
    }

    /// Currently held metadata version.
    #[must_use]
    pub fn metadata_version(&self) -> Option<u64> {
        self.metadata.as_ref().map(|m| m.version)
    }

    /// Currently held agent state version.
    #[must_use]
    pub fn agent_state_version(&self) -> Option<u64> {
        self.agent_state.as_ref().map(|s| s.version)
    }

    /// Offer an encrypted metadata update.
    pub fn apply_metadata(&mut self, incoming: &EncryptedVersioned) -> ApplyOutcome {
        apply_encrypted(&self.codec, &mut self.metadata, incoming)
    }

    /// Offer an encrypted agent state update.
    pub fn apply_agent_state(&mut self, incoming: &EncryptedVersioned) -> ApplyOutcome {
        apply_encrypted(&self.codec, &mut self.agent_state, incoming)
    }

    /// Install a plaintext metadata value this process wrote and the relay
    /// acknowledged.
    pub fn set_metadata(&mut self, value: Versioned<Value>) -> ApplyOutcome {
        apply_plain(&mut self.metadata, value)
    }

    /// Install a plaintext agent state value this process wrote and the relay
    /// acknowledged.
    pub fn set_agent_state(&mut self, value: Versioned<Value>) -> ApplyOutcome {
        apply_plain(&mut self.agent_state, value)
    }
}

fn apply_encrypted(
    codec: &EnvelopeCodec,
    slot: &mut Option<Versioned<Value>>,
    incoming: &EncryptedVersioned,
) -> ApplyOutcome {
    if !incoming.is_newer_than(slot.as_ref().map(|v| v.version)) {
        return ApplyOutcome::Stale;
    }
    match codec.decrypt::<Value>(&incoming.value) {
        Some(value) => {
            *slot = Some(Versioned::new(incoming.version, value));
            ApplyOutcome::Applied
        }
        None => {
            tracing::warn!(version = incoming.version, "Discarding unreadable versioned update");
            ApplyOutcome::Unreadable
        }
    }
}

fn apply_plain(slot: &mut Option<Versioned<Value>>, value: Versioned<Value>) -> ApplyOutcome {
    if value.is_newer_than(slot.as_ref().map(|v| v.version)) {
        *slot = Some(value);
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::Stale
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn session() -> Session {
        Session::new("s1", SessionKey::generate(), EncryptionVariant::DataKey).unwrap()
    }

    fn sealed(session: &Session, version: u64, value: &Value) -> EncryptedVersioned {
        Versioned::new(version, session.codec().encrypt(value).unwrap())
    }

    #[test]
    fn test_missing_key_fails_loudly() {
        let creds = SessionCredentials {
            id: "s1".into(),
            encryption_key: None,
            encryption_variant: EncryptionVariant::DataKey,
        };
        assert!(matches!(
            Session::from_credentials(&creds),
            Err(SessionError::MissingEncryptionKey(_))
        ));
    }

    #[test]
    fn test_short_key_fails_loudly() {
        let creds = SessionCredentials {
            id: "s1".into(),
            encryption_key: Some("AAAA".into()),
            encryption_variant: EncryptionVariant::Legacy,
        };
        assert!(matches!(
            Session::from_credentials(&creds),
            Err(SessionError::InvalidKey(CodecError::InvalidKeyLength(3)))
        ));
    }

    #[test]
    fn test_only_strictly_newer_versions_apply() {
        let mut s = session();
        let v1 = sealed(&s, 1, &json!({"path": "/a"}));
        assert_eq!(s.apply_metadata(&v1), ApplyOutcome::Applied);
        assert_eq!(s.apply_metadata(&v1), ApplyOutcome::Stale);

        let v0 = sealed(&s, 0, &json!({"path": "/old"}));
        assert_eq!(s.apply_metadata(&v0), ApplyOutcome::Stale);
        assert_eq!(s.metadata().unwrap().value, json!({"path": "/a"}));

        let v2 = sealed(&s, 2, &json!({"path": "/b"}));
        assert_eq!(s.apply_metadata(&v2), ApplyOutcome::Applied);
        assert_eq!(s.metadata_version(), Some(2));
    }

    #[test]
    fn test_unreadable_update_keeps_previous_value() {
        let mut s = session();
        s.apply_agent_state(&sealed(&s, 3, &json!({"controlledByUser": false})));
        let garbage = Versioned::new(4, "bm90IGEgY2lwaGVydGV4dA==".to_string());
        assert_eq!(s.apply_agent_state(&garbage), ApplyOutcome::Unreadable);
        assert_eq!(s.agent_state_version(), Some(3));
    }
}
