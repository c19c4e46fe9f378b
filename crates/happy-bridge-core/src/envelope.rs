//! Wire envelopes exchanged with the relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::EnvelopeCodec;
use crate::session::{EncryptedVersioned, SessionId};

/// Envelope content. Only the encrypted form is ever produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "camelCase")]
pub enum EnvelopeContent {
    Encrypted { c: String },
}

/// A relay-persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    /// Relay-assigned ordering key, increasing per session.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub content: EnvelopeContent,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}

impl MessageEnvelope {
    /// Decrypt into a [`DecodedMessage`]. Unreadable content becomes `None`.
    #[must_use]
    pub fn decode(&self, codec: &EnvelopeCodec) -> DecodedMessage {
        let content = match &self.content {
            EnvelopeContent::Encrypted { c } => codec.decrypt::<Value>(c),
        };
        if content.is_none() {
            tracing::debug!(message_id = %self.id, seq = self.seq, "Message content unreadable");
        }
        DecodedMessage {
            id: self.id.clone(),
            seq: self.seq,
            local_id: self.local_id.clone(),
            created_at: self.created_at,
            content,
        }
    }
}

/// A message after decryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedMessage {
    pub id: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub created_at: i64,
    /// `None` when the ciphertext could not be read.
    pub content: Option<Value>,
}

/// Update pushed by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContainer {
    pub id: String,
    pub seq: u64,
    pub created_at: i64,
    pub body: UpdateBody,
}

/// Body of an [`UpdateContainer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "kebab-case")]
pub enum UpdateBody {
    NewMessage {
        sid: SessionId,
        message: MessageEnvelope,
    },
    #[serde(rename_all = "camelCase")]
    NewSession {
        id: SessionId,
        #[serde(default)]
        metadata: Option<EncryptedVersioned>,
        #[serde(default)]
        agent_state: Option<EncryptedVersioned>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateSession {
        id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_state: Option<EncryptedVersioned>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<EncryptedVersioned>,
    },
    /// Update kinds this bridge does not consume.
    #[serde(other)]
    Unknown,
}

impl UpdateBody {
    /// Session the update belongs to, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::NewMessage { sid, .. } => Some(sid),
            Self::NewSession { id, .. } | Self::UpdateSession { id, .. } => Some(id),
            Self::Unknown => None,
        }
    }
}

/// Frame sent to the relay for a new message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub sid: SessionId,
    /// Base64 ciphertext of the message record.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}
