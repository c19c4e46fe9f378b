//! Wire protocol of the relay channel.
//!
//! Every WebSocket text message is one [`Frame`]. A frame carrying an
//! `ackId` expects a reply frame with event [`ACK`] and the same id.

use happy_bridge_core::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound encrypted session message.
pub const MESSAGE: &str = "message";
/// Reply to a frame that carried an `ackId`.
pub const ACK: &str = "ack";
/// Inbound update container.
pub const UPDATE: &str = "update";
/// Inbound RPC call, answered through an ack.
pub const RPC_REQUEST: &str = "rpc-request";
/// Registers an RPC method scope with the relay.
pub const RPC_REGISTER: &str = "rpc-register";
/// Optimistic metadata write.
pub const UPDATE_METADATA: &str = "update-metadata";
/// Optimistic agent state write.
pub const UPDATE_STATE: &str = "update-state";
/// Keep-alive carrying the thinking flag.
pub const SESSION_ALIVE: &str = "session-alive";
/// Session finished.
pub const SESSION_END: &str = "session-end";

/// One frame on the relay channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
}

impl Frame {
    /// Fire-and-forget frame.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack_id: None,
        }
    }

    /// Reply to the frame that carried `ack_id`.
    #[must_use]
    pub fn ack(ack_id: u64, data: Value) -> Self {
        Self {
            event: ACK.to_string(),
            data,
            ack_id: Some(ack_id),
        }
    }

    #[must_use]
    pub const fn with_ack_id(mut self, ack_id: u64) -> Self {
        self.ack_id = Some(ack_id);
        self
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.event == ACK
    }

    /// Parse one text message. Malformed text yields `None`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed relay frame");
                None
            }
        }
    }
}

/// Data of an [`RPC_REQUEST`] frame. `params` is ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    pub params: String,
}

/// Ack data answering an [`RpcRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcReply {
    /// Ciphertext of the handler's result.
    Ok { result: String },
    Err { error: String },
}

/// Data of an [`UPDATE_METADATA`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetadataRequest {
    pub sid: SessionId,
    pub expected_version: u64,
    pub metadata: String,
}

/// Data of an [`UPDATE_STATE`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStateRequest {
    pub sid: SessionId,
    pub expected_version: u64,
    pub agent_state: Option<String>,
}

/// Outcome of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteResult {
    Success,
    VersionMismatch,
    Error,
}

/// Ack data of a versioned write. On success and on mismatch the relay
/// returns its current version and ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedWriteAck {
    pub result: WriteResult,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub agent_state: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Data of a [`SESSION_ALIVE`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAlive {
    pub sid: SessionId,
    pub time: i64,
    pub thinking: bool,
}
