//! Core types for the happy session bridge.
//!
//! This crate provides the pieces every other crate shares:
//! - `Session` - Versioned, encrypted metadata and agent state
//! - `EnvelopeCodec` - Per-session authenticated encryption
//! - `MessageEnvelope` / `UpdateContainer` - Relay wire types
//! - `MessageLog` - Seq-ordered history with live broadcast
//! - `AgentEvent` - Canonical normalized agent events
//! - `RetryPolicy` - Shared exponential backoff

pub mod codec;
pub mod envelope;
pub mod event;
pub mod message_log;
pub mod retry;
pub mod session;

pub use codec::{CodecError, EncryptionVariant, EnvelopeCodec, SessionKey, VendorTokenCodec};
pub use envelope::{DecodedMessage, MessageEnvelope, OutboundMessage, UpdateBody, UpdateContainer};
pub use event::{AgentEvent, MessageRecord, PermissionPrompt, ToolCall, ToolCallState};
pub use message_log::MessageLog;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use session::{ApplyOutcome, Session, SessionCredentials, SessionError, SessionId, Versioned};

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
