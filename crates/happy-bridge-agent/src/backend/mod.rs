//! Agent backends and their wire formats.
//!
//! Each backend gets its own tagged union. Nothing outside this crate sees
//! these types; they are normalized into `AgentEvent` first.

pub mod acp;
pub mod claude;
pub mod codex;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
    #[serde(rename = "opencode")]
    OpenCode,
}

/// Wire format spoken on the agent's stdio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Claude Code `--output-format stream-json`.
    ClaudeStream,
    /// `codex proto` submissions and events.
    CodexProto,
    /// ACP JSON-RPC.
    Acp,
}

impl AgentKind {
    /// All supported kinds.
    pub const ALL: [Self; 4] = [Self::Claude, Self::Codex, Self::Gemini, Self::OpenCode];

    /// Wire format of this backend.
    #[must_use]
    pub const fn wire_format(self) -> WireFormat {
        match self {
            Self::Claude => WireFormat::ClaudeStream,
            Self::Codex => WireFormat::CodexProto,
            Self::Gemini | Self::OpenCode => WireFormat::Acp,
        }
    }

    /// Command line used to start the backend in its machine-readable mode.
    #[must_use]
    pub const fn default_command(self) -> &'static str {
        match self {
            Self::Claude => {
                "claude --output-format stream-json --input-format stream-json --verbose --permission-prompt-tool stdio"
            }
            Self::Codex => "codex proto",
            Self::Gemini => "gemini --experimental-acp",
            Self::OpenCode => "opencode acp",
        }
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::OpenCode => "opencode",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown agent: {s}"))
    }
}

/// A decoded stdout frame of any backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Claude(claude::ClaudeMessage),
    Codex(codex::CodexEvent),
    Acp(acp::AcpFrame),
}

/// Decode one JSON frame according to the backend's wire format.
///
/// # Errors
/// Returns error if the frame does not match the backend's schema.
pub fn decode(kind: AgentKind, frame: Value) -> Result<BackendMessage, serde_json::Error> {
    Ok(match kind.wire_format() {
        WireFormat::ClaudeStream => BackendMessage::Claude(serde_json::from_value(frame)?),
        WireFormat::CodexProto => BackendMessage::Codex(serde_json::from_value(frame)?),
        WireFormat::Acp => BackendMessage::Acp(serde_json::from_value(frame)?),
    })
}
