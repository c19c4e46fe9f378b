//! Auto-approval policy.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tool_name::{ResolvedToolName, is_generic};

/// Substrings marking a tool as able to change the machine.
const WRITE_VOCABULARY: &[&str] = &[
    "edit", "write", "patch", "delete", "remove", "exec", "shell", "bash", "command", "run",
    "move", "rename", "create", "mkdir", "apply", "notebook",
];

/// Tools whose allow-list shape is the exact command line.
const SHELL_TOOLS: &[&str] = &["bash", "shell", "exec", "command", "run_shell_command"];

/// Permission mode of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionMode {
    /// Approve everything.
    #[serde(rename = "yolo")]
    Yolo,
    /// Approve only tools that cannot write.
    #[serde(rename = "safe-yolo")]
    SafeYolo,
    #[serde(rename = "read-only")]
    ReadOnly,
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
    #[serde(rename = "plan")]
    Plan,
}

impl PermissionMode {
    pub const ALL: [Self; 7] = [
        Self::Yolo,
        Self::SafeYolo,
        Self::ReadOnly,
        Self::Default,
        Self::AcceptEdits,
        Self::BypassPermissions,
        Self::Plan,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yolo => "yolo",
            Self::SafeYolo => "safe-yolo",
            Self::ReadOnly => "read-only",
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }

    /// Mode passed to Claude's own `set_permission_mode`.
    ///
    /// Claude only knows its four native modes. The bridge-only modes keep
    /// Claude in `default` so every tool use is routed through the bridge.
    #[must_use]
    pub const fn claude_mode(self) -> &'static str {
        match self {
            Self::Yolo | Self::BypassPermissions => "bypassPermissions",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::SafeYolo | Self::ReadOnly | Self::Default => "default",
        }
    }

    /// Whether this mode approves `tool` without asking.
    #[must_use]
    pub fn auto_approves(self, tool: &ResolvedToolName) -> bool {
        match self {
            Self::Yolo => true,
            Self::SafeYolo | Self::ReadOnly => tool.is_resolved() && !is_write_like(&tool.name),
            Self::Default | Self::AcceptEdits | Self::BypassPermissions | Self::Plan => false,
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown permission mode: {s}"))
    }
}

/// Whether a tool can change the machine. Generic names count as write-like.
#[must_use]
pub fn is_write_like(tool_name: &str) -> bool {
    if is_generic(tool_name) {
        return true;
    }
    let name = tool_name.to_ascii_lowercase();
    WRITE_VOCABULARY.iter().any(|term| name.contains(term))
}

/// Key of the session allow-list: two requests with the same shape are
/// considered identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestShape {
    tool: String,
    shape: InputShape,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum InputShape {
    Command(String),
    Keys(Vec<String>),
}

impl RequestShape {
    /// Shape of a request for `tool` with `input`.
    #[must_use]
    pub fn of(tool: &str, input: &Value) -> Self {
        let tool = tool.to_ascii_lowercase();
        let shape = if SHELL_TOOLS.contains(&tool.as_str()) {
            command_line(input).map_or_else(|| keys_of(input), InputShape::Command)
        } else {
            keys_of(input)
        };
        Self { tool, shape }
    }
}

fn command_line(input: &Value) -> Option<String> {
    let command = input.get("command").or_else(|| input.get("cmd"))?;
    match command {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let parts: Option<Vec<&str>> = parts.iter().map(Value::as_str).collect();
            parts.map(|p| p.join(" "))
        }
        _ => None,
    }
}

fn keys_of(input: &Value) -> InputShape {
    let mut keys: Vec<String> = input
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    InputShape::Keys(keys)
}
