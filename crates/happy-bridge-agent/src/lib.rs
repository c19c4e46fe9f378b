//! Agent bridge: wraps one agent CLI and speaks its stdio protocol.
//!
//! Provides:
//! - Per-backend wire types (Claude stream-json, Codex proto, ACP)
//! - Normalization into `AgentEvent`
//! - Tool-name resolution and the auto-approval policy
//! - The permission state machine
//! - Command building utilities

pub mod backend;
pub mod command;
pub mod frame;
pub mod normalize;
pub mod peer;
pub mod permission;
pub mod tool_name;

pub use backend::{AgentKind, WireFormat};
pub use command::{CommandBuildError, CommandBuilder, CommandParts, resolve_executable_path};
pub use normalize::{Normalized, Normalizer, PendingPermission, ReplyRoute};
pub use peer::{ProtocolError, ProtocolPeer};
pub use permission::{
    AgentStateRequests, Decision, PermissionError, PermissionHandler, PermissionMode,
    PermissionOutcome, PermissionResponse, RequestStatus,
};
pub use tool_name::{NameSource, ResolvedToolName, resolve_tool_name};
