//! Permission requests, auto-approval policy and the request state machine.

pub mod handler;
pub mod input;
pub mod policy;

pub use handler::{
    AgentStateRequests, CompletedRequest, Decision, PendingRequest, PermissionError,
    PermissionHandler, PermissionOutcome, PermissionResponse, RequestStatus,
};
pub use input::{ToolInputCache, extract_permission_input, is_empty_input};
pub use policy::{PermissionMode, RequestShape, is_write_like};
