//! Relay transport for the happy session bridge.
//!
//! Provides:
//! - Wire frames of the relay channel
//! - `RelayTransport`, its reconnecting WebSocket implementation and an
//!   instrumented decorator
//! - Encrypted RPC routing and the capability registry
//! - `SessionClient` and the per-session loop

pub mod capabilities;
pub mod channel;
pub mod protocol;
pub mod rpc;
pub mod session_client;
pub mod session_loop;
pub mod transport;

pub use capabilities::{Capability, CapabilityError, CapabilityRegistry};
pub use channel::{ChannelConfig, DEFAULT_SERVER_URL, RelayChannel};
pub use protocol::Frame;
pub use rpc::{RpcError, RpcRouter, scoped_method};
pub use session_client::{SessionChange, SessionClient};
pub use session_loop::{SessionLoop, SessionLoopConfig};
pub use transport::{
    InstrumentedTransport, RelayTransport, TracingObserver, TransportError, TransportObserver, TransportStats,
};
