//! Local daemon that tracks agent sessions across restarts.
//!
//! Provides:
//! - `MarkerStore` - Owner-only session markers on disk
//! - `ProcessTable` - Liveness and command-line lookup
//! - `SessionRegistry` - The `pid -> session` map and reattachment sweep
//! - The localhost control server

pub mod config;
pub mod control;
pub mod marker;
pub mod process;
pub mod registry;

pub use config::{ConfigError, DEFAULT_SERVER_URL, DaemonConfig};
pub use control::DaemonState;
pub use marker::{MarkerError, MarkerStore, SessionMarker, StartedBy, sha256_hex, write_json_atomic};
pub use process::{ProcessTable, SystemProcessTable};
pub use registry::{ReattachReport, RegistryError, SessionRegistry, SessionReport, SpawnRequest, TrackedSession};
