//! Message delivery for the happy session bridge.
//!
//! Provides:
//! - `OutgoingQueue` - Per-item delayed release of agent events
//! - `PendingQueue` - User messages waiting for the agent, one in flight
//! - `reconcile` - Merge of relay listings into displayed lists
//! - `InvalidateSync` - Coalescing retry wrapper
//! - `in_tx` / `SessionSequencer` - Transactional sequencing with after-commit hooks

pub mod outgoing;
pub mod pending;
pub mod reconcile;
pub mod sequencer;
pub mod storage;
pub mod sync;

pub use outgoing::{EnqueueOptions, OutgoingQueue};
pub use pending::{
    Checkpoint, DiscardedMessage, PendingMessage, PendingQueue, PersistedQueue, QueueState, RelayListing, Work,
};
pub use reconcile::{LocalId, reconcile};
pub use sequencer::{SequencedUpdate, SessionSequencer};
pub use storage::{Transaction, TransactionalStore, TxContext, TxError, in_tx};
#[cfg(feature = "memory")]
pub use storage::MemoryStore;
pub use sync::{InvalidateSync, SyncConfig};
