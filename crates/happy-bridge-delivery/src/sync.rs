//! Coalescing retry wrapper.
//!
//! [`InvalidateSync`] runs one async operation at a time. Invalidations that
//! arrive while it runs collapse into a single follow-up run. Failures are
//! retried with backoff; once the policy is exhausted the wrapper is wedged
//! until the next invalidation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use happy_bridge_core::RetryPolicy;
use tokio::sync::watch;

type Operation = dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;
type ErrorHandler = dyn Fn(&anyhow::Error) + Send + Sync;

/// Configuration of an [`InvalidateSync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
}

#[derive(Debug, Default)]
struct State {
    running: bool,
    rerun: bool,
    wedged: bool,
}

struct Shared {
    name: String,
    config: SyncConfig,
    op: Box<Operation>,
    on_error: Box<ErrorHandler>,
    state: Mutex<State>,
    busy: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Coalescing, retrying runner for one operation.
#[derive(Clone)]
pub struct InvalidateSync {
    shared: Arc<Shared>,
}

impl InvalidateSync {
    /// Create a wrapper around `op`. `on_error` is called when the retry
    /// policy is exhausted.
    pub fn new<F, E>(name: impl Into<String>, config: SyncConfig, op: F, on_error: E) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
        E: Fn(&anyhow::Error) + Send + Sync + 'static,
    {
        let (busy, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                op: Box::new(op),
                on_error: Box::new(on_error),
                state: Mutex::new(State::default()),
                busy,
            }),
        }
    }

    /// Request a run. Coalesces with a run already in flight.
    pub fn invalidate(&self) {
        let mut state = self.shared.lock();
        if state.wedged {
            tracing::info!(sync = %self.shared.name, "Clearing wedged state");
            state.wedged = false;
        }
        if state.running {
            state.rerun = true;
            return;
        }
        state.running = true;
        self.shared.busy.send_replace(true);
        drop(state);
        tokio::spawn(run(self.shared.clone()));
    }

    /// Request a run and wait until it and any coalesced run finish.
    pub async fn invalidate_and_await(&self) {
        self.invalidate();
        self.await_queue().await;
    }

    /// Wait until no run is in flight or queued.
    pub async fn await_queue(&self) {
        let mut rx = self.shared.busy.subscribe();
        let _ = rx.wait_for(|busy| !busy).await;
    }

    /// Whether the last run exhausted its retries.
    #[must_use]
    pub fn is_wedged(&self) -> bool {
        self.shared.lock().wedged
    }
}

async fn run(shared: Arc<Shared>) {
    let policy = shared.config.retry;
    loop {
        let mut failures = 0;
        let result = loop {
            match (shared.op)().await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    failures += 1;
                    if failures >= policy.max_attempts {
                        break Err(e);
                    }
                    let delay = policy.delay_for(failures);
                    tracing::debug!(sync = %shared.name, failures, ?delay, error = %e, "Sync failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let mut state = shared.lock();
        match result {
            Ok(()) if state.rerun => {
                state.rerun = false;
            }
            Ok(()) => {
                state.running = false;
                shared.busy.send_replace(false);
                return;
            }
            Err(e) => {
                state.wedged = true;
                state.rerun = false;
                state.running = false;
                shared.busy.send_replace(false);
                drop(state);
                tracing::error!(sync = %shared.name, failures, error = %e, "Sync wedged");
                (shared.on_error)(&e);
                return;
            }
        }
    }
}
