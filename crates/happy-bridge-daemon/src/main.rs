//! `happy-bridge-daemon`: reattach to surviving sessions, then serve the
//! control API until interrupted.

use std::sync::Arc;

use anyhow::Context;
use happy_bridge_core::now_millis;
use happy_bridge_daemon::{
    DaemonConfig, DaemonState, MarkerStore, SessionRegistry, SystemProcessTable, control, write_json_atomic,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = DaemonConfig::from_env()?;
    let registry = Arc::new(SessionRegistry::new(
        SystemProcessTable,
        MarkerStore::new(&config.markers_dir),
        config.server_url.clone(),
    ));

    let report = registry.reattach().await.context("reattachment sweep failed")?;
    tracing::info!(
        adopted = report.adopted.len(),
        stale = report.stale.len(),
        mismatched = report.mismatched.len(),
        "Reattachment sweep finished"
    );

    let (addr, server) = control::serve(Arc::clone(&registry), config.control_port, shutdown_signal())
        .await
        .context("failed to bind control server")?;
    let state_file = config.state_file();
    write_json_atomic(
        &state_file,
        &DaemonState {
            pid: std::process::id(),
            http_port: addr.port(),
            started_at: now_millis(),
            server_url: config.server_url.clone(),
        },
    )?;
    tracing::info!("Daemon listening on http://{addr}");

    let pruner = tokio::spawn({
        let registry = Arc::clone(&registry);
        let period = config.prune_interval;
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.prune_dead().await;
            }
        }
    });

    let served = server.await.context("control server task panicked")?;
    pruner.abort();
    if let Err(e) = std::fs::remove_file(&state_file) {
        tracing::warn!(path = %state_file.display(), error = %e, "Failed to remove state file");
    }
    served.context("control server failed")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down, sessions keep running");
}
