//! Localhost control server.
//!
//! JSON over `POST`, bound to 127.0.0.1 only:
//! - `/list` tracked sessions
//! - `/session-started` a process announcing itself
//! - `/stop-session` stop by session key
//! - `/spawn-session` start a new agent

use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::trace::TraceLayer;

use crate::{
    process::ProcessTable,
    registry::{SessionRegistry, SessionReport, SpawnRequest},
};

/// Contents of the daemon state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    pub pid: u32,
    pub http_port: u16,
    pub started_at: i64,
    pub server_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest {
    session_id: String,
}

type Registry<P> = State<Arc<SessionRegistry<P>>>;

pub fn router<P: ProcessTable + 'static>(registry: Arc<SessionRegistry<P>>) -> Router {
    Router::new()
        .route("/list", post(list::<P>))
        .route("/session-started", post(session_started::<P>))
        .route("/stop-session", post(stop_session::<P>))
        .route("/spawn-session", post(spawn_session::<P>))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Bind `127.0.0.1:<port>` and serve until `shutdown` resolves.
///
/// # Errors
/// Returns error if the port cannot be bound.
pub async fn serve<P, F>(
    registry: Arc<SessionRegistry<P>>,
    port: u16,
    shutdown: F,
) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)>
where
    P: ProcessTable + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
    let addr = listener.local_addr()?;
    let app = router(registry);
    let handle = tokio::spawn(async move { axum::serve(listener, app).with_graceful_shutdown(shutdown).await });
    tracing::debug!(%addr, "Control server bound");
    Ok((addr, handle))
}

async fn list<P: ProcessTable + 'static>(State(registry): Registry<P>) -> Json<Value> {
    Json(json!({ "children": registry.list().await }))
}

async fn session_started<P: ProcessTable + 'static>(
    State(registry): Registry<P>,
    Json(report): Json<SessionReport>,
) -> Response {
    match registry.session_started(report).await {
        Ok(session) => Json(json!({ "status": "ok", "session": session })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Rejected session report");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn stop_session<P: ProcessTable + 'static>(
    State(registry): Registry<P>,
    Json(request): Json<StopRequest>,
) -> Json<Value> {
    let success = registry.stop(&request.session_id).await;
    Json(json!({ "success": success }))
}

async fn spawn_session<P: ProcessTable + 'static>(
    State(registry): Registry<P>,
    Json(request): Json<SpawnRequest>,
) -> Json<Value> {
    let directory = request.directory.display().to_string();
    match registry.spawn(request).await {
        Ok(session) => Json(json!({
            "type": "success",
            "pid": session.pid,
            "sessionId": session.happy_session_id,
        })),
        Err(e) => {
            tracing::warn!(%directory, error = %e, "Spawn failed");
            Json(json!({ "type": "error", "errorMessage": e.to_string() }))
        }
    }
}
