//! Tracked agent sessions.
//!
//! The registry owns the `pid -> session` map and the marker directory
//! behind one mutex. A restarted daemon rebuilds the map with
//! [`SessionRegistry::reattach`], adopting a live process only when its
//! current command line hashes to the value recorded in its marker.

use std::{collections::HashMap, path::PathBuf, process::Stdio, sync::Arc};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use happy_bridge_agent::{AgentKind, CommandBuildError, CommandBuilder};
use happy_bridge_core::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};

use crate::{
    marker::{MarkerError, MarkerStore, SessionMarker, StartedBy, sha256_hex},
    process::ProcessTable,
};

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Command error: {0}")]
    Command(#[from] CommandBuildError),
    #[error("Marker error: {0}")]
    Marker(#[from] MarkerError),
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Spawned process has no pid")]
    NoPid,
    #[error("Process {0} is not running")]
    NotRunning(u32),
}

/// One agent process the daemon knows about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedSession {
    pub pid: u32,
    pub happy_session_id: Option<String>,
    pub started_by: StartedBy,
    pub cwd: Option<String>,
    pub process_command_hash: Option<String>,
    pub reattached_from_disk_marker: bool,
    pub metadata: Option<Value>,
    pub started_at: i64,
    #[serde(skip)]
    process_command: Option<String>,
}

impl TrackedSession {
    /// The happy session id, or `PID-<pid>` until the process reports one.
    #[must_use]
    pub fn key(&self) -> String {
        self.happy_session_id
            .clone()
            .unwrap_or_else(|| format!("PID-{}", self.pid))
    }

    fn from_marker(marker: SessionMarker) -> Self {
        Self {
            pid: marker.pid,
            happy_session_id: marker.happy_session_id,
            started_by: marker.started_by,
            cwd: marker.cwd,
            process_command_hash: Some(marker.process_command_hash),
            reattached_from_disk_marker: true,
            metadata: marker.metadata,
            started_at: marker.created_at,
            process_command: Some(marker.process_command),
        }
    }

    fn to_marker(&self) -> Option<SessionMarker> {
        Some(SessionMarker {
            pid: self.pid,
            happy_session_id: self.happy_session_id.clone(),
            started_by: self.started_by,
            cwd: self.cwd.clone(),
            process_command_hash: self.process_command_hash.clone()?,
            process_command: self.process_command.clone()?,
            metadata: self.metadata.clone(),
            created_at: self.started_at,
        })
    }
}

/// Request to start a new agent process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub directory: PathBuf,
    /// Defaults to Claude.
    #[serde(default)]
    pub agent: Option<AgentKind>,
    /// Happy session id handed to the child as `HAPPY_SESSION_ID`.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Agent-side session to resume.
    #[serde(default)]
    pub resume: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Replaces the agent's base command. Not accepted over the control server.
    #[serde(skip)]
    pub command: Option<String>,
}

/// A process started outside the daemon announcing itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub pid: u32,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Outcome of a reattachment sweep, by pid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReattachReport {
    pub adopted: Vec<u32>,
    pub stale: Vec<u32>,
    pub mismatched: Vec<u32>,
    pub skipped: Vec<u32>,
}

struct RegistryState {
    sessions: HashMap<u32, TrackedSession>,
    /// Stop signals for children this daemon spawned.
    children: HashMap<u32, oneshot::Sender<()>>,
    markers: MarkerStore,
}

/// `pid -> session` map plus the marker directory backing it.
pub struct SessionRegistry<P> {
    processes: P,
    server_url: String,
    state: Mutex<RegistryState>,
}

impl<P: ProcessTable + 'static> SessionRegistry<P> {
    pub fn new(processes: P, markers: MarkerStore, server_url: impl Into<String>) -> Self {
        Self {
            processes,
            server_url: server_url.into(),
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                children: HashMap::new(),
                markers,
            }),
        }
    }

    /// Rebuild the map from the marker directory.
    ///
    /// Markers of dead processes are removed. A live process whose command
    /// line no longer hashes to the marker's value is treated as a reused
    /// pid: its marker is removed and it is never adopted. Pids already
    /// tracked are left alone.
    ///
    /// # Errors
    /// Returns error if the marker directory cannot be listed.
    pub async fn reattach(&self) -> Result<ReattachReport, RegistryError> {
        let mut state = self.state.lock().await;
        let mut report = ReattachReport::default();

        for marker in state.markers.list()? {
            let pid = marker.pid;
            if state.sessions.contains_key(&pid) {
                report.skipped.push(pid);
                continue;
            }
            if !self.processes.is_alive(pid) {
                tracing::info!(pid, "Removing stale session marker");
                discard_marker(&state.markers, pid);
                report.stale.push(pid);
                continue;
            }
            let live_hash = self.processes.command_line(pid).map(|c| sha256_hex(&c));
            if live_hash.as_deref() != Some(marker.process_command_hash.as_str()) {
                tracing::warn!(pid, "Live command line does not match marker, not adopting");
                discard_marker(&state.markers, pid);
                report.mismatched.push(pid);
                continue;
            }
            tracing::info!(pid, session_id = ?marker.happy_session_id, "Reattached session");
            state.sessions.insert(pid, TrackedSession::from_marker(marker));
            report.adopted.push(pid);
        }
        Ok(report)
    }

    /// Record a process that reported itself, or update one already
    /// tracked with its session id and metadata.
    ///
    /// # Errors
    /// Returns error if an untracked pid is not running or the marker
    /// cannot be written.
    pub async fn session_started(&self, report: SessionReport) -> Result<TrackedSession, RegistryError> {
        let mut state = self.state.lock().await;
        let RegistryState { sessions, markers, .. } = &mut *state;

        let session = if let Some(existing) = sessions.get_mut(&report.pid) {
            if report.session_id.is_some() {
                existing.happy_session_id = report.session_id;
            }
            if report.metadata.is_some() {
                existing.metadata = report.metadata;
            }
            if report.cwd.is_some() {
                existing.cwd = report.cwd;
            }
            existing.clone()
        } else {
            if !self.processes.is_alive(report.pid) {
                return Err(RegistryError::NotRunning(report.pid));
            }
            let process_command = self.processes.command_line(report.pid);
            let session = TrackedSession {
                pid: report.pid,
                happy_session_id: report.session_id,
                started_by: StartedBy::Terminal,
                cwd: report.cwd,
                process_command_hash: process_command.as_deref().map(sha256_hex),
                reattached_from_disk_marker: false,
                metadata: report.metadata,
                started_at: now_millis(),
                process_command,
            };
            sessions.insert(session.pid, session.clone());
            session
        };

        if let Some(marker) = session.to_marker() {
            markers.write(&marker)?;
        } else {
            tracing::warn!(pid = session.pid, "No command line for session, it will not survive a restart");
        }
        tracing::info!(pid = session.pid, session_id = %session.key(), "Session started");
        Ok(session)
    }

    /// Start an agent in its own process group and track it.
    ///
    /// # Errors
    /// Returns error if the command cannot be built or resolved, the
    /// process cannot be started, or its marker cannot be written.
    pub async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<TrackedSession, RegistryError> {
        let kind = request.agent.unwrap_or(AgentKind::Claude);
        let mut builder = CommandBuilder::for_agent(kind);
        if let Some(base) = &request.command {
            builder = builder.override_base(base.clone());
        }
        let builder = builder.extend_params(request.args.iter().cloned());
        let parts = match &request.resume {
            Some(agent_session_id) => builder.build_resume(kind, agent_session_id)?,
            None => builder.build_initial()?,
        };
        let command_line = parts.to_command_line()?;
        let (program, args) = parts.into_resolved().await?;
        // Joined the way the process table reports it, so the hash can be
        // recomputed from the live process.
        let process_command = std::iter::once(program.display().to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .current_dir(&request.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env("HAPPY_SERVER_URL", &self.server_url);
        if let Some(session_id) = &request.session_id {
            command.env("HAPPY_SESSION_ID", session_id);
        }

        // Held across the spawn so a concurrent sweep sees either nothing
        // or the fully registered child.
        let mut state = self.state.lock().await;
        let mut child = command.group_spawn().map_err(|source| RegistryError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            let _ = child.kill().await;
            return Err(RegistryError::NoPid);
        };

        let session = TrackedSession {
            pid,
            happy_session_id: request.session_id,
            started_by: StartedBy::Daemon,
            cwd: Some(request.directory.display().to_string()),
            process_command_hash: Some(sha256_hex(&process_command)),
            reattached_from_disk_marker: false,
            metadata: None,
            started_at: now_millis(),
            process_command: Some(process_command),
        };
        if let Some(marker) = session.to_marker() {
            if let Err(e) = state.markers.write(&marker) {
                let _ = child.kill().await;
                return Err(e.into());
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        state.sessions.insert(pid, session.clone());
        state.children.insert(pid, stop_tx);
        drop(state);

        tokio::spawn(supervise(Arc::clone(self), pid, child, stop_rx));
        tracing::info!(pid, agent = %kind, command = %command_line, "Spawned agent session");
        Ok(session)
    }

    /// Stop the session whose [`TrackedSession::key`] is `key`. Returns
    /// whether one was tracked.
    pub async fn stop(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(pid) = state.sessions.values().find(|s| s.key() == key).map(|s| s.pid) else {
            return false;
        };

        if let Some(stop) = state.children.remove(&pid) {
            let _ = stop.send(());
        } else if let Err(e) = self.processes.terminate(pid) {
            tracing::warn!(pid, error = %e, "Failed to signal session process");
        }
        state.sessions.remove(&pid);
        discard_marker(&state.markers, pid);
        tracing::info!(pid, session_id = %key, "Session stopped");
        true
    }

    /// Drop sessions whose process has exited. Returns their pids.
    pub async fn prune_dead(&self) -> Vec<u32> {
        let mut state = self.state.lock().await;
        let mut dead: Vec<u32> = state
            .sessions
            .keys()
            .copied()
            .filter(|pid| !self.processes.is_alive(*pid))
            .collect();
        dead.sort_unstable();
        for pid in &dead {
            state.sessions.remove(pid);
            state.children.remove(pid);
            discard_marker(&state.markers, *pid);
            tracing::info!(pid, "Session process gone");
        }
        dead
    }

    /// Tracked sessions sorted by pid.
    pub async fn list(&self) -> Vec<TrackedSession> {
        let state = self.state.lock().await;
        let mut sessions: Vec<TrackedSession> = state.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.pid);
        sessions
    }

    pub async fn get(&self, pid: u32) -> Option<TrackedSession> {
        self.state.lock().await.sessions.get(&pid).cloned()
    }

    async fn forget(&self, pid: u32) {
        let mut state = self.state.lock().await;
        state.children.remove(&pid);
        if state.sessions.remove(&pid).is_some() {
            discard_marker(&state.markers, pid);
        }
    }
}

/// Wait for a spawned child to exit, killing its process group when asked.
async fn supervise<P: ProcessTable + 'static>(
    registry: Arc<SessionRegistry<P>>,
    pid: u32,
    mut child: AsyncGroupChild,
    stop: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop => {
            if let Err(e) = child.kill().await {
                tracing::warn!(pid, error = %e, "Failed to kill session process group");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => tracing::info!(pid, %status, "Agent process exited"),
        Err(e) => tracing::warn!(pid, error = %e, "Failed to wait for agent process"),
    }
    registry.forget(pid).await;
}

fn discard_marker(markers: &MarkerStore, pid: u32) {
    if let Err(e) = markers.remove(pid) {
        tracing::error!(pid, error = %e, "Failed to remove session marker");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::process::testing::FakeProcessTable;

    fn marker(pid: u32, command: &str) -> SessionMarker {
        SessionMarker {
            pid,
            happy_session_id: Some(format!("s-{pid}")),
            started_by: StartedBy::Daemon,
            cwd: Some("/work".into()),
            process_command_hash: sha256_hex(command),
            process_command: command.into(),
            metadata: None,
            created_at: 1,
        }
    }

    fn registry(table: FakeProcessTable, dir: &std::path::Path) -> SessionRegistry<FakeProcessTable> {
        SessionRegistry::new(table, MarkerStore::new(dir), "http://relay.test")
    }

    #[tokio::test]
    async fn test_reattach_adopts_only_verified_processes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        store.write(&marker(10, "claude --verbose")).unwrap();
        store.write(&marker(11, "codex proto")).unwrap();
        store.write(&marker(12, "gemini --experimental-acp")).unwrap();

        let table = FakeProcessTable::with(&[(10, "claude --verbose"), (12, "vim notes.txt")]);
        let registry = registry(table, dir.path());
        let report = registry.reattach().await.unwrap();

        assert_eq!(
            report,
            ReattachReport {
                adopted: vec![10],
                stale: vec![11],
                mismatched: vec![12],
                skipped: vec![],
            }
        );
        assert!(store.read(10).unwrap().is_some());
        assert!(store.read(11).unwrap().is_none());
        assert!(store.read(12).unwrap().is_none());

        let adopted = registry.get(10).await.unwrap();
        assert!(adopted.reattached_from_disk_marker);
        assert_eq!(adopted.process_command_hash, Some(sha256_hex("claude --verbose")));
        assert_eq!(adopted.key(), "s-10");
    }

    #[tokio::test]
    async fn test_changed_command_line_is_not_adopted() {
        let dir = tempfile::tempdir().unwrap();
        MarkerStore::new(dir.path()).write(&marker(5, "claude")).unwrap();
        let table = FakeProcessTable::with(&[(5, "claude --resume x")]);

        let registry = registry(table, dir.path());
        let report = registry.reattach().await.unwrap();
        assert_eq!(report.mismatched, vec![5]);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_tracked_pids_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable::with(&[(20, "happy claude")]);
        let registry = registry(table.clone(), dir.path());

        registry
            .session_started(SessionReport {
                pid: 20,
                session_id: Some("abc".into()),
                metadata: Some(json!({"path": "/p"})),
                cwd: None,
            })
            .await
            .unwrap();

        // Once a pid is tracked the sweep does not re-verify it.
        table.set(20, "something else");
        let report = registry.reattach().await.unwrap();
        assert_eq!(report.skipped, vec![20]);
        assert!(MarkerStore::new(dir.path()).read(20).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_session_started_updates_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let table = FakeProcessTable::with(&[(30, "happy codex")]);
        let registry = registry(table.clone(), dir.path());

        assert!(matches!(
            registry
                .session_started(SessionReport {
                    pid: 31,
                    session_id: None,
                    metadata: None,
                    cwd: None
                })
                .await,
            Err(RegistryError::NotRunning(31))
        ));

        let first = registry
            .session_started(SessionReport {
                pid: 30,
                session_id: None,
                metadata: None,
                cwd: Some("/repo".into()),
            })
            .await
            .unwrap();
        assert_eq!(first.key(), "PID-30");
        assert_eq!(first.started_by, StartedBy::Terminal);

        let second = registry
            .session_started(SessionReport {
                pid: 30,
                session_id: Some("sess-30".into()),
                metadata: None,
                cwd: None,
            })
            .await
            .unwrap();
        assert_eq!(second.key(), "sess-30");
        assert_eq!(second.cwd.as_deref(), Some("/repo"));
        let on_disk = MarkerStore::new(dir.path()).read(30).unwrap().unwrap();
        assert_eq!(on_disk.happy_session_id.as_deref(), Some("sess-30"));
        assert_eq!(on_disk.process_command_hash, sha256_hex("happy codex"));

        assert!(!registry.stop("nope").await);
        assert!(registry.stop("sess-30").await);
        assert_eq!(*table.terminated.lock().unwrap(), vec![30]);
        assert!(registry.list().await.is_empty());
        assert!(MarkerStore::new(dir.path()).read(30).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_dead() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        store.write(&marker(40, "a")).unwrap();
        store.write(&marker(41, "b")).unwrap();
        let table = FakeProcessTable::with(&[(40, "a"), (41, "b")]);
        let registry = registry(table.clone(), dir.path());
        assert_eq!(registry.reattach().await.unwrap().adopted, vec![40, 41]);

        table.kill(41);
        assert_eq!(registry.prune_dead().await, vec![41]);
        let pids: Vec<u32> = registry.list().await.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![40]);
        assert!(store.read(41).unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_process_survives_restart() {
        use crate::process::SystemProcessTable;

        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new(
            SystemProcessTable,
            MarkerStore::new(dir.path()),
            "http://relay.test",
        ));

        let session = registry
            .spawn(SpawnRequest {
                directory: work.path().to_path_buf(),
                session_id: Some("spawned".into()),
                command: Some("sleep 30".into()),
                ..SpawnRequest::default()
            })
            .await
            .unwrap();
        let pid = session.pid;
        assert_eq!(session.started_by, StartedBy::Daemon);

        let marker = MarkerStore::new(dir.path()).read(pid).unwrap().unwrap();
        let live = SystemProcessTable.command_line(pid).unwrap();
        assert_eq!(marker.process_command_hash, sha256_hex(&live));

        // A second registry over the same directory plays the restarted daemon.
        let restarted = SessionRegistry::new(SystemProcessTable, MarkerStore::new(dir.path()), "http://relay.test");
        assert_eq!(restarted.reattach().await.unwrap().adopted, vec![pid]);
        assert!(restarted.get(pid).await.unwrap().reattached_from_disk_marker);

        assert!(registry.stop("spawned").await);
        tokio::time::timeout(Duration::from_secs(5), async {
            while SystemProcessTable.is_alive(pid) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(MarkerStore::new(dir.path()).read(pid).unwrap().is_none());
    }
}
