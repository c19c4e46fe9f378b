//! On-disk session markers.
//!
//! One JSON file per tracked process at `<dir>/pid-<pid>.json`, readable
//! only by the owner. Writes go through a temp file in the same directory
//! and a rename, so a reader never sees a partial marker.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Marker store error.
#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Who launched the process a marker describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartedBy {
    Daemon,
    Terminal,
}

/// Enough to re-identify a live agent process after a daemon restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMarker {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub happy_session_id: Option<String>,
    pub started_by: StartedBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// `sha256_hex` of `process_command`.
    pub process_command_hash: String,
    pub process_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: i64,
}

/// Lowercase hex SHA-256 of `input`.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Marker files under one directory.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("pid-{pid}.json"))
    }

    /// Write `marker`, replacing any marker for the same pid.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be written.
    pub fn write(&self, marker: &SessionMarker) -> Result<PathBuf, MarkerError> {
        let path = self.path_for(marker.pid);
        write_json_atomic(&path, marker)?;
        tracing::debug!(pid = marker.pid, path = %path.display(), "Session marker written");
        Ok(path)
    }

    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn read(&self, pid: u32) -> Result<Option<SessionMarker>, MarkerError> {
        match fs::read(self.path_for(pid)) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the marker for `pid`. Returns whether one existed.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be removed.
    pub fn remove(&self, pid: u32) -> Result<bool, MarkerError> {
        match fs::remove_file(self.path_for(pid)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable marker, sorted by pid. Unparseable files are skipped.
    ///
    /// # Errors
    /// Returns error if the directory exists but cannot be listed.
    pub fn list(&self) -> Result<Vec<SessionMarker>, MarkerError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut markers = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_marker = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("pid-") && n.ends_with(".json"));
            if !is_marker {
                continue;
            }
            match fs::read(&path)
                .map_err(MarkerError::from)
                .and_then(|raw| Ok(serde_json::from_slice::<SessionMarker>(&raw)?))
            {
                Ok(marker) => markers.push(marker),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable marker"),
            }
        }
        markers.sort_by_key(|m| m.pid);
        Ok(markers)
    }
}

/// Serialize `value` to `path` through a temp file and rename. The file
/// is created owner-only.
///
/// # Errors
/// Returns error if serialization or any filesystem step fails.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MarkerError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let body = serde_json::to_vec_pretty(value)?;
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("marker");
    let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    if let Err(e) = write_then_rename(&tmp, path, &body) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn write_then_rename(tmp: &Path, path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = open_owner_only(tmp)?;
    file.write_all(body)?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

#[cfg(unix)]
fn open_owner_only(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_owner_only(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn marker(pid: u32, command: &str) -> SessionMarker {
        SessionMarker {
            pid,
            happy_session_id: Some(format!("session-{pid}")),
            started_by: StartedBy::Daemon,
            cwd: Some("/work".into()),
            process_command_hash: sha256_hex(command),
            process_command: command.into(),
            metadata: Some(json!({"path": "/work"})),
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path().join("sessions"));
        let m = marker(42, "claude --print");

        let path = store.write(&m).unwrap();
        assert_eq!(path, store.path_for(42));
        assert_eq!(store.read(42).unwrap(), Some(m));

        assert!(store.remove(42).unwrap());
        assert!(!store.remove(42).unwrap());
        assert_eq!(store.read(42).unwrap(), None);
    }

    #[test]
    fn test_wire_field_names() {
        let value = serde_json::to_value(marker(7, "codex")).unwrap();
        assert_eq!(value["happySessionId"], "session-7");
        assert_eq!(value["startedBy"], "daemon");
        assert_eq!(value["processCommand"], "codex");
        assert!(value["processCommandHash"].is_string());
        assert!(value["createdAt"].is_i64());
    }

    #[cfg(unix)]
    #[test]
    fn test_marker_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        let path = store.write(&marker(1, "x")).unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_list_skips_junk_and_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        store.write(&marker(9, "b")).unwrap();
        store.write(&marker(3, "a")).unwrap();
        fs::write(dir.path().join("pid-5.json"), "{not json").unwrap();
        fs::write(dir.path().join(".pid-6.json.abc.tmp"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let pids: Vec<u32> = store.list().unwrap().iter().map(|m| m.pid).collect();
        assert_eq!(pids, vec![3, 9]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }
}
