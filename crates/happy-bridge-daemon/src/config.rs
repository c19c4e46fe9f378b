//! Daemon configuration.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Relay used when `HAPPY_SERVER_URL` is unset.
pub const DEFAULT_SERVER_URL: &str = "https://api.cluster-fluster.com";

const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot determine home directory; set HAPPY_HOME_DIR")]
    NoHomeDir,
    #[error("Invalid HAPPY_DAEMON_PORT: {0}")]
    InvalidPort(String),
}

/// Where the daemon keeps its state and how it reaches the relay.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub home_dir: PathBuf,
    pub markers_dir: PathBuf,
    pub server_url: String,
    /// Control server port on 127.0.0.1. `0` picks an ephemeral port.
    pub control_port: u16,
    /// How often tracked sessions are checked for liveness.
    pub prune_interval: Duration,
}

impl DaemonConfig {
    /// Build from `HAPPY_HOME_DIR`, `HAPPY_SERVER_URL` and `HAPPY_DAEMON_PORT`.
    ///
    /// # Errors
    /// Returns error if no home directory can be found or the port is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let home_dir = match lookup("HAPPY_HOME_DIR").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir().ok_or(ConfigError::NoHomeDir)?.join(".happy"),
        };
        let server_url = lookup("HAPPY_SERVER_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let control_port = match lookup("HAPPY_DAEMON_PORT").filter(|v| !v.is_empty()) {
            Some(port) => port.parse().map_err(|_| ConfigError::InvalidPort(port))?,
            None => 0,
        };
        Ok(Self::new(home_dir)
            .with_server_url(server_url)
            .with_control_port(control_port))
    }

    /// Config rooted at `home_dir` with every other setting at its default.
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        let home_dir = home_dir.into();
        Self {
            markers_dir: home_dir.join("daemon").join("sessions"),
            home_dir,
            server_url: DEFAULT_SERVER_URL.to_string(),
            control_port: 0,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
        }
    }

    /// `<home>/daemon.state.json`, written once the control server is up.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.home_dir.join("daemon.state.json")
    }

    #[must_use]
    pub fn with_markers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.markers_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    #[must_use]
    pub const fn with_control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    #[must_use]
    pub const fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let config = DaemonConfig::from_lookup(lookup(&[
            ("HAPPY_HOME_DIR", "/tmp/happy-test"),
            ("HAPPY_SERVER_URL", "http://localhost:3005"),
            ("HAPPY_DAEMON_PORT", "4100"),
        ]))
        .unwrap();
        assert_eq!(config.home_dir, PathBuf::from("/tmp/happy-test"));
        assert_eq!(config.markers_dir, PathBuf::from("/tmp/happy-test/daemon/sessions"));
        assert_eq!(config.server_url, "http://localhost:3005");
        assert_eq!(config.control_port, 4100);
        assert_eq!(config.state_file(), PathBuf::from("/tmp/happy-test/daemon.state.json"));
    }

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::from_lookup(lookup(&[("HAPPY_HOME_DIR", "/h")])).unwrap();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.control_port, 0);
    }

    #[test]
    fn test_bad_port() {
        let result = DaemonConfig::from_lookup(lookup(&[
            ("HAPPY_HOME_DIR", "/h"),
            ("HAPPY_DAEMON_PORT", "seventy"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidPort(p)) if p == "seventy"));
    }
}
