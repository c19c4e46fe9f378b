//! Capability registry behind the `capabilities.*` RPC methods.
//!
//! A capability is a local executable the bridge can report on and run
//! with a fixed argument list. Remote callers pick a capability by name;
//! they never supply arguments.

use std::{collections::BTreeMap, process::Stdio, time::Duration};

use happy_bridge_agent::{AgentKind, resolve_executable_path};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability error.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Unknown capability: {0}")]
    Unknown(String),
    #[error("Executable for {0} not found")]
    NotFound(String),
    #[error("{name} did not finish within {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One registered capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub name: String,
    pub description: String,
    pub executable: String,
    #[serde(default)]
    pub invoke_args: Vec<String>,
}

/// Public part of a capability, as returned by `describe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub description: String,
}

/// Result of `detect` for one capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Result of `invoke`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Named capabilities, looked up by name.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<String, Capability>,
    timeout: Duration,
}

impl Default for CapabilityRegistry {
    /// Registry with one `--version` capability per supported agent.
    fn default() -> Self {
        let mut registry = Self::new(DEFAULT_INVOKE_TIMEOUT);
        for kind in AgentKind::ALL {
            registry.register(Capability {
                name: kind.as_str().to_string(),
                description: format!("{kind} agent CLI"),
                executable: kind.as_str().to_string(),
                invoke_args: vec!["--version".to_string()],
            });
        }
        registry
    }
}

impl CapabilityRegistry {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            capabilities: BTreeMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, capability: Capability) {
        self.capabilities.insert(capability.name.clone(), capability);
    }

    #[must_use]
    pub fn describe(&self) -> Vec<CapabilityInfo> {
        self.capabilities
            .values()
            .map(|c| CapabilityInfo {
                name: c.name.clone(),
                description: c.description.clone(),
            })
            .collect()
    }

    /// Resolve every capability's executable on `PATH`.
    pub async fn detect(&self) -> BTreeMap<String, Detection> {
        let mut detected = BTreeMap::new();
        for capability in self.capabilities.values() {
            let path = resolve_executable_path(&capability.executable).await;
            detected.insert(
                capability.name.clone(),
                Detection {
                    available: path.is_some(),
                    path: path.map(|p| p.display().to_string()),
                },
            );
        }
        detected
    }

    /// Run a capability with its fixed arguments.
    ///
    /// # Errors
    /// Returns error if the capability is unknown, its executable is
    /// missing, it cannot be started, or it exceeds the timeout.
    pub async fn invoke(&self, name: &str) -> Result<Invocation, CapabilityError> {
        let capability = self
            .capabilities
            .get(name)
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;
        let program = resolve_executable_path(&capability.executable)
            .await
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;

        let child = Command::new(program)
            .args(&capability.invoke_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CapabilityError::Timeout {
                name: name.to_string(),
                timeout: self.timeout,
            })??;

        tracing::debug!(capability = name, status = ?output.status.code(), "Capability invoked");
        Ok(Invocation {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
