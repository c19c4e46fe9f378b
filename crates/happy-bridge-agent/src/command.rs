//! Agent command lines.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::backend::AgentKind;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
    #[error("Failed to quote command: {0}")]
    QuoteError(#[from] shlex::QuoteError),
}

/// Resolve an executable by name.
///
/// Absolute paths are taken as-is when they point at a file; anything else
/// is looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    let executable = executable.trim();
    if executable.is_empty() {
        return None;
    }
    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    let name = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(name).ok())
        .await
        .ok()
        .flatten()
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Shell-quoted command line, for logs.
    ///
    /// # Errors
    /// Returns error if an argument contains a NUL byte.
    pub fn to_command_line(&self) -> Result<String, CommandBuildError> {
        Ok(shlex::try_join(
            std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)),
        )?)
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for agent command lines.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base executable command.
    pub base: String,
    /// Optional parameters to append.
    pub params: Option<Vec<String>>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: None,
        }
    }

    /// Builder starting from the agent's machine-readable mode.
    #[must_use]
    pub fn for_agent(kind: AgentKind) -> Self {
        Self::new(kind.default_command())
    }

    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn override_base<S: Into<String>>(mut self, base: S) -> Self {
        self.base = base.into();
        self
    }

    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let extra: Vec<String> = more.into_iter().map(Into::into).collect();
        match &mut self.params {
            Some(p) => p.extend(extra),
            None => self.params = Some(extra),
        }
        self
    }

    /// Build command for initial invocation.
    ///
    /// # Errors
    /// Returns error if command is invalid.
    pub fn build_initial(&self) -> Result<CommandParts, CommandBuildError> {
        self.build(&[])
    }

    /// Build command resuming an earlier agent session.
    ///
    /// Only Claude accepts a resume flag on the command line; the other
    /// backends start a fresh session.
    ///
    /// # Errors
    /// Returns error if command is invalid.
    pub fn build_resume(&self, kind: AgentKind, agent_session_id: &str) -> Result<CommandParts, CommandBuildError> {
        match kind {
            AgentKind::Claude => self.build(&["--resume".to_string(), agent_session_id.to_string()]),
            AgentKind::Codex | AgentKind::Gemini | AgentKind::OpenCode => self.build(&[]),
        }
    }

    fn build(&self, additional_args: &[String]) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        if let Some(ref params) = self.params {
            parts.extend(params.iter().cloned());
        }
        parts.extend(additional_args.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_agent_command() {
        let parts = CommandBuilder::for_agent(AgentKind::Gemini)
            .extend_params(["--model", "flash"])
            .build_initial()
            .unwrap();
        assert_eq!(parts.program, "gemini");
        assert_eq!(parts.args, vec!["--experimental-acp", "--model", "flash"]);
    }

    #[test]
    fn test_build_resume_only_for_claude() {
        let builder = CommandBuilder::new("claude --verbose");
        let parts = builder.build_resume(AgentKind::Claude, "abc").unwrap();
        assert_eq!(parts.args, vec!["--verbose", "--resume", "abc"]);

        let parts = CommandBuilder::for_agent(AgentKind::Codex)
            .build_resume(AgentKind::Codex, "abc")
            .unwrap();
        assert_eq!(parts.args, vec!["proto"]);
    }

    #[test]
    fn test_empty_and_unbalanced_base() {
        assert!(matches!(
            CommandBuilder::new("").build_initial(),
            Err(CommandBuildError::EmptyCommand)
        ));
        assert!(matches!(
            CommandBuilder::new("claude \"unterminated").build_initial(),
            Err(CommandBuildError::InvalidBase(_))
        ));
    }

    #[test]
    fn test_command_line_quotes_arguments() {
        let parts = CommandParts::new("codex".into(), vec!["proto".into(), "a b".into()]);
        assert_eq!(parts.to_command_line().unwrap(), "codex proto 'a b'");
    }

    #[tokio::test]
    async fn test_missing_executable() {
        assert_eq!(resolve_executable_path("  ").await, None);
        let parts = CommandParts::new("definitely-not-an-agent-binary".into(), vec![]);
        assert!(matches!(parts.into_resolved().await, Err(CommandBuildError::NotFound(_))));
    }
}
