//! Tool-name resolution.
//!
//! Backends do not always say which tool they are running. Resolution falls
//! back in three tiers: an explicit non-generic name, then a substring match
//! of the opaque call id against the backend's pattern table (longest pattern
//! wins), then the backend's empty-input default. Anything left over is
//! reported as [`UNRESOLVED_TOOL_NAME`].

use serde_json::Value;

use crate::backend::AgentKind;
use crate::permission::input::is_empty_input;

/// Name given to tools that could not be identified.
pub const UNRESOLVED_TOOL_NAME: &str = "other";

/// Placeholder names that carry no information.
const GENERIC_TOOL_NAMES: &[&str] = &["", "other", "unknown", "tool", "generic"];

const GEMINI_PATTERNS: &[(&str, &str)] = &[
    ("write_todos", "todo_write"),
    ("read_many_files", "read"),
    ("read_file", "read"),
    ("write_file", "write"),
    ("replace", "edit"),
    ("run_shell_command", "bash"),
    ("list_directory", "ls"),
    ("search_file_content", "grep"),
    ("glob", "glob"),
    ("google_web_search", "web_search"),
    ("web_fetch", "web_fetch"),
    ("save_memory", "save_memory"),
    ("change_title", "change_title"),
    ("write", "write"),
    ("read", "read"),
    ("edit", "edit"),
    ("shell", "bash"),
];

const OPENCODE_PATTERNS: &[(&str, &str)] = &[
    ("todowrite", "todo_write"),
    ("todoread", "todo_read"),
    ("webfetch", "web_fetch"),
    ("bash", "bash"),
    ("edit", "edit"),
    ("write", "write"),
    ("read", "read"),
    ("glob", "glob"),
    ("grep", "grep"),
    ("list", "ls"),
    ("patch", "patch"),
    ("task", "task"),
];

const CODEX_PATTERNS: &[(&str, &str)] = &[
    ("exec_command", "bash"),
    ("apply_patch", "edit"),
    ("shell", "bash"),
];

/// How a tool name was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSource {
    Explicit,
    CallIdPattern,
    EmptyInputDefault,
    Unresolved,
}

/// Outcome of tool-name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedToolName {
    pub name: String,
    pub source: NameSource,
}

impl ResolvedToolName {
    /// An unresolved name.
    #[must_use]
    pub fn unresolved() -> Self {
        Self {
            name: UNRESOLVED_TOOL_NAME.to_string(),
            source: NameSource::Unresolved,
        }
    }

    /// Whether a concrete tool was identified.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.source != NameSource::Unresolved && !is_generic(&self.name)
    }
}

/// Whether `name` is a placeholder rather than a tool name.
#[must_use]
pub fn is_generic(name: &str) -> bool {
    let name = name.trim();
    GENERIC_TOOL_NAMES.iter().any(|g| name.eq_ignore_ascii_case(g))
}

/// Per-backend call id patterns.
#[derive(Debug, Clone, Copy)]
pub struct ToolPatternTable {
    patterns: &'static [(&'static str, &'static str)],
    empty_input_default: Option<&'static str>,
}

impl ToolPatternTable {
    /// Table for a backend.
    #[must_use]
    pub const fn for_backend(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Claude => Self::new(&[], None),
            AgentKind::Codex => Self::new(CODEX_PATTERNS, None),
            AgentKind::Gemini => Self::new(GEMINI_PATTERNS, Some("think")),
            AgentKind::OpenCode => Self::new(OPENCODE_PATTERNS, None),
        }
    }

    /// Build a table from `(substring, tool)` pairs.
    #[must_use]
    pub const fn new(
        patterns: &'static [(&'static str, &'static str)],
        empty_input_default: Option<&'static str>,
    ) -> Self {
        Self {
            patterns,
            empty_input_default,
        }
    }

    /// Tool whose pattern is the longest substring of `call_id`.
    /// Equal lengths resolve to the earlier table entry.
    #[must_use]
    pub fn match_call_id(&self, call_id: &str) -> Option<&'static str> {
        let id = call_id.to_ascii_lowercase();
        let mut best: Option<(usize, &'static str)> = None;
        for (pattern, tool) in self.patterns {
            if id.contains(pattern) && best.is_none_or(|(len, _)| pattern.len() > len) {
                best = Some((pattern.len(), tool));
            }
        }
        best.map(|(_, tool)| tool)
    }

    /// Resolve a tool name.
    #[must_use]
    pub fn resolve(&self, reported: Option<&str>, call_id: &str, input: &Value) -> ResolvedToolName {
        if let Some(name) = reported.map(str::trim).filter(|n| !is_generic(n)) {
            return ResolvedToolName {
                name: name.to_string(),
                source: NameSource::Explicit,
            };
        }
        if let Some(tool) = self.match_call_id(call_id) {
            return ResolvedToolName {
                name: tool.to_string(),
                source: NameSource::CallIdPattern,
            };
        }
        if let Some(tool) = self.empty_input_default.filter(|_| is_empty_input(input)) {
            return ResolvedToolName {
                name: tool.to_string(),
                source: NameSource::EmptyInputDefault,
            };
        }
        ResolvedToolName::unresolved()
    }
}

/// Resolve a tool name for a backend.
#[must_use]
pub fn resolve_tool_name(
    kind: AgentKind,
    reported: Option<&str>,
    call_id: &str,
    input: &Value,
) -> ResolvedToolName {
    ToolPatternTable::for_backend(kind).resolve(reported, call_id, input)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_explicit_name_wins() {
        let r = resolve_tool_name(AgentKind::Gemini, Some("read_file"), "write_todos-1", &json!({}));
        assert_eq!(r.name, "read_file");
        assert_eq!(r.source, NameSource::Explicit);
    }

    #[test]
    fn test_longest_pattern_wins() {
        let r = resolve_tool_name(AgentKind::Gemini, Some("other"), "write_todos-47", &json!({"todos": []}));
        assert_eq!(r.name, "todo_write");
        assert_eq!(r.source, NameSource::CallIdPattern);
    }

    #[test]
    fn test_longest_match_independent_of_table_order() {
        const TABLE: &[(&str, &str)] = &[("write", "write"), ("write_todos", "todo_write")];
        let table = ToolPatternTable::new(TABLE, None);
        assert_eq!(table.match_call_id("write_todos-47"), Some("todo_write"));
        assert_eq!(table.match_call_id("WRITE-3"), Some("write"));
    }

    #[test]
    fn test_empty_input_default() {
        let r = resolve_tool_name(AgentKind::Gemini, None, "call-9", &json!({}));
        assert_eq!(r.name, "think");
        assert_eq!(r.source, NameSource::EmptyInputDefault);

        let r = resolve_tool_name(AgentKind::Gemini, None, "call-9", &json!({"x": 1}));
        assert!(!r.is_resolved());
    }

    #[test]
    fn test_unresolved_without_default() {
        let r = resolve_tool_name(AgentKind::OpenCode, Some("unknown"), "call_abc", &Value::Null);
        assert_eq!(r, ResolvedToolName::unresolved());
        assert!(!r.is_resolved());
    }

    #[test]
    fn test_opencode_specific_patterns() {
        let table = ToolPatternTable::for_backend(AgentKind::OpenCode);
        assert_eq!(table.match_call_id("todowrite_01"), Some("todo_write"));
        assert_eq!(table.match_call_id("bash_77"), Some("bash"));
    }
}
