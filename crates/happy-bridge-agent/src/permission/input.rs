//! Permission-input extraction.
//!
//! Some backends send a permission request without the tool input, or with
//! an empty one, after having reported the input on an earlier tool-call
//! event. The cache below remembers the last non-empty input per call id.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Request fields that may carry the tool input.
const REQUEST_INPUT_FIELDS: &[&str] = &["input", "rawInput", "arguments"];

/// Whether a tool input carries nothing (`null` or `{}`).
#[must_use]
pub fn is_empty_input(input: &Value) -> bool {
    match input {
        Value::Null => true,
        Value::Object(obj) => obj.is_empty(),
        _ => false,
    }
}

/// Last known input per tool call id.
#[derive(Debug, Default)]
pub struct ToolInputCache {
    inputs: HashMap<String, Value>,
}

impl ToolInputCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `input` for `tool_call_id`. Empty inputs never overwrite.
    pub fn record(&mut self, tool_call_id: &str, input: &Value) {
        if !is_empty_input(input) {
            self.inputs.insert(tool_call_id.to_string(), input.clone());
        }
    }

    #[must_use]
    pub fn get(&self, tool_call_id: &str) -> Option<&Value> {
        self.inputs.get(tool_call_id)
    }

    /// Forget a finished call.
    pub fn remove(&mut self, tool_call_id: &str) -> Option<Value> {
        self.inputs.remove(tool_call_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Input of a permission request.
///
/// Takes the first non-empty of the tool call's own input, the request's
/// top-level input fields, and the cache. Falls back to `{}`.
#[must_use]
pub fn extract_permission_input(
    tool_call_input: Option<&Value>,
    request: &Value,
    cache: &ToolInputCache,
    tool_call_id: &str,
) -> Value {
    tool_call_input
        .filter(|v| !is_empty_input(v))
        .or_else(|| {
            REQUEST_INPUT_FIELDS
                .iter()
                .filter_map(|field| request.get(field))
                .find(|v| !is_empty_input(v))
        })
        .or_else(|| cache.get(tool_call_id))
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_tool_call_input_first() {
        let mut cache = ToolInputCache::new();
        cache.record("c1", &json!({"path": "cached"}));
        let input = extract_permission_input(
            Some(&json!({"path": "direct"})),
            &json!({"input": {"path": "request"}}),
            &cache,
            "c1",
        );
        assert_eq!(input, json!({"path": "direct"}));
    }

    #[test]
    fn test_request_fields_in_order() {
        let cache = ToolInputCache::new();
        let request = json!({"input": {}, "rawInput": {"cmd": "ls"}, "arguments": {"x": 1}});
        let input = extract_permission_input(Some(&Value::Null), &request, &cache, "c1");
        assert_eq!(input, json!({"cmd": "ls"}));
    }

    #[test]
    fn test_falls_back_to_cache_then_empty() {
        let mut cache = ToolInputCache::new();
        cache.record("c1", &json!({"file": "a.rs"}));
        cache.record("c1", &json!({}));
        assert_eq!(
            extract_permission_input(None, &json!({}), &cache, "c1"),
            json!({"file": "a.rs"})
        );
        assert_eq!(extract_permission_input(None, &json!({}), &cache, "c2"), json!({}));
    }

    #[test]
    fn test_empty_input() {
        assert!(is_empty_input(&Value::Null));
        assert!(is_empty_input(&json!({})));
        assert!(!is_empty_input(&json!([])));
        assert!(!is_empty_input(&json!({"a": null})));
    }
}
