//! Newline-delimited JSON framing of agent stdio.

use serde_json::Value;

/// Parse one stdout line.
///
/// Agents print banners, progress bars and stray log lines next to their
/// JSON stream. Anything that is not a JSON object or array is dropped.
#[must_use]
pub fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !(line.starts_with('{') || line.starts_with('[')) {
        tracing::debug!(line, "Discarding non-JSON agent output");
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(line, error = %e, "Discarding malformed agent output");
            None
        }
    }
}

/// Serialize one frame for the agent's stdin.
///
/// # Errors
/// Returns error if the value cannot be serialized.
pub fn encode_line(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_non_json_lines_dropped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("Loading model..."), None);
        assert_eq!(parse_line("42"), None);
        assert_eq!(parse_line(r#""text""#), None);
        assert_eq!(parse_line("{not json"), None);
    }

    #[test]
    fn test_objects_and_arrays_kept() {
        assert_eq!(parse_line(r#"  {"type":"system"}  "#), Some(json!({"type": "system"})));
        assert_eq!(parse_line("[1,2]"), Some(json!([1, 2])));
    }

    #[test]
    fn test_encode_line_terminates() {
        let bytes = encode_line(&json!({"a": 1})).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
    }
}
