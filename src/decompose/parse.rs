//! Completion output parsing.

use serde_json::{Map, Value};

/// Why a completion could not be turned into subtask entries.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("completion was empty")]
    Empty,

    #[error("no JSON array found in completion")]
    NoArray,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("array contained no subtask objects")]
    NoEntries,
}

/// Parse subtask entries out of raw completion text.
///
/// Tries the whole text first, then the first bracket-delimited array
/// (inside a markdown fence if there is one). Non-object array items are
/// discarded.
pub fn parse_entries(text: &str) -> Result<Vec<Map<String, Value>>, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let value = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(_) => {
            let candidate = extract_json_array(trimmed).ok_or(ParseError::NoArray)?;
            serde_json::from_str::<Value>(candidate).map_err(|e| ParseError::InvalidJson(e.to_string()))?
        }
    };

    let Value::Array(items) = value else {
        return Err(ParseError::NoArray);
    };

    let entries: Vec<Map<String, Value>> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();

    if entries.is_empty() {
        return Err(ParseError::NoEntries);
    }
    Ok(entries)
}

/// Locate a JSON array in text that may carry markdown or prose around it.
fn extract_json_array(text: &str) -> Option<&str> {
    // Fenced block, with or without a language tag
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('[') {
                return Some(inner);
            }
        }
    }

    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_array() {
        let entries = parse_entries(r#"[{"title": "a"}, {"title": "b"}]"#).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["title"], "b");
    }

    #[test]
    fn fenced_array() {
        let text = "Here you go:\n```json\n[{\"title\": \"a\"}]\n```\nGood luck";
        assert_eq!(parse_entries(text).unwrap().len(), 1);

        let bare_fence = "```\n[{\"title\": \"a\"}]\n```";
        assert_eq!(parse_entries(bare_fence).unwrap().len(), 1);
    }

    #[test]
    fn array_inside_prose() {
        let text = "Sure! [{\"title\": \"x\", \"dependencies\": []}] Hope that helps.";
        let entries = parse_entries(text).unwrap();
        assert_eq!(entries[0]["title"], "x");
    }

    #[test]
    fn failures() {
        assert_eq!(parse_entries("   "), Err(ParseError::Empty));
        assert_eq!(parse_entries("I cannot help with that."), Err(ParseError::NoArray));
        assert_eq!(parse_entries(r#"{"title": "a"}"#), Err(ParseError::NoArray));
        assert_eq!(parse_entries("[1, 2, \"three\"]"), Err(ParseError::NoEntries));
        assert!(matches!(parse_entries("oops [not json] here"), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn non_object_items_are_skipped() {
        let entries = parse_entries(r#"[{"title": "a"}, 7, null]"#).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
