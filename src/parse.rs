//! Tolerant JSON location and repair for model and runner output.
//!
//! Responses from the reasoning capability (and structured payloads embedded
//! in runner output) are often wrapped in prose or markdown fences, use smart
//! quotes, carry trailing commas or are cut off mid-object. Everything here
//! is best effort: callers parse first, then validate what they got.

use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;

/// Strip markdown code fences from a response.
#[must_use]
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        trimmed
    };
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Extract the first balanced fragment between matching delimiters.
///
/// Delimiters inside string literals are ignored. Returns `None` when the
/// fragment never closes.
#[must_use]
pub fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start_idx = None;

    for (i, c) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if c == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }

        if c == open {
            if depth == 0 {
                start_idx = Some(i);
            }
            depth += 1;
        } else if c == close && depth > 0 {
            depth -= 1;
            if depth == 0 {
                if let Some(start) = start_idx {
                    return Some(&text[start..=i]);
                }
            }
        }
    }

    None
}

fn trailing_comma_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").ok()).as_ref()
}

/// Fix common JSON issues: smart quotes, trailing commas and stray control
/// characters.
#[must_use]
pub fn repair_json(json: &str) -> String {
    let mut fixed = json
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    if let Some(re) = trailing_comma_regex() {
        fixed = re.replace_all(&fixed, "$1").into_owned();
    }

    fixed
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect()
}

/// Append the closers an unterminated fragment is missing.
///
/// ```
/// use mender::parse::close_unbalanced;
///
/// assert_eq!(close_unbalanced(r#"{"a": [1, 2"#), r#"{"a": [1, 2]}"#);
/// assert_eq!(close_unbalanced(r#"{"a": "cut"#), r#"{"a": "cut"}"#);
/// ```
#[must_use]
pub fn close_unbalanced(fragment: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for c in fragment.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut closed = fragment.trim_end().to_string();
    if in_string {
        closed.push('"');
    }
    while let Some(closer) = stack.pop() {
        closed.push(closer);
    }
    closed
}

/// Every parseable JSON object in free-form text, in order of its opening
/// brace.
///
/// Each `{` is tried as the start of a balanced fragment, first as-is and
/// then repaired. Braces in surrounding prose or code simply yield no
/// candidate. Nested objects are yielded after their parent.
pub fn json_object_candidates(text: &str) -> impl Iterator<Item = serde_json::Value> + '_ {
    let clean = strip_markdown_fences(text);
    clean
        .char_indices()
        .filter(|&(_, c)| c == '{')
        .filter_map(move |(start, _)| {
            let fragment = extract_json_fragment(&clean[start..], '{', '}')?;
            serde_json::from_str::<serde_json::Value>(fragment)
                .ok()
                .or_else(|| serde_json::from_str(&repair_json(fragment)).ok())
        })
        .filter(serde_json::Value::is_object)
}

/// Locate and parse the first JSON object in free-form text.
///
/// Falls back to the unterminated tail from the first `{` with missing
/// closers appended when no balanced object parses. Leading and trailing
/// prose is ignored.
#[must_use]
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    if let Some(value) = json_object_candidates(text).next() {
        return Some(value);
    }
    close_truncated(text)
}

fn close_truncated(text: &str) -> Option<serde_json::Value> {
    let clean = strip_markdown_fences(text);
    let start = clean.find('{')?;
    let repaired = close_unbalanced(&repair_json(&clean[start..]));
    serde_json::from_str(&repair_json(&repaired)).ok()
}

/// Locate the first JSON object in text that deserializes into `T`.
#[must_use]
pub fn extract_json_payload<T: DeserializeOwned>(text: &str) -> Option<T> {
    extract_json_payload_where(text, |_: &serde_json::Value| true)
}

/// Like [`extract_json_payload`], but prefers the first object accepted by
/// `prefer`, including a truncated object closed up at the end. Without an
/// accepted object the first one that deserializes wins.
#[must_use]
pub fn extract_json_payload_where<T, F>(text: &str, prefer: F) -> Option<T>
where
    T: DeserializeOwned,
    F: Fn(&serde_json::Value) -> bool,
{
    let mut fallback = None;
    for value in json_object_candidates(text) {
        if prefer(&value) {
            if let Ok(payload) = serde_json::from_value::<T>(value.clone()) {
                return Some(payload);
            }
        }
        if fallback.is_none() {
            fallback = serde_json::from_value::<T>(value).ok();
        }
    }
    let truncated = close_truncated(text);
    if let Some(value) = truncated.as_ref().filter(|v| prefer(v)) {
        if let Ok(payload) = serde_json::from_value::<T>(value.clone()) {
            return Some(payload);
        }
    }
    fallback.or_else(|| truncated.and_then(|v| serde_json::from_value(v).ok()))
}

/// Keep the last `max_chars` characters of `content`, marking the cut.
#[must_use]
pub fn truncate_tail(content: &str, max_chars: usize) -> String {
    let count = content.chars().count();
    if count <= max_chars {
        return content.to_string();
    }
    let tail: String = content.chars().skip(count - max_chars).collect();
    format!("... [truncated] ...\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_strip_markdown_fences() {
        assert_eq!(strip_markdown_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_markdown_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_markdown_fences("  {}  "), "{}");
    }

    #[test]
    fn test_extract_fragment_ignores_braces_in_strings() {
        let text = r#"Here you go: {"old_string": "if (x) {", "n": {"k": 1}} trailing"#;
        assert_eq!(
            extract_json_fragment(text, '{', '}'),
            Some(r#"{"old_string": "if (x) {", "n": {"k": 1}}"#)
        );
    }

    #[test]
    fn test_extract_fragment_unterminated() {
        assert_eq!(extract_json_fragment(r#"{"a": {"b": 1}"#, '{', '}'), None);
    }

    #[test]
    fn test_repair_json() {
        let fixed = repair_json("{\u{201C}a\u{201D}: [1, 2, ], }");
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["a"][1], 2);
    }

    #[test]
    fn test_extract_json_object_with_prose_and_fences() {
        let response = "Sure! The fix:\n```json\n{\"rationale\": \"renamed\", \"content\": \"x\",}\n```";
        let value = extract_json_object(response).unwrap();
        assert_eq!(value["rationale"], "renamed");
    }

    #[test]
    fn test_extract_json_object_truncated() {
        let value = extract_json_object(r#"noise {"todos": [{"id": 1, "description": "log in"#)
            .unwrap();
        assert_eq!(value["todos"][0]["description"], "log in");
    }

    #[test]
    fn test_extract_json_object_absent() {
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn test_extract_json_payload_skips_unparseable_objects() {
        #[derive(Deserialize)]
        struct Payload {
            category: String,
        }
        // the first object is single-quoted and cannot be repaired
        let payload: Payload =
            extract_json_payload("result: {'x': 1} {\"category\": \"timeout\"}").unwrap();
        assert_eq!(payload.category, "timeout");

        let payload: Payload = extract_json_payload("{\"category\": \"timeout\"}").unwrap();
        assert_eq!(payload.category, "timeout");
    }

    #[test]
    fn test_candidates_skip_braces_in_prose() {
        let text = "The hook `beforeEach(() => { cy.visit('/') })` is fine.\n{\"rationale\": \"r\"}";
        let values: Vec<_> = json_object_candidates(text).collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["rationale"], "r");
    }

    #[test]
    fn test_extract_json_payload_where_prefers_accepted_object() {
        #[derive(Deserialize)]
        struct Payload {
            #[serde(default)]
            edits: Vec<String>,
        }
        let text = "Your config {\"retries\": 2} is fine. Fix:\n{\"edits\": [\"a\"]}";
        let payload: Payload =
            extract_json_payload_where(text, |v| v.get("edits").is_some()).unwrap();
        assert_eq!(payload.edits, vec!["a"]);

        // without a preferred object the first deserializable one wins
        let payload: Payload = extract_json_payload_where("{\"retries\": 2}", |v| {
            v.get("edits").is_some()
        })
        .unwrap();
        assert!(payload.edits.is_empty());
    }

    #[test]
    fn test_truncate_tail() {
        assert_eq!(truncate_tail("short", 10), "short");
        let truncated = truncate_tail("abcdefghij", 4);
        assert!(truncated.ends_with("ghij"));
        assert!(truncated.starts_with("... [truncated]"));
    }
}
