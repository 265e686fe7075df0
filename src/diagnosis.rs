//! Failure diagnosis.
//!
//! The [`DiagnosisExtractor`] turns a failing execution's transcript into
//! exactly one [`Diagnosis`]. Categorisation is a pure function of the
//! transcript text: ordered regex rules are tried first, then a category
//! named in an embedded structured payload, then `unknown`.

use crate::error::{HealError, Result};
use crate::parse::extract_json_payload_where;
use crate::transcript::{EventKind, Transcript};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    /// The element the test looked for was never found
    SelectorNotFound,
    /// A wait expired without any selector signal
    Timeout,
    /// An assertion compared an expected and an actual value
    AssertionMismatch,
    /// Nothing recognisable
    Unknown,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelectorNotFound => write!(f, "selector-not-found"),
            Self::Timeout => write!(f, "timeout"),
            Self::AssertionMismatch => write!(f, "assertion-mismatch"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FailureCategory {
    /// Parse a category name, accepting `_` or `-` separators in any case.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace('_', "-").as_str() {
            "selector-not-found" => Some(Self::SelectorNotFound),
            "timeout" => Some(Self::Timeout),
            "assertion-mismatch" => Some(Self::AssertionMismatch),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

/// Structured explanation of why a test failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub category: FailureCategory,
    pub explanation: String,
    /// Description of the element the test probably meant to target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_description: Option<String>,
}

impl Diagnosis {
    /// Create a diagnosis with a fresh id.
    pub fn new(category: FailureCategory, explanation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            selector: None,
            category,
            explanation: explanation.into(),
            target_description: None,
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    #[must_use]
    pub fn with_target_description(mut self, description: impl Into<String>) -> Self {
        self.target_description = Some(description.into());
        self
    }
}

/// Structured diagnosis payload a reporter may embed in runner output.
#[derive(Debug, Default, Deserialize)]
struct DiagnosisPayload {
    category: Option<String>,
    #[serde(alias = "failing_selector")]
    selector: Option<String>,
    #[serde(alias = "reason", alias = "message")]
    explanation: Option<String>,
    #[serde(alias = "suggested_target", alias = "target")]
    target_description: Option<String>,
}

/// Extracts a [`Diagnosis`] from a transcript.
pub struct DiagnosisExtractor {
    rules: Vec<(Regex, FailureCategory)>,
    selector_patterns: Vec<Regex>,
}

impl Default for DiagnosisExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosisExtractor {
    /// Create an extractor with the standard rule set.
    #[must_use]
    pub fn new() -> Self {
        let rules = [
            // Selector signals (must come before generic timeouts)
            (r"(?i)never found it", FailureCategory::SelectorNotFound),
            (r"(?i)expected to find element", FailureCategory::SelectorNotFound),
            (r"(?i)unable to find (an )?element", FailureCategory::SelectorNotFound),
            (r"(?i)element (was )?not found", FailureCategory::SelectorNotFound),
            (r"(?i)no (such )?element", FailureCategory::SelectorNotFound),
            (
                r"(?i)waiting for (locator|selector|element)",
                FailureCategory::SelectorNotFound,
            ),
            (
                r"(?i)resolved to 0 elements",
                FailureCategory::SelectorNotFound,
            ),
            (r"(?i)could not find element", FailureCategory::SelectorNotFound),
            // Generic timeouts
            (r"(?i)timed out", FailureCategory::Timeout),
            (r"(?i)timeout \d+\s*ms exceeded", FailureCategory::Timeout),
            (r"(?i)\btimeout\b", FailureCategory::Timeout),
            // Assertions with matched values
            (
                r"(?i)expected\b.+\b(to (equal|be|have|contain|include|match)|but (got|was|received))",
                FailureCategory::AssertionMismatch,
            ),
            (
                r"(?is)expected( value)?:.+received( value)?:",
                FailureCategory::AssertionMismatch,
            ),
            (r"(?i)assert .+ (==|!=) ", FailureCategory::AssertionMismatch),
        ];

        let selector_patterns = [
            r#"(?i)find element:?\s*[`'"]([^`'"]+)[`'"]"#,
            r#"(?i)waiting for (?:locator|selector)\s*\(?\s*[`'"]([^`'"]+)[`'"]"#,
            r#"locator\(\s*[`'"]([^`'"]+)[`'"]"#,
            r#"\bget\(\s*[`'"]([^`'"]+)[`'"]"#,
        ];

        Self {
            rules: rules
                .into_iter()
                .filter_map(|(pattern, category)| {
                    Regex::new(pattern).ok().map(|re| (re, category))
                })
                .collect(),
            selector_patterns: selector_patterns
                .into_iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect(),
        }
    }

    /// Produce exactly one diagnosis for a failing transcript.
    ///
    /// Fails with [`HealError::Extraction`] only when the transcript holds no
    /// error, output or snapshot content at all. The artifact source is used
    /// to prefer selectors that actually occur in the test.
    pub fn extract(&self, transcript: &Transcript, source: &str) -> Result<Diagnosis> {
        let has_payload = transcript.events.iter().any(|e| {
            matches!(
                e.kind,
                EventKind::Error | EventKind::Output | EventKind::Snapshot
            ) && !e.payload.trim().is_empty()
        });
        if !has_payload {
            return Err(HealError::extraction(
                "transcript contains no error, output or snapshot to diagnose",
            ));
        }

        let error_text = transcript.error_text();
        let full_text = non_snapshot_text(transcript);
        let payload: DiagnosisPayload =
            extract_json_payload_where(&full_text, |v| v.get("category").is_some())
                .unwrap_or_default();

        let ruled = self
            .match_rule(&error_text)
            .or_else(|| self.match_rule(&full_text));

        let (category, explanation) = match ruled {
            Some((category, line)) => (category, line),
            None => match payload
                .category
                .as_deref()
                .and_then(FailureCategory::parse)
            {
                Some(category) => {
                    let explanation = payload
                        .explanation
                        .clone()
                        .unwrap_or_else(|| first_line(&error_text, &full_text));
                    (category, explanation)
                }
                None => (FailureCategory::Unknown, first_line(&error_text, &full_text)),
            },
        };

        let mut diagnosis = Diagnosis::new(category, explanation);
        let selector = payload
            .selector
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.find_selector(&error_text, source))
            .or_else(|| self.find_selector(&full_text, source));
        if let Some(selector) = selector {
            diagnosis = diagnosis.with_selector(selector);
        }
        if let Some(target) = payload.target_description {
            diagnosis = diagnosis.with_target_description(target);
        }

        debug!(
            category = %diagnosis.category,
            selector = ?diagnosis.selector,
            "Extracted diagnosis"
        );
        Ok(diagnosis)
    }

    /// First rule matching the text, with the line it matched.
    fn match_rule(&self, text: &str) -> Option<(FailureCategory, String)> {
        if text.trim().is_empty() {
            return None;
        }
        for (regex, category) in &self.rules {
            if regex.is_match(text) {
                let line = text
                    .lines()
                    .find(|line| regex.is_match(line))
                    .or_else(|| text.lines().find(|line| !line.trim().is_empty()))
                    .unwrap_or_default();
                return Some((*category, line.trim().to_string()));
            }
        }
        None
    }

    /// Quoted locator in the text, preferring one present in the source.
    fn find_selector(&self, text: &str, source: &str) -> Option<String> {
        let candidates: Vec<String> = self
            .selector_patterns
            .iter()
            .flat_map(|re| re.captures_iter(text))
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .collect();

        candidates
            .iter()
            .find(|c| source.contains(c.as_str()))
            .or_else(|| candidates.first())
            .cloned()
    }
}

fn non_snapshot_text(transcript: &Transcript) -> String {
    transcript
        .events
        .iter()
        .filter(|e| e.kind != EventKind::Snapshot)
        .map(|e| e.payload.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn first_line(preferred: &str, fallback: &str) -> String {
    preferred
        .lines()
        .chain(fallback.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no error text captured")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors(lines: &[&str]) -> Transcript {
        lines
            .iter()
            .fold(Transcript::new(), |t, line| t.with_event(EventKind::Error, *line))
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(
            FailureCategory::parse("SELECTOR_NOT_FOUND"),
            Some(FailureCategory::SelectorNotFound)
        );
        assert_eq!(FailureCategory::parse("flaky"), None);
        assert_eq!(FailureCategory::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_cypress_selector_not_found() {
        let transcript = errors(&[
            "AssertionError: Timed out retrying after 4000ms: Expected to find element: `[data-cy=submit]`, but never found it.",
        ]);
        let diagnosis = DiagnosisExtractor::new()
            .extract(&transcript, "cy.get('[data-cy=submit]').click()")
            .unwrap();

        assert_eq!(diagnosis.category, FailureCategory::SelectorNotFound);
        assert_eq!(diagnosis.selector.as_deref(), Some("[data-cy=submit]"));
        assert!(diagnosis.explanation.contains("never found it"));
    }

    #[test]
    fn test_playwright_waiting_for_locator() {
        let transcript = errors(&[
            "Error: Timeout 30000ms exceeded.",
            "  - waiting for locator('#checkout')",
        ]);
        let diagnosis = DiagnosisExtractor::new()
            .extract(&transcript, "await page.locator('#checkout').click();")
            .unwrap();

        assert_eq!(diagnosis.category, FailureCategory::SelectorNotFound);
        assert_eq!(diagnosis.selector.as_deref(), Some("#checkout"));
        assert!(diagnosis.explanation.contains("waiting for locator"));
    }

    #[test]
    fn test_generic_timeout() {
        let transcript = errors(&["Error: page.goto: net::ERR timed out after 30000ms"]);
        let diagnosis = DiagnosisExtractor::new().extract(&transcript, "").unwrap();
        assert_eq!(diagnosis.category, FailureCategory::Timeout);
        assert!(diagnosis.selector.is_none());
    }

    #[test]
    fn test_assertion_mismatch() {
        let transcript = errors(&["AssertionError: expected 'Welcome' to equal 'Welcome back'"]);
        let diagnosis = DiagnosisExtractor::new().extract(&transcript, "").unwrap();
        assert_eq!(diagnosis.category, FailureCategory::AssertionMismatch);
    }

    #[test]
    fn test_playwright_expected_received_in_output() {
        let transcript = Transcript::new()
            .with_event(EventKind::Error, "Error: expect(received).toHaveText(expected)")
            .with_event(EventKind::Output, "Expected: \"Dashboard\"")
            .with_event(EventKind::Output, "Received: \"Home\"");
        let diagnosis = DiagnosisExtractor::new().extract(&transcript, "").unwrap();
        assert_eq!(diagnosis.category, FailureCategory::AssertionMismatch);
    }

    #[test]
    fn test_payload_category_when_no_rule_matches() {
        let transcript = Transcript::new().with_event(
            EventKind::Output,
            r##"reporter: {"category": "assertion_mismatch", "selector": "#total", "reason": "total differs", "suggested_target": "order total cell"}"##,
        );
        let diagnosis = DiagnosisExtractor::new().extract(&transcript, "").unwrap();
        assert_eq!(diagnosis.category, FailureCategory::AssertionMismatch);
        assert_eq!(diagnosis.selector.as_deref(), Some("#total"));
        assert_eq!(diagnosis.explanation, "total differs");
        assert_eq!(
            diagnosis.target_description.as_deref(),
            Some("order total cell")
        );
    }

    #[test]
    fn test_malformed_payload_falls_back_to_unknown() {
        let transcript = Transcript::new()
            .with_event(EventKind::Output, r#"{"category": "bogus", "#);
        let diagnosis = DiagnosisExtractor::new().extract(&transcript, "").unwrap();
        assert_eq!(diagnosis.category, FailureCategory::Unknown);
    }

    #[test]
    fn test_ambiguous_stack_trace_is_unknown() {
        let transcript = errors(&[
            "TypeError: Cannot read properties of undefined (reading 'map')",
            "    at Context.<anonymous> (cypress/e2e/cart.cy.js:12:8)",
        ]);
        let diagnosis = DiagnosisExtractor::new().extract(&transcript, "").unwrap();
        assert_eq!(diagnosis.category, FailureCategory::Unknown);
        assert!(diagnosis.explanation.starts_with("TypeError"));
    }

    #[test]
    fn test_empty_transcript_is_extraction_error() {
        let err = DiagnosisExtractor::new()
            .extract(&Transcript::new(), "")
            .unwrap_err();
        assert!(matches!(err, HealError::Extraction { .. }));

        let actions_only = Transcript::new().with_event(EventKind::Action, "cy.visit('/')");
        assert!(DiagnosisExtractor::new().extract(&actions_only, "").is_err());
    }

    #[test]
    fn test_snapshot_only_transcript_is_diagnosable() {
        let transcript = Transcript::new().with_event(EventKind::Snapshot, "- button \"Pay\"");
        let diagnosis = DiagnosisExtractor::new().extract(&transcript, "").unwrap();
        assert_eq!(diagnosis.category, FailureCategory::Unknown);
    }

    #[test]
    fn test_selector_prefers_source_occurrence() {
        let transcript = errors(&[
            "Expected to find element: `#ghost`, but never found it.",
            "waiting for locator('#real')",
        ]);
        let diagnosis = DiagnosisExtractor::new()
            .extract(&transcript, "page.locator('#real')")
            .unwrap();
        assert_eq!(diagnosis.selector.as_deref(), Some("#real"));
    }

    #[test]
    fn test_categorisation_is_deterministic() {
        let transcript = errors(&["Error: Timeout 5000ms exceeded."]);
        let extractor = DiagnosisExtractor::new();
        let a = extractor.extract(&transcript, "").unwrap();
        let b = extractor.extract(&transcript, "").unwrap();
        assert_eq!(a.category, b.category);
        assert_eq!(a.explanation, b.explanation);
        assert_ne!(a.id, b.id);
    }
}
