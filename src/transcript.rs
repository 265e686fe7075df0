//! Execution results and their session transcripts.
//!
//! A transcript is the ordered record of what happened while a test ran:
//! actions attempted, selectors used, DOM / accessibility snapshots and the
//! error text the runner printed. The subprocess adapter builds it from raw
//! runner output with [`Transcript::from_output`].

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Marker printed by the Cypress support hook before the accessibility tree.
pub const ARIA_SNAPSHOT_MARKER: &str = "ARIA SNAPSHOT (Accessibility Tree)";

/// Maximum snapshot characters kept (the tail is kept).
pub const MAX_SNAPSHOT_CHARS: usize = 30_000;

const SEPARATOR_WIDTH: usize = 80;

/// Pass/fail outcome of one test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "pass"),
            Verdict::Fail => write!(f, "fail"),
        }
    }
}

/// Kind of a transcript event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An action the test attempted (visit, click, type, ...)
    Action,
    /// A selector or locator the test used
    Selector,
    /// A DOM or accessibility-tree snapshot
    Snapshot,
    /// Error text reported by the runner
    Error,
    /// Any other runner output
    Output,
}

/// One entry in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: String,
}

impl SessionEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload: payload.into(),
        }
    }
}

/// Ordered sequence of session events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub events: Vec<SessionEvent>,
}

/// Ordered line patterns; the first match decides the event kind.
fn line_patterns() -> &'static [(Regex, EventKind)] {
    static PATTERNS: OnceLock<Vec<(Regex, EventKind)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let patterns = [
            (
                r"(?i)(\berror\b|assertionerror|timed out|timeout|exceeded|expected .+ (to|but)|\bfailed\b|failing|not found|never found|exception|traceback)",
                EventKind::Error,
            ),
            (
                r"(?i)\b(cy\.(visit|click|type|get|contains|find|select|check)|page\.(goto|click|fill|type|press|check|locator))|\.click\(|\.fill\(|\.type\(",
                EventKind::Action,
            ),
            (
                r"(?i)(locator\(|get_by_|getBy[A-Z]|selector|data-(test|cy|testid)=)",
                EventKind::Selector,
            ),
        ];
        patterns
            .into_iter()
            .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
            .collect()
    })
}

fn classify_line(line: &str) -> EventKind {
    line_patterns()
        .iter()
        .find(|(re, _)| re.is_match(line))
        .map_or(EventKind::Output, |(_, kind)| *kind)
}

impl Transcript {
    /// Create an empty transcript.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn push(&mut self, event: SessionEvent) {
        self.events.push(event);
    }

    /// Append an event of the given kind.
    #[must_use]
    pub fn with_event(mut self, kind: EventKind, payload: impl Into<String>) -> Self {
        self.push(SessionEvent::new(kind, payload));
        self
    }

    /// Build a transcript from combined runner output.
    ///
    /// Every non-blank line becomes one event, classified as error, action,
    /// selector or plain output in that order of precedence. An accessibility
    /// snapshot block, when present, is lifted into a single snapshot event.
    #[must_use]
    pub fn from_output(output: &str) -> Self {
        let mut transcript = Self::new();

        let (body, snapshot) = match extract_aria_snapshot(output) {
            Some((start, snapshot)) => (&output[..start], Some(snapshot)),
            None => (output, None),
        };

        for line in body.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            transcript.push(SessionEvent::new(classify_line(line), line));
        }

        if let Some(snapshot) = snapshot {
            transcript.push(SessionEvent::new(EventKind::Snapshot, snapshot));
        }
        transcript
    }

    /// Events of one kind, in order.
    pub fn events_of(&self, kind: EventKind) -> impl Iterator<Item = &SessionEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    /// All payloads joined with newlines, in order. Timestamps are excluded
    /// so that identical content always renders identically.
    #[must_use]
    pub fn text(&self) -> String {
        self.events
            .iter()
            .map(|e| e.payload.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Text of error events only.
    #[must_use]
    pub fn error_text(&self) -> String {
        self.events_of(EventKind::Error)
            .map(|e| e.payload.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Most recent snapshot payload, if any.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<&str> {
        self.events_of(EventKind::Snapshot)
            .last()
            .map(|e| e.payload.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Result of running a test artifact once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub verdict: Verdict,
    pub transcript: Transcript,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// A passing result.
    #[must_use]
    pub fn pass(transcript: Transcript, duration: Duration) -> Self {
        Self {
            verdict: Verdict::Pass,
            transcript,
            duration,
        }
    }

    /// A failing result.
    #[must_use]
    pub fn fail(transcript: Transcript, duration: Duration) -> Self {
        Self {
            verdict: Verdict::Fail,
            transcript,
            duration,
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Locate the accessibility snapshot block in runner output.
///
/// Returns the byte offset where the marker line starts together with the
/// snapshot body (separator lines stripped, tail-truncated to
/// [`MAX_SNAPSHOT_CHARS`]).
#[must_use]
pub fn extract_aria_snapshot(output: &str) -> Option<(usize, String)> {
    let separator = "=".repeat(SEPARATOR_WIDTH);

    let marker = output.find(ARIA_SNAPSHOT_MARKER)?;
    let line_start = output[..marker].rfind('\n').map_or(0, |i| i + 1);
    let mut content_start = marker + output[marker..].find('\n')? + 1;

    while output[content_start..].starts_with(&separator) {
        content_start += output[content_start..].find('\n')? + 1;
    }

    let body = match output[content_start..].find(&separator) {
        Some(end) => &output[content_start..content_start + end],
        None => &output[content_start..],
    };
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    let chars = body.chars().count();
    let snapshot = if chars > MAX_SNAPSHOT_CHARS {
        body.chars().skip(chars - MAX_SNAPSHOT_CHARS).collect()
    } else {
        body.to_string()
    };
    Some((line_start, snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CYPRESS_FAILURE: &str = "\
  Running:  login.cy.js
  cy.visit('/login')
  cy.get('[data-cy=submit]').click()
  1) Login flow logs in:
     AssertionError: Timed out retrying after 4000ms: Expected to find element: `[data-cy=submit]`, but never found it.
";

    #[test]
    fn test_from_output_classifies_lines() {
        let transcript = Transcript::from_output(CYPRESS_FAILURE);
        assert_eq!(transcript.len(), 5);
        assert_eq!(transcript.events[0].kind, EventKind::Output);
        assert_eq!(transcript.events[1].kind, EventKind::Action);
        assert_eq!(transcript.events[2].kind, EventKind::Action);
        assert_eq!(transcript.events[4].kind, EventKind::Error);
        assert!(transcript.error_text().contains("never found it"));
    }

    #[test]
    fn test_from_output_lifts_aria_snapshot() {
        let sep = "=".repeat(80);
        let output = format!(
            "Error: element not found\n{sep}\n{ARIA_SNAPSHOT_MARKER}\n{sep}\n- button \"Sign in\"\n- textbox \"Email\"\n{sep}\ntrailer\n"
        );
        let transcript = Transcript::from_output(&output);

        let snapshot = transcript.last_snapshot().unwrap();
        assert!(snapshot.contains("button \"Sign in\""));
        assert!(!snapshot.contains(ARIA_SNAPSHOT_MARKER));
        // only the error line survives before the snapshot block
        assert_eq!(transcript.events_of(EventKind::Error).count(), 1);
    }

    #[test]
    fn test_extract_aria_snapshot_absent() {
        assert!(extract_aria_snapshot("no snapshot here").is_none());
    }

    #[test]
    fn test_extract_aria_snapshot_keeps_tail() {
        let body = format!("{}END", "x".repeat(MAX_SNAPSHOT_CHARS + 10));
        let output = format!("{ARIA_SNAPSHOT_MARKER}\n{body}");
        let (_, snapshot) = extract_aria_snapshot(&output).unwrap();
        assert_eq!(snapshot.chars().count(), MAX_SNAPSHOT_CHARS);
        assert!(snapshot.ends_with("END"));
    }

    #[test]
    fn test_text_is_independent_of_timestamps() {
        let a = Transcript::new().with_event(EventKind::Error, "boom");
        std::thread::sleep(Duration::from_millis(2));
        let b = Transcript::new().with_event(EventKind::Error, "boom");
        assert_eq!(a.text(), b.text());
    }

    #[test]
    fn test_execution_result_serializes_duration_as_ms() {
        let result = ExecutionResult::fail(Transcript::new(), Duration::from_millis(1500));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["verdict"], "fail");
    }
}
