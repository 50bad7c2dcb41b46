//! Audit events streamed from the sandbox child.
//!
//! The child writes one JSON record per capability decision on a dedicated
//! pipe, then a closing record carrying the total emitted count. The parent
//! parses the stream, keeps the events in emission order, and uses the
//! closing count to detect lost events.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    /// Parent-side event, e.g. `terminated_by_limit`.
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    /// Seconds since the Unix epoch, as reported by the child.
    pub ts: f64,
    pub session: String,
    pub capability_type: String,
    pub resource: String,
    pub operation: String,
    pub outcome: AuditOutcome,
}

/// One line of the audit stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditLine {
    Event(AuditEvent),
    Close { count: u64 },
}

#[derive(Debug, Clone, Deserialize)]
struct CloseRecord {
    event: String,
    count: u64,
}

pub fn parse_line(line: &str) -> Option<AuditLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(close) = serde_json::from_str::<CloseRecord>(trimmed) {
        if close.event == "audit_close" {
            return Some(AuditLine::Close { count: close.count });
        }
    }
    match serde_json::from_str::<AuditEvent>(trimmed) {
        Ok(event) => Some(AuditLine::Event(event)),
        Err(err) => {
            warn!(%err, line = trimmed, "unparseable audit line");
            None
        }
    }
}

/// The collected audit stream of one sandbox session.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    pub events: Vec<AuditEvent>,
    pub declared_count: Option<u64>,
}

impl AuditLog {
    pub fn collect(text: &str) -> Self {
        let mut log = AuditLog::default();
        for line in text.lines() {
            match parse_line(line) {
                Some(AuditLine::Event(event)) => log.events.push(event),
                Some(AuditLine::Close { count }) => log.declared_count = Some(count),
                None => {}
            }
        }
        debug!(
            events = log.events.len(),
            declared = ?log.declared_count,
            "collected audit stream"
        );
        log
    }

    /// True when the closing record arrived and its count matches the number
    /// of observed events (no event was lost).
    pub fn is_complete(&self) -> bool {
        self.declared_count == Some(self.events.len() as u64)
    }

    /// Append a parent-side infrastructure event.
    pub fn push_infrastructure(&mut self, operation: &str) {
        let seq = self.events.last().map(|e| e.seq + 1).unwrap_or(1);
        self.events.push(AuditEvent {
            seq,
            ts: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            session: "sandbox-host".to_string(),
            capability_type: "sandbox".to_string(),
            resource: String::new(),
            operation: operation.to_string(),
            outcome: AuditOutcome::Infrastructure,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event_and_close() {
        let event = parse_line(
            r#"{"seq":1,"ts":1.5,"session":"pid-1","capability_type":"file","resource":"data/a.csv","operation":"read","outcome":"ALLOWED"}"#,
        );
        let Some(AuditLine::Event(event)) = event else {
            panic!("expected event, got {:?}", event);
        };
        assert_eq!(event.capability_type, "file");
        assert_eq!(event.outcome, AuditOutcome::Allowed);

        let close = parse_line(r#"{"event":"audit_close","session":"pid-1","count":1}"#);
        assert_eq!(close, Some(AuditLine::Close { count: 1 }));
    }

    #[test]
    fn test_collect_and_completeness() {
        let text = r#"
{"seq":1,"ts":1.0,"session":"s","capability_type":"file","resource":"a","operation":"read","outcome":"ALLOWED"}
{"seq":2,"ts":2.0,"session":"s","capability_type":"file","resource":"b","operation":"read","outcome":"DENIED"}
{"event":"audit_close","session":"s","count":2}
"#;
        let log = AuditLog::collect(text);
        assert_eq!(log.events.len(), 2);
        assert!(log.is_complete());
        // Emission order preserved.
        assert!(log.events[0].seq < log.events[1].seq);
    }

    #[test]
    fn test_lost_events_detected() {
        let text = r#"
{"seq":1,"ts":1.0,"session":"s","capability_type":"file","resource":"a","operation":"read","outcome":"ALLOWED"}
{"event":"audit_close","session":"s","count":3}
"#;
        let log = AuditLog::collect(text);
        assert!(!log.is_complete());

        // No close record at all: also incomplete.
        let log = AuditLog::collect(
            r#"{"seq":1,"ts":1.0,"session":"s","capability_type":"file","resource":"a","operation":"read","outcome":"ALLOWED"}"#,
        );
        assert!(!log.is_complete());
    }

    #[test]
    fn test_garbage_lines_skipped() {
        let log = AuditLog::collect("not json\n\n{\"unrelated\":true}\n");
        assert!(log.events.is_empty());
        assert_eq!(log.declared_count, None);
    }

    #[test]
    fn test_infrastructure_event() {
        let mut log = AuditLog::default();
        log.push_infrastructure("terminated_by_limit");
        assert_eq!(log.events.len(), 1);
        assert_eq!(log.events[0].operation, "terminated_by_limit");
        assert_eq!(log.events[0].outcome, AuditOutcome::Infrastructure);
    }
}
