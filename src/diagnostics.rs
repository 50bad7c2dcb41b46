//! Security diagnostics: severity-ordered findings with spans, rendered for
//! humans (one line each, with a caret pointing at the span) or as JSON
//! records.

use crate::ast::Span;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Severity buckets, ordered `Info < Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    fn colored_tag(self) -> String {
        match self {
            Severity::Info => "INFO".dimmed().to_string(),
            Severity::Low => "LOW".cyan().to_string(),
            Severity::Medium => "MEDIUM".yellow().bold().to_string(),
            Severity::High => "HIGH".red().bold().to_string(),
            Severity::Critical => "CRITICAL".on_red().white().bold().to_string(),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity `{}`", other)),
        }
    }
}

/// A single analyzer finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Stable category slug, e.g. `dangerous_call`, `taint_flow`,
    /// `forbidden_attribute`, `disallowed_import`, `capability_declaration`.
    pub category: String,
    pub message: String,
    pub file: String,
    pub line: usize,
    pub column: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip)]
    pub span: Span,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        category: impl Into<String>,
        message: impl Into<String>,
        file: impl Into<String>,
        span: Span,
    ) -> Self {
        Diagnostic {
            severity,
            category: category.into(),
            message: message.into(),
            file: file.into(),
            line: span.line,
            column: span.column,
            cwe: None,
            suggestion: None,
            span,
        }
    }

    pub fn with_cwe(mut self, cwe: impl Into<String>) -> Self {
        self.cwe = Some(cwe.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Dedup key: two diagnostics are duplicates iff (span, category,
    /// message) match exactly.
    pub fn dedup_key(&self) -> (Span, &str, &str) {
        (self.span, &self.category, &self.message)
    }
}

/// Sort by descending severity, then source order. The key is total so the
/// report is deterministic regardless of pass arrival order.
pub fn sort_diagnostics(diagnostics: &mut [Diagnostic]) {
    diagnostics.sort_by(|a, b| match b.severity.cmp(&a.severity) {
        Ordering::Equal => (a.line, a.column, &a.category, &a.message).cmp(&(
            b.line,
            b.column,
            &b.category,
            &b.message,
        )),
        other => other,
    });
}

/// Remove exact duplicates by (span, category, message), keeping the first.
pub fn dedup_diagnostics(diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(diagnostics.len());
    for diag in diagnostics {
        let key = (diag.span, diag.category.clone(), diag.message.clone());
        if seen.insert(key) {
            out.push(diag);
        }
    }
    out
}

/// Render one diagnostic for humans, with a caret line when the source is
/// available.
pub fn render_diagnostic(diag: &Diagnostic, source: Option<&str>) -> String {
    let mut out = String::new();
    let cwe = diag
        .cwe
        .as_deref()
        .map(|c| format!(" [{}]", c))
        .unwrap_or_default();
    out.push_str(&format!(
        "{} {}: {}{} ({}:{}:{})\n",
        diag.severity.colored_tag(),
        diag.category,
        diag.message,
        cwe,
        diag.file,
        diag.line,
        diag.column
    ));

    if let Some(source) = source {
        if let Some(line) = source.lines().nth(diag.line.saturating_sub(1)) {
            out.push_str(&format!("{:4} | {}\n", diag.line, line));
            out.push_str(&format!(
                "     | {}^\n",
                " ".repeat(diag.column.saturating_sub(1))
            ));
        }
    }

    if let Some(ref suggestion) = diag.suggestion {
        out.push_str(&format!("     = help: {}\n", suggestion));
    }

    out
}

/// Render a full report, most severe first.
pub fn render_report(diagnostics: &[Diagnostic], source: Option<&str>) -> String {
    let mut sorted: Vec<Diagnostic> = diagnostics.to_vec();
    sort_diagnostics(&mut sorted);
    let mut out = String::new();
    for diag in &sorted {
        out.push_str(&render_diagnostic(diag, source));
    }
    if !sorted.is_empty() {
        let worst = sorted[0].severity;
        out.push_str(&format!(
            "{} finding(s), most severe: {}\n",
            sorted.len(),
            worst
        ));
    }
    out
}

/// Serialize diagnostics as a JSON array of records.
pub fn render_json(diagnostics: &[Diagnostic]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(severity: Severity, line: usize, msg: &str) -> Diagnostic {
        Diagnostic::new(
            severity,
            "dangerous_call",
            msg,
            "test.ml",
            Span::new(0, 4, line, 1),
        )
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_sort_most_severe_first() {
        let mut diags = vec![
            diag(Severity::Low, 1, "a"),
            diag(Severity::Critical, 9, "b"),
            diag(Severity::Medium, 5, "c"),
        ];
        sort_diagnostics(&mut diags);
        assert_eq!(diags[0].severity, Severity::Critical);
        assert_eq!(diags[2].severity, Severity::Low);
    }

    #[test]
    fn test_dedup_exact_triplet_only() {
        let a = diag(Severity::High, 1, "same");
        let mut b = diag(Severity::High, 1, "same");
        b.severity = Severity::Low; // severity is not part of the key
        let c = diag(Severity::High, 1, "different");

        let out = dedup_diagnostics(vec![a.clone(), b, c]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "same");
        assert_eq!(out[1].message, "different");
    }

    #[test]
    fn test_render_includes_caret() {
        let d = diag(Severity::Medium, 1, "suspicious call");
        let rendered = render_diagnostic(&d, Some("eval(x);"));
        assert!(rendered.contains("suspicious call"));
        assert!(rendered.contains('^'));
    }

    #[test]
    fn test_json_roundtrip() {
        let d = diag(Severity::Critical, 2, "tainted").with_cwe("CWE-20");
        let json = render_json(&[d]).unwrap();
        assert!(json.contains("\"critical\""));
        assert!(json.contains("CWE-20"));
        let parsed: Vec<Diagnostic> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].severity, Severity::Critical);
    }
}
