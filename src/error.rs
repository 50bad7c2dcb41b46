//! Compiler and runtime error types.
//!
//! `CompileError` carries a source location, an optional code snippet, and
//! suggestions, and renders with a caret the way rustc-style tools do. The
//! remaining enums are the error kinds the pipeline and runtime surface:
//! capability denials, registry denials, sandbox limits, infrastructure
//! failures.

use crate::ast::Span;
use std::fmt;
use thiserror::Error;

/// Source location for an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    pub fn from_span(file: impl Into<String>, span: Span) -> Self {
        Self::new(file, span.line, span.column)
    }
}

/// A suggestion for fixing an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub message: String,
    pub replacement: Option<String>,
}

impl Suggestion {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            replacement: None,
        }
    }

    pub fn with_replacement(message: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            replacement: Some(replacement.into()),
        }
    }
}

/// A compile-time error with rich context.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub location: SourceLocation,
    pub code_snippet: Option<String>,
    pub suggestions: Vec<Suggestion>,
}

impl CompileError {
    pub fn new(message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            message: message.into(),
            location,
            code_snippet: None,
            suggestions: Vec::new(),
        }
    }

    /// Create a parse error
    pub fn parse_error(
        message: impl Into<String>,
        file: impl Into<String>,
        line: usize,
        column: usize,
    ) -> Self {
        Self::new(message, SourceLocation::new(file, line, column))
    }

    /// Add a code snippet to show in the error
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.code_snippet = Some(snippet.into());
        self
    }

    /// Add a simple suggestion message
    pub fn suggest(mut self, message: impl Into<String>) -> Self {
        self.suggestions.push(Suggestion::new(message));
        self
    }

    /// Attach the offending source line from `source` as a snippet.
    pub fn with_source_line(mut self, source: &str) -> Self {
        if let Some(line) = source.lines().nth(self.location.line.saturating_sub(1)) {
            self.code_snippet = Some(line.to_string());
        }
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        writeln!(
            f,
            "  --> {}:{}:{}",
            self.location.file, self.location.line, self.location.column
        )?;

        if let Some(ref snippet) = self.code_snippet {
            writeln!(f, "   |")?;
            writeln!(f, "{:3} | {}", self.location.line, snippet)?;
            if self.location.column > 0 {
                let spaces = " ".repeat(self.location.column - 1);
                writeln!(f, "   | {}^", spaces)?;
            }
        }

        for suggestion in &self.suggestions {
            writeln!(f, "   = help: {}", suggestion.message)?;
            if let Some(ref replacement) = suggestion.replacement {
                writeln!(f, "   = suggestion: {}", replacement)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// Result type for compile-phase operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Capability-system failures, both at validation time and at runtime.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capability denied: {capability_type} cannot {operation} `{resource}`: {reason}")]
    Denied {
        capability_type: String,
        resource: String,
        operation: String,
        reason: String,
    },

    #[error("capability token for `{0}` has expired")]
    Expired(String),

    #[error("capability token for `{0}` has exhausted its usage budget")]
    UsageExhausted(String),

    #[error("capability token checksum mismatch for `{0}`; token was tampered with")]
    ChecksumMismatch(String),

    #[error("no capability of type `{0}` is held by the current context")]
    NotFound(String),

    #[error("capability context `{context}` is owned by another thread")]
    WrongThread { context: String },

    #[error(
        "declared capability `{declared}` is not covered by any granted capability: {reason}"
    )]
    DeclarationNotCovered { declared: String, reason: String },

    #[error("invalid capability declaration `{name}`: {reason}")]
    InvalidDeclaration { name: String, reason: String },

    #[error("invalid resource pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Safe-attribute registry denial.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("attribute `{attribute}` is forbidden on `{type_name}`{}", suggestion_suffix(.suggestion))]
    AttributeForbidden {
        type_name: String,
        attribute: String,
        suggestion: Option<String>,
    },
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!("; did you mean `{}`?", s),
        None => String::new(),
    }
}

/// Infrastructure failures in the sandbox parent: these are host-level
/// errors, never user-program failures.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn sandbox child: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("sandbox audit pipe failed: {0}")]
    Pipe(String),

    #[error("sandbox workspace error: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("host interpreter `{0}` was not found on PATH")]
    InterpreterMissing(String),

    #[error("sandbox session is in state {state} and cannot {action}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },
}

/// Top-level pipeline error returned by `compile` and the CLI commands.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Parse(#[from] CompileError),

    /// Analysis found diagnostics at or above the abort threshold. The
    /// diagnostics themselves are reported separately by the caller.
    #[error("security analysis rejected the program ({critical} critical, {total} total findings)")]
    AnalysisRejected { critical: usize, total: usize },

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CompileError::parse_error("expected `;`, found `}`", "test.ml", 3, 15)
            .with_snippet("    x = [1, 2, 3")
            .suggest("terminate the statement with `;`");

        let output = format!("{}", error);
        assert!(output.contains("error: expected `;`, found `}`"));
        assert!(output.contains("test.ml:3:15"));
        assert!(output.contains("help: terminate the statement with `;`"));
        assert!(output.contains('^'));
    }

    #[test]
    fn test_registry_error_suggestion() {
        let err = RegistryError::AttributeForbidden {
            type_name: "str".to_string(),
            attribute: "upperr".to_string(),
            suggestion: Some("upper".to_string()),
        };
        let text = err.to_string();
        assert!(text.contains("forbidden on `str`"));
        assert!(text.contains("did you mean `upper`?"));
    }

    #[test]
    fn test_capability_denied_message() {
        let err = CapabilityError::Denied {
            capability_type: "file".to_string(),
            resource: "data/b.csv".to_string(),
            operation: "read".to_string(),
            reason: "no pattern matches".to_string(),
        };
        assert!(err.to_string().contains("data/b.csv"));
    }
}
