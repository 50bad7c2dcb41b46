//! Data labels for the taint analysis: which call names introduce taint
//! (sources), which clear it (sanitizers), and which must never receive it
//! (sinks).

use bitflags::bitflags;
use once_cell::sync::Lazy;
use std::collections::HashMap;

bitflags! {
    /// Origin categories a value can be tainted with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Taint: u8 {
        const NETWORK     = 0b0000_0001;
        const FILESYSTEM  = 0b0000_0010;
        const ENVIRONMENT = 0b0000_0100;
        const STDIN       = 0b0000_1000;
    }
}

/// Sink categories, used for the diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Eval,
    Shell,
    Sql,
    FileWrite,
}

impl SinkKind {
    pub fn describe(self) -> &'static str {
        match self {
            SinkKind::Eval => "code evaluation",
            SinkKind::Shell => "shell execution",
            SinkKind::Sql => "database query",
            SinkKind::FileWrite => "file write",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLabel {
    Source(Taint),
    Sanitizer,
    Sink(SinkKind),
}

/// Call-name -> label rules. Dotted names are matched in full (`network.get`)
/// and bare names as-is (`eval_like`).
static RULES: Lazy<HashMap<&'static str, DataLabel>> = Lazy::new(|| {
    use DataLabel::*;
    let mut m = HashMap::new();

    // Sources: values arriving from outside the trust boundary.
    m.insert("network.get", Source(Taint::NETWORK));
    m.insert("network.post", Source(Taint::NETWORK));
    m.insert("file.read", Source(Taint::FILESYSTEM));
    m.insert("file.list_dir", Source(Taint::FILESYSTEM));
    m.insert("env.get", Source(Taint::ENVIRONMENT));
    m.insert("stdin.read", Source(Taint::STDIN));
    m.insert("stdin.read_line", Source(Taint::STDIN));
    m.insert("input", Source(Taint::STDIN));

    // Sanitizers: reset taint.
    m.insert("sanitize", Sanitizer);
    m.insert("escape", Sanitizer);
    m.insert("escape_html", Sanitizer);
    m.insert("escape_shell", Sanitizer);
    m.insert("quote_sql", Sanitizer);
    m.insert("validate_input", Sanitizer);

    // Sinks: tainted input here is a critical finding.
    m.insert("eval", Sink(SinkKind::Eval));
    m.insert("eval_like", Sink(SinkKind::Eval));
    m.insert("exec", Sink(SinkKind::Eval));
    m.insert("compile", Sink(SinkKind::Eval));
    m.insert("system", Sink(SinkKind::Shell));
    m.insert("shell", Sink(SinkKind::Shell));
    m.insert("popen", Sink(SinkKind::Shell));
    m.insert("run_command", Sink(SinkKind::Shell));
    m.insert("query", Sink(SinkKind::Sql));
    m.insert("execute_sql", Sink(SinkKind::Sql));
    m.insert("db.query", Sink(SinkKind::Sql));
    m.insert("db.execute", Sink(SinkKind::Sql));
    m.insert("file.write", Sink(SinkKind::FileWrite));
    m.insert("file.append", Sink(SinkKind::FileWrite));

    m
});

pub fn label_for(call_name: &str) -> Option<DataLabel> {
    RULES.get(call_name).copied()
}
