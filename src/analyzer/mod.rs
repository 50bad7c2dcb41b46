//! Security analysis driver.
//!
//! Four independent passes consume the same immutable AST on worker threads:
//! pattern matching, structural AST rules, taint flow, and capability
//! declaration checks. Results are merged and deduplicated by
//! (span, category, message). A pass that misses the worker timeout is
//! demoted to "partial"; the other passes still land. A critical finding
//! always aborts compilation; the abort threshold for lower severities is
//! configurable.

pub mod ast_rules;
pub mod cfg;
pub mod labels;
pub mod patterns;
pub mod taint;

use crate::ast::Program;
use crate::bridge::BridgeRegistry;
use crate::capability::validator::check_declaration_shape;
use crate::diagnostics::{dedup_diagnostics, sort_diagnostics, Diagnostic, Severity};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const PASS_NAMES: [&str; 4] = ["patterns", "ast_rules", "taint", "capabilities"];

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Findings at or above this severity abort compilation. Critical
    /// findings abort regardless of the configured value.
    pub abort_threshold: Severity,
    /// Per-pass worker timeout.
    pub pass_timeout: Duration,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        AnalysisOptions {
            abort_threshold: Severity::Critical,
            pass_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub diagnostics: Vec<Diagnostic>,
    /// Passes that missed the worker timeout.
    pub partial_passes: Vec<&'static str>,
}

impl AnalysisReport {
    pub fn max_severity(&self) -> Option<Severity> {
        self.diagnostics.iter().map(|d| d.severity).max()
    }

    pub fn count_at_or_above(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity >= severity)
            .count()
    }

    pub fn should_abort(&self, options: &AnalysisOptions) -> bool {
        self.diagnostics.iter().any(|d| {
            d.severity == Severity::Critical || d.severity >= options.abort_threshold
        })
    }
}

/// Run all passes over `program` and merge their findings.
pub fn analyze(program: &Program, file: &str, options: &AnalysisOptions) -> AnalysisReport {
    let program = Arc::new(program.clone());
    let file = Arc::new(file.to_string());
    let (sender, receiver) = mpsc::channel::<(usize, Vec<Diagnostic>)>();

    for (index, pass_name) in PASS_NAMES.iter().enumerate() {
        let program = Arc::clone(&program);
        let file = Arc::clone(&file);
        let sender = sender.clone();
        let pass_name = *pass_name;
        std::thread::Builder::new()
            .name(format!("analyzer-{}", pass_name))
            .spawn(move || {
                let started = Instant::now();
                let diagnostics = run_pass(index, &program, &file);
                debug!(
                    pass = pass_name,
                    findings = diagnostics.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "analysis pass finished"
                );
                // The driver may have given up on us; a closed channel is fine.
                let _ = sender.send((index, diagnostics));
            })
            .expect("spawn analyzer worker");
    }
    drop(sender);

    let deadline = Instant::now() + options.pass_timeout;
    let mut arrived = [false; PASS_NAMES.len()];
    let mut merged: Vec<Diagnostic> = Vec::new();

    while arrived.iter().any(|done| !done) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok((index, diagnostics)) => {
                arrived[index] = true;
                merged.extend(diagnostics);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let partial_passes: Vec<&'static str> = PASS_NAMES
        .iter()
        .zip(arrived.iter())
        .filter(|(_, done)| !**done)
        .map(|(name, _)| *name)
        .collect();
    for pass in &partial_passes {
        warn!(pass, "analysis pass timed out; results are partial");
    }

    let mut diagnostics = dedup_diagnostics(merged);
    sort_diagnostics(&mut diagnostics);

    AnalysisReport {
        diagnostics,
        partial_passes,
    }
}

fn run_pass(index: usize, program: &Program, file: &str) -> Vec<Diagnostic> {
    match index {
        0 => patterns::run(program, file),
        1 => ast_rules::run(program, file, &BridgeRegistry::standard()),
        2 => taint::run(program, file),
        3 => capability_pass(program, file),
        _ => unreachable!("unknown analysis pass"),
    }
}

/// Structural validity of every capability declaration.
fn capability_pass(program: &Program, file: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for decl in program.capability_decls() {
        if let Err(err) = check_declaration_shape(decl) {
            diagnostics.push(Diagnostic::new(
                Severity::High,
                "capability_declaration",
                err.to_string(),
                file,
                decl.span,
            ));
        }
    }
    diagnostics
}
