//! mlscript: a capability-secured scripting language that compiles to
//! sandboxed Python.
//!
//! The pipeline: parse ML source to an AST, run the security analyzer,
//! prove every declared capability is covered by policy (declared ⊆
//! granted), lower the AST to a Python program wired through the capability
//! and safe-attribute gates, and execute it in a resource-limited child
//! process with audit logging.

pub mod analyzer;
pub mod ast;
pub mod audit;
pub mod bridge;
pub mod capability;
pub mod cli;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fuzzy;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod registry;
pub mod sandbox;
pub mod source_map;

use crate::analyzer::{AnalysisOptions, AnalysisReport};
use crate::ast::Program;
use crate::bridge::BridgeRegistry;
use crate::capability::{CapabilityToken, PolicyStore};
use crate::codegen::{CodeGenerator, GeneratedProgram};
use crate::error::{CapabilityError, CompileError};
use crate::registry::SafeAttributeRegistry;
use crate::source_map::SourceMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub analysis: AnalysisOptions,
    /// Principal the policy grants are resolved for.
    pub principal: String,
}

impl CompileOptions {
    pub fn principal(&self) -> &str {
        if self.principal.is_empty() {
            "*"
        } else {
            &self.principal
        }
    }
}

/// A fully compiled unit: AST, analysis report, generated program.
#[derive(Debug)]
pub struct CompiledProgram {
    pub ast: Program,
    pub report: AnalysisReport,
    pub python: String,
    pub source_map: SourceMap,
    /// Tokens minted from policy for the requesting principal; handed to
    /// the sandbox.
    pub granted_tokens: Vec<Arc<CapabilityToken>>,
}

/// Why a compilation did not produce a program.
#[derive(Debug)]
pub enum CompileFailure {
    Parse(CompileError),
    /// The analyzer rejected the program; the report carries the findings.
    Analysis(AnalysisReport),
    /// A declared capability is not covered by the granted set.
    Capability {
        error: CapabilityError,
        report: AnalysisReport,
    },
}

impl std::fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileFailure::Parse(err) => write!(f, "{}", err),
            CompileFailure::Analysis(report) => write!(
                f,
                "security analysis rejected the program ({} finding(s))",
                report.diagnostics.len()
            ),
            CompileFailure::Capability { error, .. } => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for CompileFailure {}

/// Shared immutable pieces of the compilation pipeline: the safe-attribute
/// registry (built once at startup, bridge types merged in) and the bridge
/// table.
pub struct Pipeline {
    registry: SafeAttributeRegistry,
    bridges: BridgeRegistry,
    options: CompileOptions,
}

impl Pipeline {
    pub fn new(options: CompileOptions) -> Self {
        let bridges = BridgeRegistry::standard();
        let registry = SafeAttributeRegistry::standard()
            .extended(|builder| bridges.register_safe_types(builder));
        Pipeline {
            registry,
            bridges,
            options,
        }
    }

    pub fn registry(&self) -> &SafeAttributeRegistry {
        &self.registry
    }

    pub fn bridges(&self) -> &BridgeRegistry {
        &self.bridges
    }

    pub fn parse(&self, source: &str, filename: &str) -> Result<Program, CompileError> {
        parser::parse(source, filename)
    }

    pub fn analyze(&self, program: &Program, filename: &str) -> AnalysisReport {
        analyzer::analyze(program, filename, &self.options.analysis)
    }

    /// Mint the granted token set and prove declared ⊆ granted.
    pub fn validate(
        &self,
        program: &Program,
        policies: &PolicyStore,
    ) -> Result<Vec<Arc<CapabilityToken>>, CapabilityError> {
        let granted = policies.mint_tokens(self.options.principal())?;
        capability::validator::validate_all(&program.capability_decls(), &granted)?;
        Ok(granted)
    }

    pub fn generate(&self, program: &Program, filename: &str) -> GeneratedProgram {
        CodeGenerator::new(&self.registry, &self.bridges).generate(program, filename)
    }

    /// The whole compilation path. Short-circuits at the earliest failing
    /// stage; each failure is reported once.
    pub fn compile(
        &self,
        source: &str,
        filename: &str,
        policies: &PolicyStore,
    ) -> Result<CompiledProgram, Box<CompileFailure>> {
        let program = self
            .parse(source, filename)
            .map_err(|e| Box::new(CompileFailure::Parse(e.with_source_line(source))))?;

        let report = self.analyze(&program, filename);
        if report.should_abort(&self.options.analysis) {
            return Err(Box::new(CompileFailure::Analysis(report)));
        }

        let granted_tokens = match self.validate(&program, policies) {
            Ok(tokens) => tokens,
            Err(error) => {
                return Err(Box::new(CompileFailure::Capability { error, report }));
            }
        };

        let generated = self.generate(&program, filename);
        info!(
            file = filename,
            findings = report.diagnostics.len(),
            "compilation succeeded"
        );

        Ok(CompiledProgram {
            ast: program,
            report,
            python: generated.python,
            source_map: generated.source_map,
            granted_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::policy::PolicyDocument;

    fn pipeline() -> Pipeline {
        Pipeline::new(CompileOptions::default())
    }

    fn policy(text: &str) -> PolicyStore {
        PolicyStore::new(vec![PolicyDocument::parse(text).unwrap()])
    }

    #[test]
    fn test_trivial_compile() {
        let compiled = pipeline()
            .compile("x = 1 + 2;", "test.ml", &PolicyStore::default())
            .unwrap();
        assert!(compiled.report.diagnostics.is_empty());
        assert!(compiled.python.contains("x = (1 + 2)"));
        assert!(compiled.granted_tokens.is_empty());
    }

    #[test]
    fn test_parse_failure() {
        let failure = pipeline()
            .compile("x = ;", "test.ml", &PolicyStore::default())
            .unwrap_err();
        assert!(matches!(*failure, CompileFailure::Parse(_)));
    }

    #[test]
    fn test_critical_finding_aborts() {
        let failure = pipeline()
            .compile(
                "eval_like(network.get(u));",
                "test.ml",
                &PolicyStore::default(),
            )
            .unwrap_err();
        let CompileFailure::Analysis(report) = *failure else {
            panic!("expected analysis failure");
        };
        assert!(report
            .diagnostics
            .iter()
            .any(|d| d.category == "taint_flow"));
    }

    #[test]
    fn test_capability_validation_gates_compile() {
        let source = r#"
            capability FileRead {
                resource "data/*.csv";
                allow read;
            }
            file.read("data/a.csv");
        "#;

        // Covered by policy: compiles.
        let store = policy(
            r#"
            name = "ok"
            [[capability]]
            type = "file"
            resources = ["data/**"]
            operations = ["read"]
        "#,
        );
        let compiled = pipeline().compile(source, "test.ml", &store).unwrap();
        assert_eq!(compiled.granted_tokens.len(), 1);

        // Not covered: rejected.
        let store = policy(
            r#"
            name = "narrow"
            [[capability]]
            type = "file"
            resources = ["data/a.csv"]
            operations = ["read"]
        "#,
        );
        let failure = pipeline().compile(source, "test.ml", &store).unwrap_err();
        assert!(matches!(*failure, CompileFailure::Capability { .. }));
    }
}
