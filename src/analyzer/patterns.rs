//! Pattern pass: literal matching of call names and string shapes against a
//! fixed table of dangerous constructs.

use crate::ast::{BinaryOp, Expr, Literal, Program, Stmt, TemplatePart};
use crate::diagnostics::{Diagnostic, Severity};
use once_cell::sync::Lazy;

/// One dangerous-call pattern.
#[derive(Debug, Clone, Copy)]
pub struct DangerPattern {
    pub id: &'static str,
    /// Call names that trigger the pattern; dotted names match in full.
    pub matchers: &'static [&'static str],
    pub description: &'static str,
    pub severity: Severity,
    pub cwe: &'static str,
}

pub static PATTERNS: Lazy<Vec<DangerPattern>> = Lazy::new(|| {
    vec![
        DangerPattern {
            id: "eval_injection",
            matchers: &["eval", "eval_like", "exec", "compile"],
            description: "dynamic code evaluation",
            severity: Severity::Critical,
            cwe: "CWE-95",
        },
        DangerPattern {
            id: "shell_execution",
            matchers: &["system", "shell", "popen", "spawn", "run_command"],
            description: "shell command execution",
            severity: Severity::Critical,
            cwe: "CWE-78",
        },
        DangerPattern {
            id: "reflection",
            matchers: &[
                "getattr",
                "setattr",
                "delattr",
                "globals",
                "locals",
                "vars",
                "reflect",
            ],
            description: "reflective attribute manipulation",
            severity: Severity::High,
            cwe: "CWE-470",
        },
        DangerPattern {
            id: "dynamic_import",
            matchers: &["__import__", "import_module", "load_module"],
            description: "dynamic module loading",
            severity: Severity::Critical,
            cwe: "CWE-829",
        },
        DangerPattern {
            id: "unsafe_deserialization",
            matchers: &["pickle.loads", "marshal.loads", "unserialize"],
            description: "deserialization of untrusted data",
            severity: Severity::High,
            cwe: "CWE-502",
        },
        DangerPattern {
            id: "weak_crypto",
            matchers: &["md5", "sha1", "des", "rc4", "crypto.md5", "crypto.sha1"],
            description: "cryptographically weak algorithm",
            severity: Severity::Medium,
            cwe: "CWE-327",
        },
    ]
});

const SQL_KEYWORDS: [&str; 6] = ["select ", "insert ", "update ", "delete ", "drop ", "union "];

/// Run the pattern pass over a program.
pub fn run(program: &Program, file: &str) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    walk_statements(&program.statements, file, &mut diagnostics);
    diagnostics
}

fn walk_statements(statements: &[Stmt], file: &str, out: &mut Vec<Diagnostic>) {
    for stmt in statements {
        match stmt {
            Stmt::Function(decl) => walk_statements(&decl.body.statements, file, out),
            Stmt::If {
                condition,
                then_block,
                elif_blocks,
                else_block,
                ..
            } => {
                walk_expr(condition, file, out);
                walk_statements(&then_block.statements, file, out);
                for (cond, block) in elif_blocks {
                    walk_expr(cond, file, out);
                    walk_statements(&block.statements, file, out);
                }
                if let Some(block) = else_block {
                    walk_statements(&block.statements, file, out);
                }
            }
            Stmt::While {
                condition, body, ..
            } => {
                walk_expr(condition, file, out);
                walk_statements(&body.statements, file, out);
            }
            Stmt::For {
                iterable, body, ..
            } => {
                walk_expr(iterable, file, out);
                walk_statements(&body.statements, file, out);
            }
            Stmt::Try {
                body,
                handlers,
                finally,
                ..
            } => {
                walk_statements(&body.statements, file, out);
                for handler in handlers {
                    walk_statements(&handler.body.statements, file, out);
                }
                if let Some(block) = finally {
                    walk_statements(&block.statements, file, out);
                }
            }
            Stmt::Return { value: Some(e), .. } => walk_expr(e, file, out),
            Stmt::Return { value: None, .. }
            | Stmt::Break { .. }
            | Stmt::Continue { .. }
            | Stmt::Import(_)
            | Stmt::Capability(_) => {}
            Stmt::Assign { target, value, .. } => {
                walk_expr(target, file, out);
                walk_expr(value, file, out);
            }
            Stmt::Expr { expr, .. } => walk_expr(expr, file, out),
        }
    }
}

fn walk_expr(expr: &Expr, file: &str, out: &mut Vec<Diagnostic>) {
    match expr {
        Expr::Call {
            callee, arguments, ..
        } => {
            if let Some(name) = callee.dotted_name() {
                check_call_name(&name, expr, file, out);
            }
            walk_expr(callee, file, out);
            for arg in arguments {
                walk_expr(arg, file, out);
            }
        }
        Expr::Binary {
            op, left, right, ..
        } => {
            if *op == BinaryOp::Add {
                check_sql_concatenation(expr, left, right, file, out);
            }
            walk_expr(left, file, out);
            walk_expr(right, file, out);
        }
        Expr::Unary { operand, .. } => walk_expr(operand, file, out),
        Expr::Ternary {
            condition,
            then_value,
            else_value,
            ..
        } => {
            walk_expr(condition, file, out);
            walk_expr(then_value, file, out);
            walk_expr(else_value, file, out);
        }
        Expr::MemberAccess { object, .. } => walk_expr(object, file, out),
        Expr::Index { object, index, .. } => {
            walk_expr(object, file, out);
            walk_expr(index, file, out);
        }
        Expr::Array { elements, .. } => {
            for element in elements {
                walk_expr(element, file, out);
            }
        }
        Expr::Object { entries, .. } => {
            for (_, value) in entries {
                walk_expr(value, file, out);
            }
        }
        Expr::Template { parts, .. } => {
            check_sql_template(expr, parts, file, out);
            for part in parts {
                if let TemplatePart::Expr(inner) = part {
                    walk_expr(inner, file, out);
                }
            }
        }
        Expr::Literal { .. } | Expr::Identifier { .. } => {}
    }
}

fn check_call_name(name: &str, call: &Expr, file: &str, out: &mut Vec<Diagnostic>) {
    for pattern in PATTERNS.iter() {
        if pattern.matchers.contains(&name) {
            out.push(
                Diagnostic::new(
                    pattern.severity,
                    "dangerous_call",
                    format!("call to `{}` enables {}", name, pattern.description),
                    file,
                    call.span(),
                )
                .with_cwe(pattern.cwe),
            );
        }
    }
}

fn sql_shaped(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    SQL_KEYWORDS
        .iter()
        .any(|keyword| lowered.trim_start().starts_with(keyword))
}

/// `"SELECT ... " + expr` style string building.
fn check_sql_concatenation(
    whole: &Expr,
    left: &Expr,
    right: &Expr,
    file: &str,
    out: &mut Vec<Diagnostic>,
) {
    let concat_with_literal_sql = [left, right].iter().any(|side| {
        matches!(
            side,
            Expr::Literal { value: Literal::String(text), .. } if sql_shaped(text)
        )
    });
    if concat_with_literal_sql {
        out.push(
            Diagnostic::new(
                Severity::Medium,
                "sql_injection",
                "SQL statement built by string concatenation",
                file,
                whole.span(),
            )
            .with_cwe("CWE-89")
            .with_suggestion("use a parameterized query instead of concatenation"),
        );
    }
}

/// `"SELECT ... ${expr}"` style interpolation.
fn check_sql_template(whole: &Expr, parts: &[TemplatePart], file: &str, out: &mut Vec<Diagnostic>) {
    let has_holes = parts.iter().any(|p| matches!(p, TemplatePart::Expr(_)));
    let starts_sql = matches!(
        parts.first(),
        Some(TemplatePart::Literal(text)) if sql_shaped(text)
    );
    if has_holes && starts_sql {
        out.push(
            Diagnostic::new(
                Severity::Medium,
                "sql_injection",
                "SQL statement built by string interpolation",
                file,
                whole.span(),
            )
            .with_cwe("CWE-89")
            .with_suggestion("use a parameterized query instead of interpolation"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn diagnostics(source: &str) -> Vec<Diagnostic> {
        run(&parse(source, "test.ml").unwrap(), "test.ml")
    }

    #[test]
    fn test_eval_is_critical() {
        let diags = diagnostics("eval_like(x);");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Critical);
        assert_eq!(diags[0].category, "dangerous_call");
        assert_eq!(diags[0].cwe.as_deref(), Some("CWE-95"));
    }

    #[test]
    fn test_nested_calls_found() {
        let diags = diagnostics("f(g(system(cmd)));");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].cwe.as_deref(), Some("CWE-78"));
    }

    #[test]
    fn test_weak_crypto_is_medium() {
        let diags = diagnostics("h = crypto.md5(data);");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Medium);
    }

    #[test]
    fn test_sql_concatenation() {
        let diags = diagnostics(r#"q = "SELECT * FROM users WHERE id = " + user_id;"#);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].category, "sql_injection");

        let diags = diagnostics(r#"q = "SELECT * FROM users WHERE id = ${user_id}";"#);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].category, "sql_injection");
    }

    #[test]
    fn test_benign_code_is_clean() {
        assert!(diagnostics("x = 1 + 2;").is_empty());
        assert!(diagnostics(r#"msg = "hello " + name;"#).is_empty());
        assert!(diagnostics("result = evaluate(x);").is_empty());
    }

    #[test]
    fn test_patterns_inside_control_flow() {
        let diags = diagnostics(
            r#"if (cond) { exec(payload); } else { while (x) { popen(cmd); } }"#,
        );
        assert_eq!(diags.len(), 2);
    }
}
