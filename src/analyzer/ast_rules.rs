//! Structural AST rules: dunder member access, disallowed imports, and
//! dynamic invocation of computed callables.

use crate::ast::{is_dunder, Expr, Literal, Program, Stmt, TemplatePart};
use crate::bridge::BridgeRegistry;
use crate::diagnostics::{Diagnostic, Severity};
use crate::fuzzy;

/// Module names that must never load, regardless of policy.
const DENIED_MODULES: [&str; 8] = [
    "os",
    "sys",
    "subprocess",
    "socket",
    "ctypes",
    "importlib",
    "builtins",
    "marshal",
];

pub fn run(program: &Program, file: &str, bridges: &BridgeRegistry) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    for import in program.imports() {
        check_import(import, file, bridges, &mut diagnostics);
    }
    walk_statements(&program.statements, file, &mut diagnostics);

    diagnostics
}

fn check_import(
    import: &crate::ast::ImportDecl,
    file: &str,
    bridges: &BridgeRegistry,
    out: &mut Vec<Diagnostic>,
) {
    let root = import.module.split('.').next().unwrap_or(&import.module);

    if DENIED_MODULES.contains(&root) {
        out.push(
            Diagnostic::new(
                Severity::High,
                "disallowed_import",
                format!("import of `{}` is forbidden", import.module),
                file,
                import.span,
            )
            .with_cwe("CWE-829"),
        );
        return;
    }

    if bridges.lookup(root).is_none() {
        let mut diag = Diagnostic::new(
            Severity::Medium,
            "disallowed_import",
            format!("`{}` is not a registered bridge module", import.module),
            file,
            import.span,
        );
        if let Some(suggestion) = fuzzy::best_match(root, bridges.module_names()) {
            diag = diag.with_suggestion(format!("did you mean `{}`?", suggestion));
        }
        out.push(diag);
    }
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
            Stmt::Assign { target, value, .. } => {
                walk_expr(target, file, out);
                walk_expr(value, file, out);
            }
            Stmt::Expr { expr, .. } => walk_expr(expr, file, out),
            _ => {}
        }
    }
}

fn walk_expr(expr: &Expr, file: &str, out: &mut Vec<Diagnostic>) {
    match expr {
        Expr::MemberAccess {
            object,
            name,
            name_span,
            ..
        } => {
            if is_dunder(name) {
                out.push(
                    Diagnostic::new(
                        Severity::High,
                        "forbidden_attribute",
                        format!("access to dunder attribute `{}`", name),
                        file,
                        *name_span,
                    )
                    .with_cwe("CWE-470"),
                );
            }
            walk_expr(object, file, out);
        }
        Expr::Index { object, index, .. } => {
            if let Expr::Literal {
                value: Literal::String(key),
                span,
            } = index.as_ref()
            {
                if is_dunder(key) {
                    out.push(
                        Diagnostic::new(
                            Severity::High,
                            "forbidden_attribute",
                            format!("index access to dunder key `{}`", key),
                            file,
                            *span,
                        )
                        .with_cwe("CWE-470"),
                    );
                }
            }
            walk_expr(object, file, out);
            walk_expr(index, file, out);
        }
        Expr::Call {
            callee, arguments, ..
        } => {
            // A computed callee (`handlers[name](payload)`) is a dynamic
            // invocation: the call target came from data, not from code.
            match callee.as_ref() {
                Expr::Identifier { .. } | Expr::MemberAccess { .. } => {}
                computed => {
                    out.push(
                        Diagnostic::new(
                            Severity::Medium,
                            "dynamic_invocation",
                            "call target is computed at runtime",
                            file,
                            computed.span(),
                        )
                        .with_cwe("CWE-94"),
                    );
                }
            }
            walk_expr(callee, file, out);
            for arg in arguments {
                walk_expr(arg, file, out);
            }
        }
        Expr::Binary { left, right, .. } => {
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
            for part in parts {
                if let TemplatePart::Expr(inner) = part {
                    walk_expr(inner, file, out);
                }
            }
        }
        Expr::Literal { .. } | Expr::Identifier { .. } => {}
    }
}
