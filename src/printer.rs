//! Canonical AST printer.
//!
//! Renders a program back to ML source such that reparsing yields the same
//! tree. Plain strings are printed single-quoted (never interpolated);
//! template literals are printed double-quoted with their `${...}` holes.

use crate::ast::*;

pub fn print_program(program: &Program) -> String {
    let mut printer = Printer::new();
    for stmt in &program.statements {
        printer.stmt(stmt);
    }
    printer.out
}

pub fn print_expr(expr: &Expr) -> String {
    let mut printer = Printer::new();
    printer.expr(expr);
    printer.out
}

struct Printer {
    out: String,
    indent_level: usize,
}

impl Printer {
    fn new() -> Self {
        Printer {
            out: String::new(),
            indent_level: 0,
        }
    }

    fn indent(&self) -> String {
        "    ".repeat(self.indent_level)
    }

    fn line(&mut self, text: &str) {
        self.out.push_str(&self.indent());
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Import(decl) => {
                let alias = decl
                    .alias
                    .as_ref()
                    .map(|a| format!(" as {}", a))
                    .unwrap_or_default();
                self.line(&format!("import {}{};", decl.module, alias));
            }
            Stmt::Capability(decl) => {
                self.line(&format!("capability {} {{", decl.name));
                self.indent_level += 1;
                for pattern in &decl.resource_patterns {
                    self.line(&format!("resource {};", quote_plain(pattern)));
                }
                for op in &decl.operations {
                    self.line(&format!("allow {};", op));
                }
                self.indent_level -= 1;
                self.line("}");
            }
            Stmt::Function(decl) => {
                self.line(&format!(
                    "function {}({}) {{",
                    decl.name,
                    decl.parameters.join(", ")
                ));
                self.block_body(&decl.body);
                self.line("}");
            }
            Stmt::If {
                condition,
                then_block,
                elif_blocks,
                else_block,
                ..
            } => {
                self.line(&format!("if ({}) {{", print_expr(condition)));
                self.block_body(then_block);
                for (cond, block) in elif_blocks {
                    self.line(&format!("}} elif ({}) {{", print_expr(cond)));
                    self.block_body(block);
                }
                if let Some(block) = else_block {
                    self.line("} else {");
                    self.block_body(block);
                }
                self.line("}");
            }
            Stmt::While { condition, body, .. } => {
                self.line(&format!("while ({}) {{", print_expr(condition)));
                self.block_body(body);
                self.line("}");
            }
            Stmt::For {
                variable,
                iterable,
                body,
                ..
            } => {
                self.line(&format!(
                    "for ({} in {}) {{",
                    variable,
                    print_expr(iterable)
                ));
                self.block_body(body);
                self.line("}");
            }
            Stmt::Try {
                body,
                handlers,
                finally,
                ..
            } => {
                self.line("try {");
                self.block_body(body);
                for handler in handlers {
                    match &handler.binding {
                        Some(name) => self.line(&format!("}} except ({}) {{", name)),
                        None => self.line("} except {"),
                    }
                    self.block_body(&handler.body);
                }
                if let Some(block) = finally {
                    self.line("} finally {");
                    self.block_body(block);
                }
                self.line("}");
            }
            Stmt::Return { value, .. } => match value {
                Some(expr) => self.line(&format!("return {};", print_expr(expr))),
                None => self.line("return;"),
            },
            Stmt::Break { .. } => self.line("break;"),
            Stmt::Continue { .. } => self.line("continue;"),
            Stmt::Assign { target, value, .. } => {
                self.line(&format!(
                    "{} = {};",
                    print_expr(target),
                    print_expr(value)
                ));
            }
            Stmt::Expr { expr, .. } => self.line(&format!("{};", print_expr(expr))),
        }
    }

    fn block_body(&mut self, block: &Block) {
        self.indent_level += 1;
        for stmt in &block.statements {
            self.stmt(stmt);
        }
        self.indent_level -= 1;
    }

    fn expr(&mut self, expr: &Expr) {
        let text = self.expr_string(expr);
        self.out.push_str(&text);
    }

    fn expr_string(&self, expr: &Expr) -> String {
        match expr {
            Expr::Literal { value, .. } => literal_string(value),
            Expr::Identifier { name, .. } => name.clone(),
            Expr::Binary { op, left, right, .. } => format!(
                "({} {} {})",
                self.expr_string(left),
                op.symbol(),
                self.expr_string(right)
            ),
            Expr::Unary { op, operand, .. } => {
                format!("{}{}", op.symbol(), self.expr_string(operand))
            }
            Expr::Ternary {
                condition,
                then_value,
                else_value,
                ..
            } => format!(
                "({} ? {} : {})",
                self.expr_string(condition),
                self.expr_string(then_value),
                self.expr_string(else_value)
            ),
            Expr::Call { callee, arguments, .. } => {
                let args: Vec<String> = arguments.iter().map(|a| self.expr_string(a)).collect();
                format!("{}({})", self.expr_string(callee), args.join(", "))
            }
            Expr::MemberAccess { object, name, .. } => {
                format!("{}.{}", self.expr_string(object), name)
            }
            Expr::Index { object, index, .. } => {
                format!("{}[{}]", self.expr_string(object), self.expr_string(index))
            }
            Expr::Array { elements, .. } => {
                let parts: Vec<String> = elements.iter().map(|e| self.expr_string(e)).collect();
                format!("[{}]", parts.join(", "))
            }
            Expr::Object { entries, .. } => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(key, value)| {
                        let key_text = match key {
                            ObjectKey::Identifier(name) => name.clone(),
                            ObjectKey::String(text) => quote_plain(text),
                        };
                        format!("{}: {}", key_text, self.expr_string(value))
                    })
                    .collect();
                format!("{{ {} }}", parts.join(", "))
            }
            Expr::Template { parts, .. } => {
                let mut out = String::from("\"");
                for part in parts {
                    match part {
                        TemplatePart::Literal(text) => out.push_str(&escape_template(text)),
                        TemplatePart::Expr(inner) => {
                            out.push_str("${");
                            out.push_str(&self.expr_string(inner));
                            out.push('}');
                        }
                    }
                }
                out.push('"');
                out
            }
        }
    }
}

fn literal_string(value: &Literal) -> String {
    match value {
        Literal::Int(n) => n.to_string(),
        Literal::Float(f) => {
            // Keep a decimal point so the literal reparses as a float.
            if f.fract() == 0.0 && f.is_finite() {
                format!("{:.1}", f)
            } else {
                f.to_string()
            }
        }
        Literal::String(s) => quote_plain(s),
        Literal::Bool(true) => "true".to_string(),
        Literal::Bool(false) => "false".to_string(),
        Literal::Null => "null".to_string(),
    }
}

fn quote_plain(text: &str) -> String {
    let mut out = String::from("'");
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

fn escape_template(text: &str) -> String {
    let mut out = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\$"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn roundtrip(source: &str) {
        let first = parse(source, "test.ml").expect("first parse");
        let printed = print_program(&first);
        let second = parse(&printed, "test.ml")
            .unwrap_or_else(|e| panic!("reparse failed: {}\n--- printed ---\n{}", e, printed));
        let reprinted = print_program(&second);
        assert_eq!(printed, reprinted, "printing is not a fixed point");
    }

    #[test]
    fn test_roundtrip_statements() {
        roundtrip(
            r#"
            import math;
            import net.http as web;
            capability FileRead {
                resource "data/*.csv";
                allow read;
            }
            function add(a, b) {
                return a + b;
            }
            x = add(1, 2.5) * 3;
            if (x > 5) { y = 'big'; } elif (x > 2) { y = 'mid'; } else { y = 'small'; }
            for (item in [1, 2, 3]) { total = total + item; }
            while (total > 0) { total = total - 1; }
            try { risky(); } except (err) { log(err); } finally { done = true; }
            "#,
        );
    }

    #[test]
    fn test_roundtrip_expressions() {
        roundtrip("x = a || b && !c == -d + e * f % g;");
        roundtrip("x = cond ? left : right;");
        roundtrip(r#"x = { a: 1, "b c": [true, null, 'txt'] };"#);
        roundtrip("x = obj.items[0].fetch(1, 2);");
    }

    #[test]
    fn test_roundtrip_templates() {
        roundtrip(r#"msg = "value: ${a + 1} (${b})";"#);
        roundtrip(r#"msg = "plain \$ sign and \${escaped}";"#);
    }

    #[test]
    fn test_float_literal_keeps_point() {
        let program = parse("x = 2.0;", "test.ml").unwrap();
        let printed = print_program(&program);
        assert!(printed.contains("2.0"), "printed: {}", printed);
    }
}
