// Python code generator.
//
// Lowers a validated AST to a standalone Python 3 program. The emitted
// program imports the runtime preamble (`ml_runtime`), receives the
// safe-attribute registry and bridge table as embedded JSON snapshots, and
// routes every member/index access and bridge call through the runtime
// gates. Capability declarations become token factories plus one scoped
// acquisition wrapping the whole program body.

use crate::ast::*;
use crate::bridge::BridgeRegistry;
use crate::registry::SafeAttributeRegistry;
use crate::source_map::SourceMap;

/// Python runtime preamble shipped next to every generated program.
pub const RUNTIME_PREAMBLE: &str = include_str!("runtime/ml_runtime.py");
pub const RUNTIME_MODULE: &str = "ml_runtime";

/// Builtin callables resolved through the runtime when not shadowed by user
/// code.
const BUILTIN_CALLS: [&str; 9] = [
    "print", "len", "str", "num", "bool", "range", "abs", "min", "max",
];

const PYTHON_KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Names the generated scaffolding reserves at module scope.
const RESERVED_NAMES: [&str; 3] = ["sys", "_ml", "_ml_program"];

pub struct GeneratedProgram {
    pub python: String,
    pub source_map: SourceMap,
}

pub struct CodeGenerator<'a> {
    registry: &'a SafeAttributeRegistry,
    bridges: &'a BridgeRegistry,
    lines: Vec<String>,
    indent_level: usize,
    source_map: SourceMap,
    /// Names assigned or declared by user code; these shadow builtins and
    /// bridge bindings.
    user_names: std::collections::HashSet<String>,
    /// Bridge modules referenced by the program (imported or ambient).
    bridges_used: std::collections::BTreeSet<String>,
    /// Counter for generated exception binding temporaries.
    except_counter: usize,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(registry: &'a SafeAttributeRegistry, bridges: &'a BridgeRegistry) -> Self {
        CodeGenerator {
            registry,
            bridges,
            lines: Vec::new(),
            indent_level: 0,
            source_map: SourceMap::new(""),
            user_names: std::collections::HashSet::new(),
            bridges_used: std::collections::BTreeSet::new(),
            except_counter: 0,
        }
    }

    pub fn generate(mut self, program: &Program, source_file: &str) -> GeneratedProgram {
        self.source_map = SourceMap::new(source_file);
        self.collect_user_names(&program.statements);
        self.collect_bridges(&program.statements);

        self.push_line(format!("# Generated by mlc from {} -- do not edit.", source_file));
        self.push_line("import sys".to_string());
        self.push_line(format!("import {} as _ml", RUNTIME_MODULE));
        self.push_line(String::new());

        let registry_json =
            serde_json::to_string(&self.registry.snapshot_json()).expect("registry snapshot");
        let bridges_json =
            serde_json::to_string(&self.bridges.snapshot_json()).expect("bridge snapshot");
        self.push_line(format!("_ml.bootstrap({}, {})", py_quote(&registry_json), py_quote(&bridges_json)));
        self.push_line(String::new());

        // Ambient bridge bindings for every referenced bridge module.
        for bridge in self.bridges_used.clone() {
            self.push_line(format!("{} = _ml.bridge({})", mangle(&bridge), py_quote(&bridge)));
        }
        if !self.bridges_used.is_empty() {
            self.push_line(String::new());
        }

        // Capability declarations lower to token factories.
        let decls = program.capability_decls();
        for decl in &decls {
            self.emit_capability_factory(decl);
        }

        self.push_line("def _ml_program():".to_string());
        self.indent_level += 1;
        let body: Vec<&Stmt> = program
            .statements
            .iter()
            .filter(|s| !matches!(s, Stmt::Capability(_) | Stmt::Import(_)))
            .collect();
        let imports = program.imports();
        if body.is_empty() && imports.is_empty() {
            self.push_line("pass".to_string());
        } else {
            for import in &imports {
                self.emit_import(import);
            }
            for stmt in body {
                self.emit_statement(stmt);
            }
        }
        self.indent_level -= 1;
        self.push_line(String::new());

        let factories: Vec<String> = decls
            .iter()
            .map(|d| format!("_cap_{}", sanitize_factory_name(&d.name)))
            .collect();
        self.push_line("if __name__ == \"__main__\":".to_string());
        self.indent_level += 1;
        self.push_line(format!(
            "sys.exit(_ml.run_program(_ml_program, [{}]))",
            factories.join(", ")
        ));
        self.indent_level -= 1;

        let mut python = self.lines.join("\n");
        python.push('\n');
        GeneratedProgram {
            python,
            source_map: self.source_map,
        }
    }

    fn indent(&self) -> String {
        "    ".repeat(self.indent_level)
    }

    fn push_line(&mut self, text: String) {
        if text.is_empty() {
            self.lines.push(String::new());
        } else {
            self.lines.push(format!("{}{}", self.indent(), text));
        }
    }

    /// Emit one line and record its origin span.
    fn push_mapped(&mut self, text: String, span: Span) {
        self.push_line(text);
        let generated_line = self.lines.len();
        self.source_map.add_mapping(generated_line, span);
    }

    // ------------------------------------------------------------------
    // Pre-scan
    // ------------------------------------------------------------------

    fn collect_user_names(&mut self, statements: &[Stmt]) {
        for stmt in statements {
            match stmt {
                Stmt::Function(decl) => {
                    self.user_names.insert(decl.name.clone());
                    for param in &decl.parameters {
                        self.user_names.insert(param.clone());
                    }
                    self.collect_user_names(&decl.body.statements);
                }
                Stmt::Assign { target, .. } => {
                    if let Expr::Identifier { name, .. } = target {
                        self.user_names.insert(name.clone());
                    }
                }
                Stmt::For { variable, body, .. } => {
                    self.user_names.insert(variable.clone());
                    self.collect_user_names(&body.statements);
                }
                Stmt::Import(decl) => {
                    self.user_names.insert(decl.binding().to_string());
                }
                Stmt::If {
                    then_block,
                    elif_blocks,
                    else_block,
                    ..
                } => {
                    self.collect_user_names(&then_block.statements);
                    for (_, block) in elif_blocks {
                        self.collect_user_names(&block.statements);
                    }
                    if let Some(block) = else_block {
                        self.collect_user_names(&block.statements);
                    }
                }
                Stmt::While { body, .. } => self.collect_user_names(&body.statements),
                Stmt::Try {
                    body,
                    handlers,
                    finally,
                    ..
                } => {
                    self.collect_user_names(&body.statements);
                    for handler in handlers {
                        if let Some(binding) = &handler.binding {
                            self.user_names.insert(binding.clone());
                        }
                        self.collect_user_names(&handler.body.statements);
                    }
                    if let Some(block) = finally {
                        self.collect_user_names(&block.statements);
                    }
                }
                _ => {}
            }
        }
    }

    fn collect_bridges(&mut self, statements: &[Stmt]) {
        // Imported bridges.
        let mut imported: Vec<(String, String)> = Vec::new();
        for stmt in statements {
            if let Stmt::Import(decl) = stmt {
                let root = decl.module.split('.').next().unwrap_or(&decl.module);
                if self.bridges.lookup(root).is_some() {
                    imported.push((decl.binding().to_string(), root.to_string()));
                }
            }
        }

        // Ambient references: `file.read(...)` without an import.
        let mut referenced = std::collections::BTreeSet::new();
        collect_identifier_roots(statements, &mut referenced);
        for name in referenced {
            if self.bridges.lookup(&name).is_some() && !self.user_names.contains(&name) {
                self.bridges_used.insert(name);
            }
        }
        for (_binding, root) in imported {
            self.bridges_used.insert(root);
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn emit_capability_factory(&mut self, decl: &CapabilityDecl) {
        let patterns: Vec<String> = decl
            .resource_patterns
            .iter()
            .map(|p| py_quote(p))
            .collect();
        let operations: Vec<String> = decl.operations.iter().map(|o| py_quote(o)).collect();
        self.push_mapped(
            format!("def _cap_{}():", sanitize_factory_name(&decl.name)),
            decl.span,
        );
        self.indent_level += 1;
        self.push_line(format!(
            "return _ml.CapabilityToken({}, [{}], [{}], {})",
            py_quote(&decl.capability_type()),
            patterns.join(", "),
            operations.join(", "),
            py_quote(&decl.name),
        ));
        self.indent_level -= 1;
        self.push_line(String::new());
    }

    fn emit_import(&mut self, decl: &ImportDecl) {
        self.push_mapped(
            format!(
                "{} = _ml.import_module({})",
                mangle(decl.binding()),
                py_quote(&decl.module)
            ),
            decl.span,
        );
    }

    fn emit_statement(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Import(decl) => self.emit_import(decl),
            // Lowered ahead of the program body.
            Stmt::Capability(_) => {}

            Stmt::Function(decl) => {
                let params: Vec<String> =
                    decl.parameters.iter().map(|p| mangle(p)).collect();
                self.push_mapped(
                    format!("def {}({}):", mangle(&decl.name), params.join(", ")),
                    decl.span,
                );
                self.emit_block(&decl.body);
            }

            Stmt::Assign { target, value, span } => {
                let value_code = self.lower_expr(value);
                match target {
                    Expr::Identifier { name, .. } => {
                        self.push_mapped(format!("{} = {}", mangle(name), value_code), *span);
                    }
                    Expr::MemberAccess { object, name, .. } => {
                        let object_code = self.lower_expr(object);
                        self.push_mapped(
                            format!(
                                "_ml.safe_attr_store({}, {}, {})",
                                object_code,
                                py_quote(name),
                                value_code
                            ),
                            *span,
                        );
                    }
                    Expr::Index { object, index, .. } => {
                        let object_code = self.lower_expr(object);
                        let index_code = self.lower_expr(index);
                        self.push_mapped(
                            format!(
                                "_ml.safe_index_store({}, {}, {})",
                                object_code, index_code, value_code
                            ),
                            *span,
                        );
                    }
                    // Unreachable: the parser validates assignment targets.
                    other => {
                        let target_code = self.lower_expr(other);
                        self.push_mapped(format!("{} = {}", target_code, value_code), *span);
                    }
                }
            }

            Stmt::Expr { expr, span } => {
                let code = self.lower_expr(expr);
                self.push_mapped(code, *span);
            }

            Stmt::Return { value, span } => match value {
                Some(expr) => {
                    let code = self.lower_expr(expr);
                    self.push_mapped(format!("return {}", code), *span);
                }
                None => self.push_mapped("return None".to_string(), *span),
            },

            Stmt::Break { span } => self.push_mapped("break".to_string(), *span),
            Stmt::Continue { span } => self.push_mapped("continue".to_string(), *span),

            Stmt::If {
                condition,
                then_block,
                elif_blocks,
                else_block,
                span,
            } => {
                let cond_code = self.lower_expr(condition);
                self.push_mapped(format!("if {}:", cond_code), *span);
                self.emit_block(then_block);
                for (cond, block) in elif_blocks {
                    let cond_code = self.lower_expr(cond);
                    self.push_mapped(format!("elif {}:", cond_code), cond.span());
                    self.emit_block(block);
                }
                if let Some(block) = else_block {
                    self.push_line("else:".to_string());
                    self.emit_block(block);
                }
            }

            Stmt::While {
                condition,
                body,
                span,
            } => {
                let cond_code = self.lower_expr(condition);
                self.push_mapped(format!("while {}:", cond_code), *span);
                self.emit_block(body);
            }

            Stmt::For {
                variable,
                iterable,
                body,
                span,
            } => {
                let iterable_code = self.lower_expr(iterable);
                self.push_mapped(
                    format!("for {} in _ml.iter_value({}):", mangle(variable), iterable_code),
                    *span,
                );
                self.emit_block(body);
            }

            Stmt::Try {
                body,
                handlers,
                finally,
                span,
            } => {
                self.push_mapped("try:".to_string(), *span);
                self.emit_block(body);
                for handler in handlers {
                    self.except_counter += 1;
                    let temp = format!("_ml_err{}", self.except_counter);
                    self.push_mapped(
                        format!("except _ml.CATCHABLE as {}:", temp),
                        handler.span,
                    );
                    self.indent_level += 1;
                    if let Some(binding) = &handler.binding {
                        self.push_line(format!("{} = _ml.error_value({})", mangle(binding), temp));
                    }
                    if handler.body.statements.is_empty() {
                        self.push_line("pass".to_string());
                    } else {
                        for stmt in &handler.body.statements {
                            self.emit_statement(stmt);
                        }
                    }
                    self.indent_level -= 1;
                }
                if let Some(block) = finally {
                    self.push_line("finally:".to_string());
                    self.emit_block(block);
                }
            }
        }
    }

    fn emit_block(&mut self, block: &Block) {
        self.indent_level += 1;
        if block.statements.is_empty() {
            self.push_line("pass".to_string());
        } else {
            for stmt in &block.statements {
                self.emit_statement(stmt);
            }
        }
        self.indent_level -= 1;
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lower_expr(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Literal { value, .. } => lower_literal(value),
            Expr::Identifier { name, .. } => mangle(name),
            Expr::Binary {
                op, left, right, ..
            } => {
                let left_code = self.lower_expr(left);
                let right_code = self.lower_expr(right);
                let operator = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Mod => "%",
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::And => "and",
                    BinaryOp::Or => "or",
                };
                format!("({} {} {})", left_code, operator, right_code)
            }
            Expr::Unary { op, operand, .. } => {
                let operand_code = self.lower_expr(operand);
                match op {
                    UnaryOp::Neg => format!("(-{})", operand_code),
                    UnaryOp::Not => format!("(not {})", operand_code),
                }
            }
            Expr::Ternary {
                condition,
                then_value,
                else_value,
                ..
            } => {
                let cond = self.lower_expr(condition);
                let then_code = self.lower_expr(then_value);
                let else_code = self.lower_expr(else_value);
                format!("({} if {} else {})", then_code, cond, else_code)
            }
            Expr::Call {
                callee, arguments, ..
            } => self.lower_call(callee, arguments),
            Expr::MemberAccess { object, name, .. } => {
                let object_code = self.lower_expr(object);
                format!("_ml.safe_attr_access({}, {})", object_code, py_quote(name))
            }
            Expr::Index { object, index, .. } => {
                let object_code = self.lower_expr(object);
                match index.as_ref() {
                    // Constant string keys go through the registry gate.
                    Expr::Literal {
                        value: Literal::String(key),
                        ..
                    } => format!(
                        "_ml.safe_index_const({}, {})",
                        object_code,
                        py_quote(key)
                    ),
                    dynamic => {
                        let index_code = self.lower_expr(dynamic);
                        format!("_ml.safe_index({}, {})", object_code, index_code)
                    }
                }
            }
            Expr::Array { elements, .. } => {
                let parts: Vec<String> = elements.iter().map(|e| self.lower_expr(e)).collect();
                format!("[{}]", parts.join(", "))
            }
            Expr::Object { entries, .. } => {
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(key, value)| {
                        format!("{}: {}", py_quote(key.as_str()), self.lower_expr(value))
                    })
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Expr::Template { parts, .. } => {
                let rendered: Vec<String> = parts
                    .iter()
                    .map(|part| match part {
                        TemplatePart::Literal(text) => py_quote(text),
                        TemplatePart::Expr(inner) => {
                            format!("_ml.to_str({})", self.lower_expr(inner))
                        }
                    })
                    .collect();
                format!("\"\".join([{}])", rendered.join(", "))
            }
        }
    }

    fn lower_call(&mut self, callee: &Expr, arguments: &[Expr]) -> String {
        let args: Vec<String> = arguments.iter().map(|a| self.lower_expr(a)).collect();
        let args_joined = args.join(", ");

        match callee {
            Expr::Identifier { name, .. } => {
                if !self.user_names.contains(name) && BUILTIN_CALLS.contains(&name.as_str()) {
                    format!("_ml.bi_{}({})", name, args_joined)
                } else {
                    format!("{}({})", mangle(name), args_joined)
                }
            }
            Expr::MemberAccess { object, name, .. } => {
                let object_code = self.lower_expr(object);
                if args.is_empty() {
                    format!("_ml.safe_attr_call({}, {})", object_code, py_quote(name))
                } else {
                    format!(
                        "_ml.safe_attr_call({}, {}, {})",
                        object_code,
                        py_quote(name),
                        args_joined
                    )
                }
            }
            computed => {
                let callee_code = self.lower_expr(computed);
                if args.is_empty() {
                    format!("_ml.call_value({})", callee_code)
                } else {
                    format!("_ml.call_value({}, {})", callee_code, args_joined)
                }
            }
        }
    }
}

fn collect_identifier_roots(statements: &[Stmt], out: &mut std::collections::BTreeSet<String>) {
    fn walk_expr(expr: &Expr, out: &mut std::collections::BTreeSet<String>) {
        match expr {
            Expr::Identifier { name, .. } => {
                out.insert(name.clone());
            }
            Expr::Binary { left, right, .. } => {
                walk_expr(left, out);
                walk_expr(right, out);
            }
            Expr::Unary { operand, .. } => walk_expr(operand, out),
            Expr::Ternary {
                condition,
                then_value,
                else_value,
                ..
            } => {
                walk_expr(condition, out);
                walk_expr(then_value, out);
                walk_expr(else_value, out);
            }
            Expr::Call {
                callee, arguments, ..
            } => {
                walk_expr(callee, out);
                for arg in arguments {
                    walk_expr(arg, out);
                }
            }
            Expr::MemberAccess { object, .. } => walk_expr(object, out),
            Expr::Index { object, index, .. } => {
                walk_expr(object, out);
                walk_expr(index, out);
            }
            Expr::Array { elements, .. } => {
                for element in elements {
                    walk_expr(element, out);
                }
            }
            Expr::Object { entries, .. } => {
                for (_, value) in entries {
                    walk_expr(value, out);
                }
            }
            Expr::Template { parts, .. } => {
                for part in parts {
                    if let TemplatePart::Expr(inner) = part {
                        walk_expr(inner, out);
                    }
                }
            }
            Expr::Literal { .. } => {}
        }
    }

    for stmt in statements {
        match stmt {
            Stmt::Function(decl) => collect_identifier_roots(&decl.body.statements, out),
            Stmt::Assign { target, value, .. } => {
                walk_expr(target, out);
                walk_expr(value, out);
            }
            Stmt::Expr { expr, .. } => walk_expr(expr, out),
            Stmt::Return { value: Some(e), .. } => walk_expr(e, out),
            Stmt::If {
                condition,
                then_block,
                elif_blocks,
                else_block,
                ..
            } => {
                walk_expr(condition, out);
                collect_identifier_roots(&then_block.statements, out);
                for (cond, block) in elif_blocks {
                    walk_expr(cond, out);
                    collect_identifier_roots(&block.statements, out);
                }
                if let Some(block) = else_block {
                    collect_identifier_roots(&block.statements, out);
                }
            }
            Stmt::While {
                condition, body, ..
            } => {
                walk_expr(condition, out);
                collect_identifier_roots(&body.statements, out);
            }
            Stmt::For {
                iterable, body, ..
            } => {
                walk_expr(iterable, out);
                collect_identifier_roots(&body.statements, out);
            }
            Stmt::Try {
                body,
                handlers,
                finally,
                ..
            } => {
                collect_identifier_roots(&body.statements, out);
                for handler in handlers {
                    collect_identifier_roots(&handler.body.statements, out);
                }
                if let Some(block) = finally {
                    collect_identifier_roots(&block.statements, out);
                }
            }
            _ => {}
        }
    }
}

/// Quote a string as a Python double-quoted literal.
fn py_quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\x00"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn lower_literal(value: &Literal) -> String {
    match value {
        Literal::Int(n) => n.to_string(),
        Literal::Float(f) => {
            if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e16 {
                format!("{:.1}", f)
            } else {
                format!("{}", f)
            }
        }
        Literal::String(s) => py_quote(s),
        Literal::Bool(true) => "True".to_string(),
        Literal::Bool(false) => "False".to_string(),
        Literal::Null => "None".to_string(),
    }
}

/// Keep user identifiers readable; only names that collide with Python
/// keywords or reserved scaffolding get a suffix.
fn mangle(name: &str) -> String {
    if PYTHON_KEYWORDS.contains(&name) || RESERVED_NAMES.contains(&name) {
        format!("{}_ml", name)
    } else {
        name.to_string()
    }
}

fn sanitize_factory_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn generate(source: &str) -> GeneratedProgram {
        let program = parse(source, "test.ml").unwrap();
        let registry = SafeAttributeRegistry::standard();
        let bridges = BridgeRegistry::standard();
        CodeGenerator::new(&registry, &bridges).generate(&program, "test.ml")
    }

    #[test]
    fn test_trivial_program_shape() {
        let generated = generate("x = 1 + 2;");
        let python = &generated.python;
        assert!(python.contains("import ml_runtime as _ml"));
        assert!(python.contains("x = (1 + 2)"));
        assert!(python.contains("_ml.run_program(_ml_program, [])"));
        // No bridge bindings for a pure program.
        assert!(!python.contains("_ml.bridge("));
    }

    #[test]
    fn test_member_access_is_gated() {
        let generated = generate("y = obj.name;");
        assert!(generated
            .python
            .contains("y = _ml.safe_attr_access(obj, \"name\")"));
    }

    #[test]
    fn test_method_call_is_gated() {
        let generated = generate("s.upper();");
        assert!(generated.python.contains("_ml.safe_attr_call(s, \"upper\")"));
        let generated = generate("file.read(path);");
        assert!(generated
            .python
            .contains("_ml.safe_attr_call(file, \"read\", path)"));
    }

    #[test]
    fn test_index_gating() {
        let generated = generate(r#"a = m["name"]; b = m[k]; m[k] = 1; m["x"] = 2;"#);
        assert!(generated
            .python
            .contains("a = _ml.safe_index_const(m, \"name\")"));
        assert!(generated.python.contains("b = _ml.safe_index(m, k)"));
        assert!(generated.python.contains("_ml.safe_index_store(m, k, 1)"));
        assert!(generated.python.contains("_ml.safe_index_store(m, \"x\", 2)"));
    }

    #[test]
    fn test_capability_lowering() {
        let generated = generate(
            r#"capability FileRead {
                resource "data/*.csv";
                allow read;
            }
            file.read("data/a.csv");"#,
        );
        let python = &generated.python;
        assert!(python.contains("def _cap_FileRead():"));
        assert!(python.contains(
            "_ml.CapabilityToken(\"file\", [\"data/*.csv\"], [\"read\"], \"FileRead\")"
        ));
        assert!(python.contains("_ml.run_program(_ml_program, [_cap_FileRead])"));
        // `file` referenced without import still gets an ambient binding.
        assert!(python.contains("file = _ml.bridge(\"file\")"));
    }

    #[test]
    fn test_import_lowering() {
        let generated = generate("import math; x = math.sqrt(2);");
        assert!(generated
            .python
            .contains("math = _ml.import_module(\"math\")"));
    }

    #[test]
    fn test_control_flow_lowering() {
        let generated = generate(
            r#"if (x > 1) { y = 1; } elif (x > 0) { y = 2; } else { y = 3; }
            while (y > 0) { y = y - 1; }
            for (i in range(3)) { total = total + i; }"#,
        );
        let python = &generated.python;
        assert!(python.contains("if (x > 1):"));
        assert!(python.contains("elif (x > 0):"));
        assert!(python.contains("else:"));
        assert!(python.contains("while (y > 0):"));
        assert!(python.contains("for i in _ml.iter_value(_ml.bi_range(3)):"));
    }

    #[test]
    fn test_try_except_finally_lowering() {
        let generated = generate(
            r#"try { risky(); } except (err) { handle(err.message); } finally { done = true; }"#,
        );
        let python = &generated.python;
        assert!(python.contains("try:"));
        assert!(python.contains("except _ml.CATCHABLE as _ml_err1:"));
        assert!(python.contains("err = _ml.error_value(_ml_err1)"));
        assert!(python.contains("finally:"));
        assert!(python.contains("done = True"));
    }

    #[test]
    fn test_template_lowering() {
        let generated = generate(r#"msg = "sum: ${a + b}";"#);
        assert!(generated
            .python
            .contains(r#"msg = "".join(["sum: ", _ml.to_str((a + b))])"#));
    }

    #[test]
    fn test_short_circuit_and_ternary() {
        let generated = generate("x = a && b || !c; y = p ? q : r;");
        assert!(generated.python.contains("x = ((a and b) or (not c))"));
        assert!(generated.python.contains("y = (q if p else r)"));
    }

    #[test]
    fn test_builtin_resolution_and_shadowing() {
        let generated = generate("print(len(items));");
        assert!(generated.python.contains("_ml.bi_print(_ml.bi_len(items))"));

        // A user function named `len` shadows the builtin.
        let generated = generate("function len(x) { return 0; } len(items);");
        assert!(generated.python.contains("def len(x):"));
        assert!(!generated.python.contains("_ml.bi_len"));
    }

    #[test]
    fn test_keyword_mangling() {
        let generated = generate("lambda = 1; class = lambda + 1;");
        assert!(generated.python.contains("lambda_ml = 1"));
        assert!(generated.python.contains("class_ml = (lambda_ml + 1)"));
    }

    #[test]
    fn test_source_map_covers_statements() {
        let generated = generate("x = 1;\ny = 2;\n");
        assert!(!generated.source_map.is_empty());
        let lines: Vec<usize> = generated
            .source_map
            .mappings()
            .iter()
            .map(|m| m.source_line)
            .collect();
        assert!(lines.contains(&1));
        assert!(lines.contains(&2));
    }

    #[test]
    fn test_function_lowering() {
        let generated = generate("function add(a, b) { return a + b; }");
        assert!(generated.python.contains("def add(a, b):"));
        assert!(generated.python.contains("return (a + b)"));
    }

    #[test]
    fn test_empty_program() {
        let generated = generate("");
        assert!(generated.python.contains("def _ml_program():"));
        assert!(generated.python.contains("    pass"));
    }

    #[test]
    fn test_dynamic_callee() {
        let generated = generate("handlers[name](x);");
        assert!(generated
            .python
            .contains("_ml.call_value(_ml.safe_index(handlers, name), x)"));
    }
}
