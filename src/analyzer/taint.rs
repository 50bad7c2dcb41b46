//! Forward taint propagation over the CFG.
//!
//! Sources (network, filesystem, environment, stdin reads) introduce taint;
//! assignments propagate it; binary operators join their operands;
//! sanitizers reset it; a tainted value reaching a sink is a critical
//! finding. Function parameters inherit the taint of call arguments, and a
//! function's return taint is computed from its body (memoized per argument
//! taint signature).

use crate::analyzer::cfg::{build_cfg, AssignTarget, Cfg, CfgNode};
use crate::analyzer::labels::{label_for, DataLabel, SinkKind, Taint};
use crate::ast::{Expr, FunctionDecl, Program, Span, Stmt, TemplatePart};
use crate::diagnostics::{Diagnostic, Severity};
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Bound on interprocedural recursion; cycles settle to "no taint" which
/// under-approximates but terminates.
const MAX_CALL_DEPTH: usize = 16;

type Env = HashMap<String, Taint>;

pub fn run(program: &Program, file: &str) -> Vec<Diagnostic> {
    let functions: HashMap<&str, &FunctionDecl> = program
        .statements
        .iter()
        .filter_map(|s| match s {
            Stmt::Function(decl) => Some((decl.name.as_str(), decl)),
            _ => None,
        })
        .collect();

    let mut analyzer = TaintAnalyzer {
        functions,
        file,
        diagnostics: Vec::new(),
        summaries: HashMap::new(),
        depth: 0,
    };

    let cfg = build_cfg(&program.statements);
    analyzer.run_cfg(&cfg, Env::new(), true);
    analyzer.diagnostics
}

struct TaintAnalyzer<'a> {
    functions: HashMap<&'a str, &'a FunctionDecl>,
    file: &'a str,
    diagnostics: Vec<Diagnostic>,
    /// (function, argument taint signature) -> return taint.
    summaries: HashMap<(String, Vec<u8>), Taint>,
    depth: usize,
}

impl<'a> TaintAnalyzer<'a> {
    /// Fixpoint dataflow over one CFG. Returns the join of all returned
    /// expression taints. Sink reports are only emitted when `report` is
    /// set (the final stable pass).
    fn run_cfg(&mut self, cfg: &Cfg, initial: Env, report: bool) -> Taint {
        let mut in_envs: HashMap<_, Env> = HashMap::new();
        in_envs.insert(cfg.entry, initial);

        let mut worklist: VecDeque<_> = VecDeque::new();
        worklist.push_back(cfg.entry);

        while let Some(node) = worklist.pop_front() {
            let env_in = in_envs.get(&node).cloned().unwrap_or_default();
            let env_out = self.transfer(cfg.node(node), &env_in, false);

            for succ in cfg.graph.neighbors_directed(node, Direction::Outgoing) {
                let merged = match in_envs.get(&succ) {
                    Some(existing) => join_envs(existing, &env_out),
                    None => env_out.clone(),
                };
                let changed = in_envs.get(&succ) != Some(&merged);
                if changed {
                    in_envs.insert(succ, merged);
                    worklist.push_back(succ);
                }
            }
        }

        // Stable pass: evaluate every reachable node once more, reporting
        // sinks and collecting return taint.
        let mut return_taint = Taint::empty();
        for node in cfg.graph.node_indices() {
            let Some(env_in) = in_envs.get(&node) else {
                continue;
            };
            if let CfgNode::Return { value: Some(expr), .. } = cfg.node(node) {
                return_taint |= self.eval_expr(expr, env_in, report);
            } else {
                self.transfer(cfg.node(node), env_in, report);
            }
        }
        return_taint
    }

    fn transfer(&mut self, node: &CfgNode, env: &Env, report: bool) -> Env {
        let mut out = env.clone();
        match node {
            CfgNode::Entry | CfgNode::Exit => {}
            CfgNode::Assign { target, value, .. } => {
                let taint = self.eval_expr(value, env, report);
                match target {
                    AssignTarget::Var(name) => {
                        if taint.is_empty() {
                            out.remove(name);
                        } else {
                            out.insert(name.clone(), taint);
                        }
                    }
                    AssignTarget::Container { base } => {
                        if let Some(base) = base {
                            if !taint.is_empty() {
                                *out.entry(base.clone()).or_insert(Taint::empty()) |= taint;
                            }
                        }
                    }
                }
            }
            CfgNode::ForBind {
                variable, iterable, ..
            } => {
                let taint = self.eval_expr(iterable, env, report);
                if taint.is_empty() {
                    out.remove(variable);
                } else {
                    out.insert(variable.clone(), taint);
                }
            }
            CfgNode::ExprStmt { expr, .. } | CfgNode::Branch { condition: expr, .. } => {
                self.eval_expr(expr, env, report);
            }
            CfgNode::Return { value, .. } => {
                if let Some(expr) = value {
                    self.eval_expr(expr, env, report);
                }
            }
        }
        out
    }

    fn eval_expr(&mut self, expr: &Expr, env: &Env, report: bool) -> Taint {
        match expr {
            Expr::Literal { .. } => Taint::empty(),
            Expr::Identifier { name, .. } => env.get(name).copied().unwrap_or(Taint::empty()),
            Expr::Binary { left, right, .. } => {
                self.eval_expr(left, env, report) | self.eval_expr(right, env, report)
            }
            Expr::Unary { operand, .. } => self.eval_expr(operand, env, report),
            Expr::Ternary {
                condition,
                then_value,
                else_value,
                ..
            } => {
                self.eval_expr(condition, env, report);
                self.eval_expr(then_value, env, report) | self.eval_expr(else_value, env, report)
            }
            Expr::MemberAccess { object, .. } => self.eval_expr(object, env, report),
            Expr::Index { object, index, .. } => {
                self.eval_expr(object, env, report) | self.eval_expr(index, env, report)
            }
            Expr::Array { elements, .. } => elements
                .iter()
                .fold(Taint::empty(), |acc, e| acc | self.eval_expr(e, env, report)),
            Expr::Object { entries, .. } => entries
                .iter()
                .fold(Taint::empty(), |acc, (_, v)| acc | self.eval_expr(v, env, report)),
            Expr::Template { parts, .. } => parts.iter().fold(Taint::empty(), |acc, part| {
                match part {
                    TemplatePart::Literal(_) => acc,
                    TemplatePart::Expr(inner) => acc | self.eval_expr(inner, env, report),
                }
            }),
            Expr::Call {
                callee,
                arguments,
                span,
            } => self.eval_call(callee, arguments, *span, env, report),
        }
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        arguments: &[Expr],
        span: Span,
        env: &Env,
        report: bool,
    ) -> Taint {
        let arg_taints: Vec<Taint> = arguments
            .iter()
            .map(|a| self.eval_expr(a, env, report))
            .collect();
        let joined_args = arg_taints
            .iter()
            .fold(Taint::empty(), |acc, t| acc | *t);

        let Some(name) = callee.dotted_name() else {
            // Computed callee; the structural pass flags it. Taint flows
            // through unchanged.
            self.eval_expr(callee, env, report);
            return joined_args;
        };

        match label_for(&name) {
            Some(DataLabel::Source(bits)) => bits,
            Some(DataLabel::Sanitizer) => Taint::empty(),
            Some(DataLabel::Sink(kind)) => {
                if !joined_args.is_empty() && report {
                    self.report_sink(&name, kind, joined_args, span);
                }
                Taint::empty()
            }
            None => {
                if let Some(decl) = self.functions.get(name.as_str()).copied() {
                    self.call_function(decl, &arg_taints, report)
                } else {
                    // Unknown callable: taint passes through.
                    joined_args
                }
            }
        }
    }

    fn call_function(
        &mut self,
        decl: &'a FunctionDecl,
        arg_taints: &[Taint],
        report: bool,
    ) -> Taint {
        let mut signature = Vec::with_capacity(decl.parameters.len());
        let mut env = Env::new();
        for (i, parameter) in decl.parameters.iter().enumerate() {
            let taint = arg_taints.get(i).copied().unwrap_or(Taint::empty());
            signature.push(taint.bits());
            if !taint.is_empty() {
                env.insert(parameter.clone(), taint);
            }
        }

        let key = (decl.name.clone(), signature);
        if !report {
            if let Some(cached) = self.summaries.get(&key) {
                return *cached;
            }
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Taint::empty();
        }

        // Seed the memo so recursive calls settle instead of looping.
        self.summaries.insert(key.clone(), Taint::empty());
        self.depth += 1;
        let cfg = build_cfg(&decl.body.statements);
        let result = self.run_cfg(&cfg, env, report);
        self.depth -= 1;
        self.summaries.insert(key, result);
        trace!(function = %decl.name, taint = ?result, "function taint summary");
        result
    }

    fn report_sink(&mut self, name: &str, kind: SinkKind, taint: Taint, span: Span) {
        let origins = describe_taint(taint);
        self.diagnostics.push(
            Diagnostic::new(
                Severity::Critical,
                "taint_flow",
                format!(
                    "value tainted by {} reaches {} sink `{}` without sanitization",
                    origins,
                    kind.describe(),
                    name
                ),
                self.file,
                span,
            )
            .with_cwe("CWE-20")
            .with_suggestion("pass the value through a sanitizer before this call"),
        );
    }
}

fn join_envs(a: &Env, b: &Env) -> Env {
    let mut out = a.clone();
    for (key, bits) in b {
        *out.entry(key.clone()).or_insert(Taint::empty()) |= *bits;
    }
    out
}

fn describe_taint(taint: Taint) -> String {
    let mut names = Vec::new();
    if taint.contains(Taint::NETWORK) {
        names.push("the network");
    }
    if taint.contains(Taint::FILESYSTEM) {
        names.push("the filesystem");
    }
    if taint.contains(Taint::ENVIRONMENT) {
        names.push("the environment");
    }
    if taint.contains(Taint::STDIN) {
        names.push("stdin");
    }
    if names.is_empty() {
        "an untrusted source".to_string()
    } else {
        names.join(" and ")
    }
}
