//! Statement-level control-flow graph used by the taint pass.
//!
//! Nodes carry just enough of the statement to run a transfer function:
//! the defined variable and the expressions whose taint must be evaluated.
//! Function declarations are not inlined here; the taint pass analyzes each
//! function body as its own graph.

use crate::ast::{Block, Expr, Span, Stmt};
use petgraph::graph::{DiGraph, NodeIndex};

#[derive(Debug, Clone)]
pub enum AssignTarget {
    /// Plain variable assignment.
    Var(String),
    /// Member or index store; taint flows into the named base variable
    /// when it can be identified.
    Container { base: Option<String> },
}

#[derive(Debug, Clone)]
pub enum CfgNode {
    Entry,
    Exit,
    Assign {
        target: AssignTarget,
        value: Expr,
        span: Span,
    },
    ExprStmt {
        expr: Expr,
        span: Span,
    },
    /// Loop binding of `for (variable in iterable)`.
    ForBind {
        variable: String,
        iterable: Expr,
        span: Span,
    },
    Branch {
        condition: Expr,
        span: Span,
    },
    Return {
        value: Option<Expr>,
        span: Span,
    },
}

pub struct Cfg {
    pub graph: DiGraph<CfgNode, ()>,
    pub entry: NodeIndex,
    pub exit: NodeIndex,
}

impl Cfg {
    pub fn node(&self, index: NodeIndex) -> &CfgNode {
        &self.graph[index]
    }
}

/// Build the CFG for a statement list (a program body or a function body).
pub fn build_cfg(statements: &[Stmt]) -> Cfg {
    let mut graph = DiGraph::new();
    let entry = graph.add_node(CfgNode::Entry);
    let exit = graph.add_node(CfgNode::Exit);

    let mut builder = Builder {
        graph,
        exit,
        loop_stack: Vec::new(),
    };
    let dangling = builder.build_statements(statements, vec![entry]);
    for pred in dangling {
        builder.graph.add_edge(pred, exit, ());
    }

    Cfg {
        graph: builder.graph,
        entry,
        exit,
    }
}

struct LoopFrame {
    continue_target: NodeIndex,
    break_sources: Vec<NodeIndex>,
}

struct Builder {
    graph: DiGraph<CfgNode, ()>,
    exit: NodeIndex,
    loop_stack: Vec<LoopFrame>,
}

impl Builder {
    fn add(&mut self, node: CfgNode, preds: &[NodeIndex]) -> NodeIndex {
        let index = self.graph.add_node(node);
        for pred in preds {
            self.graph.add_edge(*pred, index, ());
        }
        index
    }

    /// Wire a statement list after `preds`; returns the dangling exits.
    fn build_statements(&mut self, statements: &[Stmt], mut preds: Vec<NodeIndex>) -> Vec<NodeIndex> {
        for stmt in statements {
            if preds.is_empty() {
                // Unreachable code after return/break/continue.
                break;
            }
            preds = self.build_statement(stmt, preds);
        }
        preds
    }

    fn build_statement(&mut self, stmt: &Stmt, preds: Vec<NodeIndex>) -> Vec<NodeIndex> {
        match stmt {
            // Declarations contribute no flow at this level.
            Stmt::Import(_) | Stmt::Capability(_) | Stmt::Function(_) => preds,

            Stmt::Assign { target, value, span } => {
                let assign_target = match target {
                    Expr::Identifier { name, .. } => AssignTarget::Var(name.clone()),
                    Expr::MemberAccess { object, .. } | Expr::Index { object, .. } => {
                        AssignTarget::Container {
                            base: object.as_identifier().map(str::to_string),
                        }
                    }
                    _ => AssignTarget::Container { base: None },
                };
                vec![self.add(
                    CfgNode::Assign {
                        target: assign_target,
                        value: value.clone(),
                        span: *span,
                    },
                    &preds,
                )]
            }

            Stmt::Expr { expr, span } => vec![self.add(
                CfgNode::ExprStmt {
                    expr: expr.clone(),
                    span: *span,
                },
                &preds,
            )],

            Stmt::Return { value, span } => {
                let node = self.add(
                    CfgNode::Return {
                        value: value.clone(),
                        span: *span,
                    },
                    &preds,
                );
                self.graph.add_edge(node, self.exit, ());
                Vec::new()
            }

            Stmt::Break { .. } => {
                if let Some(frame) = self.loop_stack.last_mut() {
                    // Connected to the loop's join point when the loop closes.
                    let sources = &mut frame.break_sources;
                    sources.extend(preds);
                }
                Vec::new()
            }

            Stmt::Continue { .. } => {
                if let Some(frame) = self.loop_stack.last() {
                    let target = frame.continue_target;
                    for pred in preds {
                        self.graph.add_edge(pred, target, ());
                    }
                }
                Vec::new()
            }

            Stmt::If {
                condition,
                then_block,
                elif_blocks,
                else_block,
                span,
            } => {
                let mut joins = Vec::new();
                let mut branch = self.add(
                    CfgNode::Branch {
                        condition: condition.clone(),
                        span: *span,
                    },
                    &preds,
                );
                joins.extend(self.build_block(then_block, branch));

                for (cond, block) in elif_blocks {
                    let next_branch = self.add(
                        CfgNode::Branch {
                            condition: cond.clone(),
                            span: block.span,
                        },
                        &[branch],
                    );
                    joins.extend(self.build_block(block, next_branch));
                    branch = next_branch;
                }

                match else_block {
                    Some(block) => joins.extend(self.build_block(block, branch)),
                    // Condition may be false with no else: fall through.
                    None => joins.push(branch),
                }
                joins
            }

            Stmt::While {
                condition,
                body,
                span,
            } => {
                let cond = self.add(
                    CfgNode::Branch {
                        condition: condition.clone(),
                        span: *span,
                    },
                    &preds,
                );
                self.loop_stack.push(LoopFrame {
                    continue_target: cond,
                    break_sources: Vec::new(),
                });
                let body_exits = self.build_block(body, cond);
                for body_exit in body_exits {
                    self.graph.add_edge(body_exit, cond, ());
                }
                let frame = self.loop_stack.pop().expect("loop frame");

                let mut joins = vec![cond];
                joins.extend(frame.break_sources);
                joins
            }

            Stmt::For {
                variable,
                iterable,
                body,
                span,
            } => {
                let bind = self.add(
                    CfgNode::ForBind {
                        variable: variable.clone(),
                        iterable: iterable.clone(),
                        span: *span,
                    },
                    &preds,
                );
                self.loop_stack.push(LoopFrame {
                    continue_target: bind,
                    break_sources: Vec::new(),
                });
                let body_exits = self.build_block(body, bind);
                for body_exit in body_exits {
                    self.graph.add_edge(body_exit, bind, ());
                }
                let frame = self.loop_stack.pop().expect("loop frame");

                let mut joins = vec![bind];
                joins.extend(frame.break_sources);
                joins
            }

            Stmt::Try {
                body,
                handlers,
                finally,
                ..
            } => {
                let body_exits = self.build_statements(&body.statements, preds.clone());

                // Any statement of the body may raise: handlers are entered
                // both from the try entry and from every body exit.
                let mut handler_entries = preds;
                handler_entries.extend(body_exits.iter().copied());

                let mut joins = body_exits;
                for handler in handlers {
                    joins.extend(
                        self.build_statements(&handler.body.statements, handler_entries.clone()),
                    );
                }

                match finally {
                    Some(block) => self.build_statements(&block.statements, joins),
                    None => joins,
                }
            }
        }
    }

    fn build_block(&mut self, block: &Block, pred: NodeIndex) -> Vec<NodeIndex> {
        self.build_statements(&block.statements, vec![pred])
    }
}
