//! AST to CFG lowering
//!
//! Statements lower in order with stable `<prefix>_<counter>` ids. An
//! implicit Start node opens the graph and an End node closes it, so an
//! empty program compiles to Start wired directly to End. Decision branches
//! converge at a NoOp join; loops carry `body`/`continue`/`break` edges;
//! retry nodes record their first body node as `child_node_id` and their
//! success NoOp under the `exit` successor label.

use thiserror::Error;

use crate::dsl::{AssignValue, AstRoot, Stmt, TaskCall};
use crate::plan::{Cfg, CfgNode, GraphError, NodeKind};

/// Compilation failures
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Unsupported assignment RHS at line {line}")]
    UnsupportedAssignment { line: u32 },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

struct CompileContext {
    cfg: Cfg,
    counter: u32,
}

impl CompileContext {
    fn node_id(&mut self, prefix: &str) -> String {
        let id = format!("{}_{:06}", prefix, self.counter);
        self.counter += 1;
        id
    }
}

/// Compile an AST into a validated CFG
pub fn compile_ast_to_cfg(ast: &AstRoot) -> Result<Cfg, CompileError> {
    let mut ctx = CompileContext {
        cfg: Cfg::new(),
        counter: 0,
    };

    let start_id = ctx.node_id("start");
    ctx.cfg.add_node(CfgNode::named(start_id.clone(), "start", NodeKind::Start));

    let mut prev = start_id;
    for stmt in &ast.statements {
        let (_, tail) = compile_stmt(stmt, &mut ctx, &prev, "next")?;
        prev = tail;
    }

    let end_id = ctx.node_id("end");
    ctx.cfg.add_node(CfgNode::named(end_id.clone(), "end", NodeKind::End));
    ctx.cfg.add_successor(&prev, &end_id, "next")?;

    ctx.cfg.validate_integrity()?;
    Ok(ctx.cfg)
}

/// Compile one statement; wires `prev --label--> <first node>` and returns
/// (entry id, tail id)
fn compile_stmt(
    stmt: &Stmt,
    ctx: &mut CompileContext,
    prev: &str,
    label: &str,
) -> Result<(String, String), CompileError> {
    match stmt {
        Stmt::Assign { target, value, line } => match value {
            AssignValue::Call(call) => {
                let id = add_task_node(call, ctx, Some(target));
                ctx.cfg.add_successor(prev, &id, label)?;
                Ok((id.clone(), id))
            }
            _ => Err(CompileError::UnsupportedAssignment {
                line: line.unwrap_or(0),
            }),
        },
        Stmt::TaskCall(call) => {
            let id = add_task_node(call, ctx, None);
            ctx.cfg.add_successor(prev, &id, label)?;
            Ok((id.clone(), id))
        }
        Stmt::If {
            condition,
            body,
            orelse,
            line,
        } => compile_if(condition, body, orelse, *line, ctx, prev, label),
        Stmt::For {
            iterator,
            iterable,
            body,
            ..
        } => compile_for(iterator, iterable, body, ctx, prev, label),
        Stmt::Retry {
            attempts,
            backoff,
            body,
            ..
        } => compile_retry(*attempts, *backoff, body, ctx, prev, label),
        Stmt::Expr { .. } => {
            // Unknown statements pass through as NoOps rather than failing;
            // error categories belong to the parser stage
            let id = ctx.node_id("noop");
            ctx.cfg.add_node(CfgNode::named(id.clone(), "noop_stmt", NodeKind::Noop));
            ctx.cfg.add_successor(prev, &id, label)?;
            Ok((id.clone(), id))
        }
    }
}

/// Compile a statement list; wires `prev --first_label--> <first>` and
/// returns (entry, tail), or None for an empty block
fn compile_block(
    statements: &[Stmt],
    ctx: &mut CompileContext,
    prev: &str,
    first_label: &str,
) -> Result<Option<(String, String)>, CompileError> {
    let mut entry: Option<String> = None;
    let mut tail = prev.to_string();
    for (i, stmt) in statements.iter().enumerate() {
        let label = if i == 0 { first_label } else { "next" };
        let (first, last) = compile_stmt(stmt, ctx, &tail, label)?;
        if entry.is_none() {
            entry = Some(first);
        }
        tail = last;
    }
    Ok(entry.map(|e| (e, tail)))
}

fn add_task_node(call: &TaskCall, ctx: &mut CompileContext, assign_var: Option<&str>) -> String {
    let task_ref = match assign_var {
        Some(var) => var.to_string(),
        None => {
            let hex = uuid::Uuid::new_v4().simple().to_string();
            format!("task_{}", &hex[..8])
        }
    };

    let id = ctx.node_id("task");
    let args: serde_json::Map<String, serde_json::Value> = call
        .args
        .iter()
        .map(|(k, v)| (k.clone(), v.to_metadata_value()))
        .collect();

    let mut node = CfgNode::named(
        id.clone(),
        format!("task:{}", call.name),
        NodeKind::Task {
            task_ref,
            timeout_seconds: None,
            supports_parallel: false,
        },
    );
    node.metadata.insert(
        "dsl_call".to_string(),
        serde_json::json!({ "name": call.name, "args": args }),
    );
    ctx.cfg.add_node(node);
    id
}

fn compile_if(
    condition: &str,
    body: &[Stmt],
    orelse: &[Stmt],
    line: Option<u32>,
    ctx: &mut CompileContext,
    prev: &str,
    label: &str,
) -> Result<(String, String), CompileError> {
    let dec_id = ctx.node_id("dec");
    let mut node = CfgNode::named(
        dec_id.clone(),
        "decision",
        NodeKind::Decision {
            condition: condition.to_string(),
        },
    );
    if let Some(line) = line {
        node.metadata.insert("source_lineno".to_string(), line.into());
    }
    ctx.cfg.add_node(node);
    ctx.cfg.add_successor(prev, &dec_id, label)?;

    let true_tail = match compile_block(body, ctx, &dec_id, "true")? {
        Some((_, tail)) => tail,
        None => {
            let id = ctx.node_id("noop");
            ctx.cfg.add_node(CfgNode::named(id.clone(), "noop_true", NodeKind::Noop));
            ctx.cfg.add_successor(&dec_id, &id, "true")?;
            id
        }
    };

    let false_tail = match compile_block(orelse, ctx, &dec_id, "false")? {
        Some((_, tail)) => tail,
        None => {
            let id = ctx.node_id("noop");
            ctx.cfg.add_node(CfgNode::named(id.clone(), "noop_false", NodeKind::Noop));
            ctx.cfg.add_successor(&dec_id, &id, "false")?;
            id
        }
    };

    let join_id = ctx.node_id("noop");
    ctx.cfg.add_node(CfgNode::named(join_id.clone(), "join", NodeKind::Noop));
    ctx.cfg.add_successor(&true_tail, &join_id, "next")?;
    ctx.cfg.add_successor(&false_tail, &join_id, "next")?;

    Ok((dec_id, join_id))
}

fn compile_for(
    iterator: &str,
    iterable: &str,
    body: &[Stmt],
    ctx: &mut CompileContext,
    prev: &str,
    label: &str,
) -> Result<(String, String), CompileError> {
    let loop_id = ctx.node_id("loop");
    ctx.cfg.add_node(CfgNode::named(
        loop_id.clone(),
        "loop",
        NodeKind::Loop {
            iterator_var: iterator.to_string(),
            iterable_expr: iterable.to_string(),
            max_iterations: 1000,
            continue_on_error: false,
        },
    ));
    ctx.cfg.add_successor(prev, &loop_id, label)?;

    let body_tail = match compile_block(body, ctx, &loop_id, "body")? {
        Some((_, tail)) => tail,
        None => {
            let id = ctx.node_id("noop");
            ctx.cfg.add_node(CfgNode::named(id.clone(), "noop_body", NodeKind::Noop));
            ctx.cfg.add_successor(&loop_id, &id, "body")?;
            id
        }
    };

    // Back edge
    ctx.cfg.add_successor(&body_tail, &loop_id, "continue")?;

    let exit_id = ctx.node_id("noop");
    ctx.cfg.add_node(CfgNode::named(exit_id.clone(), "loop_exit", NodeKind::Noop));
    ctx.cfg.add_successor(&loop_id, &exit_id, "break")?;

    Ok((loop_id, exit_id))
}

fn compile_retry(
    attempts: u32,
    backoff: f64,
    body: &[Stmt],
    ctx: &mut CompileContext,
    prev: &str,
    label: &str,
) -> Result<(String, String), CompileError> {
    let retry_id = ctx.node_id("retry");
    ctx.cfg.add_node(CfgNode::named(
        retry_id.clone(),
        "retry",
        NodeKind::Retry {
            attempts,
            backoff_seconds: backoff,
            child_node_id: None,
        },
    ));
    ctx.cfg.add_successor(prev, &retry_id, label)?;

    let (child_id, body_tail) = match compile_block(body, ctx, &retry_id, "next")? {
        Some((entry, tail)) => (entry, tail),
        None => {
            let id = ctx.node_id("noop");
            ctx.cfg.add_node(CfgNode::named(id.clone(), "noop_retry", NodeKind::Noop));
            ctx.cfg.add_successor(&retry_id, &id, "next")?;
            (id.clone(), id)
        }
    };

    if let Some(node) = ctx.cfg.nodes.get_mut(&retry_id) {
        if let NodeKind::Retry { child_node_id, .. } = &mut node.kind {
            *child_node_id = Some(child_id);
        }
    }

    let success_id = ctx.node_id("noop");
    ctx.cfg
        .add_node(CfgNode::named(success_id.clone(), "retry_success", NodeKind::Noop));
    ctx.cfg.add_successor(&body_tail, &success_id, "next")?;
    // The orchestrator runs the retry subgraph up to this recorded exit
    ctx.cfg.add_successor(&retry_id, &success_id, "exit")?;

    Ok((retry_id, success_id))
}
