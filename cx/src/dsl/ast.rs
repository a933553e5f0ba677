//! Typed AST for the plan DSL

use std::collections::BTreeMap;

use serde_json::Value;

/// Root of a parsed program
#[derive(Debug, Clone, PartialEq)]
pub struct AstRoot {
    pub statements: Vec<Stmt>,
}

/// A statement
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `target = task(...)` (or, rarely, a plain expression RHS)
    Assign {
        target: String,
        value: AssignValue,
        line: Option<u32>,
    },
    /// Bare `task(...)` call
    TaskCall(TaskCall),
    /// `if <expr>: ... else: ...`
    If {
        condition: String,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        line: Option<u32>,
    },
    /// `for <name> in <expr>: ...`
    For {
        iterator: String,
        iterable: String,
        body: Vec<Stmt>,
        line: Option<u32>,
    },
    /// `retry attempts=N backoff=F: ...`
    Retry {
        attempts: u32,
        backoff: f64,
        body: Vec<Stmt>,
        line: Option<u32>,
    },
    /// A bare expression statement; compiles to a NoOp
    Expr { text: String, line: Option<u32> },
}

/// Right-hand side of an assignment
#[derive(Debug, Clone, PartialEq)]
pub enum AssignValue {
    Call(TaskCall),
    Expr(String),
    Literal(Value),
}

/// A task invocation with keyword arguments
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCall {
    pub name: String,
    pub args: BTreeMap<String, ArgValue>,
    pub line: Option<u32>,
}

/// A task argument value: a literal, or raw expression text resolved at
/// execution time
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Literal(Value),
    Expr(String),
}

impl ArgValue {
    /// Serialized form carried in CFG metadata: literals as-is,
    /// expressions as `{"expr": text}`
    pub fn to_metadata_value(&self) -> Value {
        match self {
            ArgValue::Literal(v) => v.clone(),
            ArgValue::Expr(text) => serde_json::json!({ "expr": text }),
        }
    }
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if n.is_f64() && f.fract() == 0.0 {
                    return format!("{:.1}", f);
                }
            }
            n.to_string()
        }
        other => other.to_string(),
    }
}

fn render_call(call: &TaskCall) -> String {
    let args: Vec<String> = call
        .args
        .iter()
        .map(|(k, v)| match v {
            ArgValue::Literal(value) => format!("{}={}", k, render_literal(value)),
            ArgValue::Expr(text) => format!("{}={}", k, text),
        })
        .collect();
    format!("{}({})", call.name, args.join(", "))
}

fn unparse_block(statements: &[Stmt], indent: usize, out: &mut String) {
    let pad = "    ".repeat(indent);
    for stmt in statements {
        match stmt {
            Stmt::Assign { target, value, .. } => {
                let rhs = match value {
                    AssignValue::Call(call) => render_call(call),
                    AssignValue::Expr(text) => text.clone(),
                    AssignValue::Literal(value) => render_literal(value),
                };
                out.push_str(&format!("{}{} = {}\n", pad, target, rhs));
            }
            Stmt::TaskCall(call) => {
                out.push_str(&format!("{}{}\n", pad, render_call(call)));
            }
            Stmt::If {
                condition,
                body,
                orelse,
                ..
            } => {
                out.push_str(&format!("{}if {}:\n", pad, condition));
                unparse_block(body, indent + 1, out);
                if !orelse.is_empty() {
                    out.push_str(&format!("{}else:\n", pad));
                    unparse_block(orelse, indent + 1, out);
                }
            }
            Stmt::For {
                iterator,
                iterable,
                body,
                ..
            } => {
                out.push_str(&format!("{}for {} in {}:\n", pad, iterator, iterable));
                unparse_block(body, indent + 1, out);
            }
            Stmt::Retry {
                attempts,
                backoff,
                body,
                ..
            } => {
                out.push_str(&format!("{}retry attempts={} backoff={}:\n", pad, attempts, {
                    if backoff.fract() == 0.0 {
                        format!("{:.1}", backoff)
                    } else {
                        backoff.to_string()
                    }
                }));
                unparse_block(body, indent + 1, out);
            }
            Stmt::Expr { text, .. } => {
                out.push_str(&format!("{}{}\n", pad, text));
            }
        }
    }
}

/// Render the AST back to canonical DSL text
///
/// Round-trips: parsing the output reproduces the AST (expression text is
/// already normalized by the parser, so it passes through unchanged).
pub fn unparse(ast: &AstRoot) -> String {
    let mut out = String::new();
    unparse_block(&ast.statements, 0, &mut out);
    out
}
