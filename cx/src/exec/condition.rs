//! Safe condition evaluation over resolver-provided values
//!
//! Conditions are the restricted expression subset of the DSL: names,
//! attribute paths, literals, boolean and comparison operators. Values are
//! JSON trees; attribute access is repeated map lookup, never method
//! dispatch. Base names are resolved exactly once per evaluation through
//! the caller's resolver. Any failure coerces to `false` with a warning;
//! function calls, subscripting and assignment are refused outright.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::dsl::{lex_expression, Token, TokenKind};

const UNSAFE_MARKERS: &[&str] = &["eval(", "exec(", "__import__"];

/// Resolves a base name to a value
pub type Resolver = Arc<dyn Fn(&str) -> Option<Value> + Send + Sync>;

/// A resolver that knows no names
pub fn null_resolver() -> Resolver {
    Arc::new(|_| None)
}

#[derive(Debug, Clone, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Is,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Name(String),
    Attr(Box<Expr>, String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
}

/// Evaluator bound to a resolver
#[derive(Clone)]
pub struct ConditionEvaluator {
    resolver: Resolver,
}

impl ConditionEvaluator {
    pub fn new(resolver: Resolver) -> Self {
        Self { resolver }
    }

    /// Evaluate a condition to a boolean. Empty, malformed or unsafe
    /// expressions are `false`.
    pub fn evaluate(&self, condition: &str) -> bool {
        match self.evaluate_value(condition) {
            Some(value) => truthy(&value),
            None => false,
        }
    }

    /// Evaluate an expression to its value (used for loop iterables)
    pub fn evaluate_value(&self, expression: &str) -> Option<Value> {
        let expression = expression.trim();
        if expression.is_empty() {
            return None;
        }
        for marker in UNSAFE_MARKERS {
            if expression.contains(marker) {
                warn!(expression, "Condition rejected: unsafe construct");
                return None;
            }
        }

        let expr = match parse_expression(expression) {
            Ok(expr) => expr,
            Err(reason) => {
                warn!(expression, reason, "Condition evaluation failed");
                return None;
            }
        };

        // Resolve every base name once, then evaluate in that environment
        let mut names = HashSet::new();
        collect_names(&expr, &mut names);
        let mut env: HashMap<String, Value> = HashMap::new();
        for name in names {
            let value = (self.resolver)(&name).unwrap_or(Value::Null);
            env.insert(name, value);
        }

        match eval(&expr, &env) {
            Ok(value) => Some(value),
            Err(reason) => {
                warn!(expression, reason, "Condition evaluation failed");
                None
            }
        }
    }
}

/// Python-like truthiness over JSON values
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn collect_names(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::Name(name) => {
            out.insert(name.clone());
        }
        Expr::Attr(base, _) | Expr::Not(base) => collect_names(base, out),
        Expr::And(a, b) | Expr::Or(a, b) => {
            collect_names(a, out);
            collect_names(b, out);
        }
        Expr::Cmp(a, _, b) => {
            collect_names(a, out);
            collect_names(b, out);
        }
        Expr::Literal(_) => {}
    }
}

fn eval(expr: &Expr, env: &HashMap<String, Value>) -> Result<Value, String> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => Ok(env.get(name).cloned().unwrap_or(Value::Null)),
        Expr::Attr(base, attr) => {
            let base = eval(base, env)?;
            match base {
                Value::Object(map) => Ok(map.get(attr).cloned().unwrap_or(Value::Null)),
                Value::Null => Err(format!("attribute '{}' on null", attr)),
                other => Err(format!("attribute '{}' on non-object {}", attr, type_name(&other))),
            }
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, env)?))),
        Expr::And(a, b) => {
            let lhs = eval(a, env)?;
            if !truthy(&lhs) {
                Ok(lhs)
            } else {
                eval(b, env)
            }
        }
        Expr::Or(a, b) => {
            let lhs = eval(a, env)?;
            if truthy(&lhs) {
                Ok(lhs)
            } else {
                eval(b, env)
            }
        }
        Expr::Cmp(a, op, b) => {
            let lhs = eval(a, env)?;
            let rhs = eval(b, env)?;
            compare(&lhs, op, &rhs).map(Value::Bool)
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return x.as_f64() == y.as_f64();
    }
    a == b
}

fn compare(lhs: &Value, op: &CmpOp, rhs: &Value) -> Result<bool, String> {
    match op {
        CmpOp::Eq => Ok(values_equal(lhs, rhs)),
        CmpOp::Ne => Ok(!values_equal(lhs, rhs)),
        CmpOp::Is => Ok(values_equal(lhs, rhs)),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Number(x), Value::Number(y)) => {
                    let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) else {
                        return Err("non-finite number comparison".to_string());
                    };
                    x.partial_cmp(&y).ok_or("incomparable numbers".to_string())?
                }
                (Value::String(x), Value::String(y)) => x.cmp(y),
                _ => {
                    return Err(format!(
                        "cannot order {} and {}",
                        type_name(lhs),
                        type_name(rhs)
                    ))
                }
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        CmpOp::In => match rhs {
            Value::Array(items) => Ok(items.iter().any(|item| values_equal(lhs, item))),
            Value::String(haystack) => match lhs {
                Value::String(needle) => Ok(haystack.contains(needle.as_str())),
                _ => Err("'in' on string requires a string needle".to_string()),
            },
            Value::Object(map) => match lhs {
                Value::String(key) => Ok(map.contains_key(key)),
                _ => Err("'in' on object requires a string key".to_string()),
            },
            other => Err(format!("'in' not supported on {}", type_name(other))),
        },
    }
}

// ----------------------------------------------------------------------
// Expression parsing (restricted subset only)
// ----------------------------------------------------------------------

fn parse_expression(text: &str) -> Result<Expr, String> {
    let tokens = lex_expression(text).map_err(|e| e.to_string())?;
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.or_test()?;
    match parser.peek() {
        TokenKind::Eof => Ok(expr),
        other => Err(format!("unexpected token {}", other.text())),
    }
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.tokens[self.pos.min(self.tokens.len() - 1)].kind.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn or_test(&mut self) -> Result<Expr, String> {
        let mut expr = self.and_test()?;
        while *self.peek() == TokenKind::Or {
            self.advance();
            expr = Expr::Or(Box::new(expr), Box::new(self.and_test()?));
        }
        Ok(expr)
    }

    fn and_test(&mut self) -> Result<Expr, String> {
        let mut expr = self.not_test()?;
        while *self.peek() == TokenKind::And {
            self.advance();
            expr = Expr::And(Box::new(expr), Box::new(self.not_test()?));
        }
        Ok(expr)
    }

    fn not_test(&mut self) -> Result<Expr, String> {
        if *self.peek() == TokenKind::Not {
            self.advance();
            return Ok(Expr::Not(Box::new(self.not_test()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let mut expr = self.atom_expr()?;
        loop {
            let op = match self.peek() {
                TokenKind::Eq => CmpOp::Eq,
                TokenKind::Ne => CmpOp::Ne,
                TokenKind::Lt => CmpOp::Lt,
                TokenKind::Le => CmpOp::Le,
                TokenKind::Gt => CmpOp::Gt,
                TokenKind::Ge => CmpOp::Ge,
                TokenKind::In => CmpOp::In,
                TokenKind::Is => CmpOp::Is,
                _ => break,
            };
            self.advance();
            let rhs = self.atom_expr()?;
            expr = Expr::Cmp(Box::new(expr), op, Box::new(rhs));
        }
        Ok(expr)
    }

    fn atom_expr(&mut self) -> Result<Expr, String> {
        let mut expr = self.atom()?;
        while *self.peek() == TokenKind::Dot {
            self.advance();
            match self.advance() {
                TokenKind::Name(attr) => expr = Expr::Attr(Box::new(expr), attr),
                other => return Err(format!("expected attribute name, found {}", other.text())),
            }
        }
        if *self.peek() == TokenKind::LBracket {
            return Err("subscripting is not allowed".to_string());
        }
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, String> {
        match self.advance() {
            TokenKind::Name(name) => {
                if *self.peek() == TokenKind::LParen {
                    return Err("function calls are not allowed".to_string());
                }
                Ok(Expr::Name(name))
            }
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::Int(n) => Ok(Expr::Literal(Value::from(n))),
            TokenKind::Float(f) => Ok(Expr::Literal(Value::from(f))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::None => Ok(Expr::Literal(Value::Null)),
            TokenKind::LParen => {
                let inner = self.or_test()?;
                match self.advance() {
                    TokenKind::RParen => Ok(inner),
                    other => Err(format!("expected ')', found {}", other.text())),
                }
            }
            other => Err(format!("unexpected token {}", other.text())),
        }
    }
}
