//! Post-parse AST validation
//!
//! Produces diagnostics detailed enough to feed back into an LLM rewrite
//! prompt. Errors reject the plan; warnings ride along in the report.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use super::ast::{ArgValue, AssignValue, AstRoot, Stmt, TaskCall};

const RESERVED: &[&str] = &["if", "for", "retry", "task", "else", "in"];
const UNSAFE_MARKERS: &[&str] = &["eval(", "exec(", "__import__"];

fn valid_var_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap())
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap())
}

/// Issue severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A single diagnostic
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
    pub line: Option<u32>,
}

/// Validation outcome
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>, line: Option<u32>) {
        self.errors.push(ValidationIssue {
            severity: Severity::Error,
            message: message.into(),
            line,
        });
    }

    fn warning(&mut self, message: impl Into<String>, line: Option<u32>) {
        self.warnings.push(ValidationIssue {
            severity: Severity::Warning,
            message: message.into(),
            line,
        });
    }
}

/// Validate an AST: assignment targets, reserved words, retry bounds,
/// empty blocks, unsafe expression markers, forward references.
pub fn validate_ast(ast: &AstRoot) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut defined: BTreeSet<String> = BTreeSet::new();

    for stmt in &ast.statements {
        visit(stmt, &mut defined, &mut report);
    }

    for reserved in RESERVED {
        if defined.contains(*reserved) {
            report.error(format!("Reserved keyword used as variable name: '{}'", reserved), None);
        }
    }

    report
}

fn visit(stmt: &Stmt, defined: &mut BTreeSet<String>, report: &mut ValidationReport) {
    match stmt {
        Stmt::Assign { target, value, line } => {
            if !valid_var_re().is_match(target) || RESERVED.contains(&target.as_str()) {
                report.error(format!("Invalid assignment target '{}'", target), *line);
            }
            defined.insert(target.clone());
            match value {
                AssignValue::Call(call) => check_call(call, defined, report),
                AssignValue::Expr(text) => check_expr_text(text, *line, report),
                AssignValue::Literal(_) => {}
            }
        }
        Stmt::TaskCall(call) => check_call(call, defined, report),
        Stmt::If {
            condition,
            body,
            orelse,
            line,
        } => {
            if condition.trim().is_empty() {
                report.error("Empty if condition", *line);
            }
            check_expr_text(condition, *line, report);
            if body.is_empty() {
                report.warning("If statement has empty body", *line);
            }
            for s in body {
                visit(s, defined, report);
            }
            for s in orelse {
                visit(s, defined, report);
            }
        }
        Stmt::For {
            iterator,
            iterable,
            body,
            line,
        } => {
            if !valid_var_re().is_match(iterator) {
                report.error(format!("Invalid iterator variable '{}'", iterator), *line);
            }
            defined.insert(iterator.clone());
            if iterable.trim().is_empty() {
                report.error("For loop iterable expression is empty", *line);
            }
            check_expr_text(iterable, *line, report);
            if body.is_empty() {
                report.warning("For loop has empty body", *line);
            }
            for s in body {
                visit(s, defined, report);
            }
        }
        Stmt::Retry {
            attempts,
            body,
            line,
            ..
        } => {
            if *attempts < 1 || *attempts > 100 {
                report.error(
                    format!("Retry attempts must be between 1 and 100 (found {})", attempts),
                    *line,
                );
            }
            if body.is_empty() {
                report.warning("Retry block has empty body", *line);
            }
            for s in body {
                visit(s, defined, report);
            }
        }
        Stmt::Expr { text, line } => check_expr_text(text, *line, report),
    }
}

fn check_call(call: &TaskCall, defined: &BTreeSet<String>, report: &mut ValidationReport) {
    for (key, value) in &call.args {
        if !valid_var_re().is_match(key) {
            report.error(
                format!("Invalid argument name '{}' in call {}()", key, call.name),
                call.line,
            );
        }
        if let ArgValue::Expr(text) = value {
            check_expr_text(text, call.line, report);
            for token in name_re().find_iter(text) {
                let name = token.as_str();
                if defined.contains(name) {
                    continue;
                }
                if matches!(name, "True" | "False" | "None" | "and" | "or" | "not" | "in" | "is") {
                    continue;
                }
                // Could be defined later in lexical order, so warn only
                report.warning(
                    format!("Possible forward reference to '{}' in argument of {}()", name, call.name),
                    call.line,
                );
            }
        }
    }
}

fn check_expr_text(text: &str, line: Option<u32>, report: &mut ValidationReport) {
    for marker in UNSAFE_MARKERS {
        if text.contains(marker) {
            report.error(format!("Unsafe expression detected in '{}'", text), line);
            return;
        }
    }
}
