//! Recursive-descent parser for the plan DSL
//!
//! Expressions are reconstructed into normalized text as they parse:
//! attribute paths join without spaces (`t1.result.ok`), equality operators
//! tighten (`x==1`), everything else is single-spaced. The normalized text
//! is what the condition evaluator re-parses at execution time, so a
//! reformatted source compiles to an identical CFG.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use super::ast::{ArgValue, AssignValue, AstRoot, Stmt, TaskCall};
use super::lexer::lex;
use super::token::{Token, TokenKind};

/// Parse failure with position, offending token and expected set
#[derive(Debug, Clone, Error)]
#[error("Parse error at line {line}, column {column}: found {found}, expected {}", expected.join(" | "))]
pub struct ParseError {
    pub line: u32,
    pub column: u32,
    pub found: String,
    pub expected: Vec<String>,
}

impl ParseError {
    pub fn new(line: u32, column: u32, found: String, expected: Vec<String>) -> Self {
        Self {
            line,
            column,
            found,
            expected,
        }
    }
}

/// Parse DSL source into an AST
pub fn parse(source: &str) -> Result<AstRoot, ParseError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_root()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_ahead(&self, n: usize) -> &TokenKind {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, expected: &[&str]) -> ParseError {
        let token = self.peek();
        ParseError::new(
            token.line,
            token.col,
            token.kind.text(),
            expected.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token, ParseError> {
        if *self.peek_kind() == kind {
            Ok(self.advance())
        } else {
            Err(self.error(&[expected]))
        }
    }

    fn expect_name(&mut self, expected: &str) -> Result<(String, Token), ParseError> {
        if let TokenKind::Name(name) = self.peek_kind().clone() {
            let token = self.advance();
            Ok((name, token))
        } else {
            Err(self.error(&[expected]))
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_root(&mut self) -> Result<AstRoot, ParseError> {
        let mut statements = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.advance();
                }
                _ => statements.push(self.statement()?),
            }
        }
        Ok(AstRoot { statements })
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        match self.peek_kind() {
            TokenKind::If => self.if_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Retry => self.retry_stmt(),
            _ => self.simple_stmt(),
        }
    }

    fn simple_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = Some(self.peek().line);

        // Assignment: NAME '=' ...
        if matches!(self.peek_kind(), TokenKind::Name(_)) && *self.peek_ahead(1) == TokenKind::Assign {
            let (target, _) = self.expect_name("assignment target")?;
            self.expect(TokenKind::Assign, "=")?;

            let value = if self.at_call() {
                AssignValue::Call(self.call_expr()?)
            } else if let Some(literal) = self.peek_literal() {
                if *self.peek_ahead(1) == TokenKind::Newline || *self.peek_ahead(1) == TokenKind::Eof {
                    self.advance();
                    AssignValue::Literal(literal)
                } else {
                    AssignValue::Expr(self.expression()?)
                }
            } else {
                AssignValue::Expr(self.expression()?)
            };

            self.end_of_statement()?;
            return Ok(Stmt::Assign { target, value, line });
        }

        // Bare task call
        if self.at_call() {
            let call = self.call_expr()?;
            self.end_of_statement()?;
            return Ok(Stmt::TaskCall(call));
        }

        // Anything else: a bare expression statement
        let text = self.expression()?;
        self.end_of_statement()?;
        Ok(Stmt::Expr { text, line })
    }

    fn end_of_statement(&mut self) -> Result<(), ParseError> {
        match self.peek_kind() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => Err(self.error(&["end of statement"])),
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = Some(self.peek().line);
        self.expect(TokenKind::If, "if")?;
        let condition = self.expression()?;
        let body = self.suite()?;
        let orelse = if *self.peek_kind() == TokenKind::Else {
            self.advance();
            self.suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            condition,
            body,
            orelse,
            line,
        })
    }

    fn for_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = Some(self.peek().line);
        self.expect(TokenKind::For, "for")?;
        let (iterator, _) = self.expect_name("loop variable")?;
        self.expect(TokenKind::In, "in")?;
        let iterable = self.expression()?;
        let body = self.suite()?;
        Ok(Stmt::For {
            iterator,
            iterable,
            body,
            line,
        })
    }

    fn retry_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = Some(self.peek().line);
        self.expect(TokenKind::Retry, "retry")?;

        let (key, token) = self.expect_name("attempts")?;
        if key != "attempts" {
            return Err(ParseError::new(
                token.line,
                token.col,
                key,
                vec!["attempts".to_string()],
            ));
        }
        self.expect(TokenKind::Assign, "=")?;
        let attempts = match self.peek_kind().clone() {
            TokenKind::Int(n) if n >= 0 => {
                self.advance();
                n as u32
            }
            _ => return Err(self.error(&["a non-negative integer"])),
        };

        let mut backoff = 1.0;
        if let TokenKind::Name(name) = self.peek_kind().clone() {
            if name == "backoff" {
                self.advance();
                self.expect(TokenKind::Assign, "=")?;
                backoff = match self.peek_kind().clone() {
                    TokenKind::Int(n) => {
                        self.advance();
                        n as f64
                    }
                    TokenKind::Float(f) => {
                        self.advance();
                        f
                    }
                    _ => return Err(self.error(&["a number"])),
                };
            }
        }

        let body = self.suite()?;
        Ok(Stmt::Retry {
            attempts,
            backoff,
            body,
            line,
        })
    }

    fn suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(TokenKind::Colon, ":")?;
        self.expect(TokenKind::Newline, "newline")?;
        self.expect(TokenKind::Indent, "indented block")?;

        let mut statements = Vec::new();
        loop {
            match self.peek_kind() {
                TokenKind::Dedent => {
                    self.advance();
                    break;
                }
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Eof => return Err(self.error(&["dedent"])),
                _ => statements.push(self.statement()?),
            }
        }
        Ok(statements)
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn at_call(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Name(_)) && *self.peek_ahead(1) == TokenKind::LParen
    }

    fn call_expr(&mut self) -> Result<TaskCall, ParseError> {
        let (name, token) = self.expect_name("call name")?;
        let line = Some(token.line);
        self.expect(TokenKind::LParen, "(")?;

        let mut args = BTreeMap::new();
        loop {
            if *self.peek_kind() == TokenKind::RParen {
                self.advance();
                break;
            }

            // Keyword argument: NAME '=' value. Positional arguments are
            // accepted and discarded, matching the grammar.
            if matches!(self.peek_kind(), TokenKind::Name(_)) && *self.peek_ahead(1) == TokenKind::Assign {
                let (key, _) = self.expect_name("argument name")?;
                self.expect(TokenKind::Assign, "=")?;
                let value = self.arg_value()?;
                args.insert(key, value);
            } else {
                let _ = self.arg_value()?;
            }

            match self.peek_kind() {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RParen => {}
                _ => return Err(self.error(&[",", ")"])),
            }
        }

        Ok(TaskCall { name, args, line })
    }

    fn arg_value(&mut self) -> Result<ArgValue, ParseError> {
        if self.at_call() {
            return Err(self.error(&["a literal or expression (nested calls are not allowed)"]));
        }
        if let Some(literal) = self.peek_literal() {
            let next = self.peek_ahead(1).clone();
            if matches!(next, TokenKind::Comma | TokenKind::RParen) {
                self.advance();
                return Ok(ArgValue::Literal(literal));
            }
        }
        Ok(ArgValue::Expr(self.expression()?))
    }

    fn peek_literal(&self) -> Option<Value> {
        match self.peek_kind() {
            TokenKind::Str(s) => Some(Value::String(s.clone())),
            TokenKind::Int(n) => Some(Value::from(*n)),
            TokenKind::Float(f) => Some(Value::from(*f)),
            TokenKind::True => Some(Value::Bool(true)),
            TokenKind::False => Some(Value::Bool(false)),
            TokenKind::None => Some(Value::Null),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Expressions (reconstructed to normalized text)
    // ------------------------------------------------------------------

    fn expression(&mut self) -> Result<String, ParseError> {
        self.or_test()
    }

    fn or_test(&mut self) -> Result<String, ParseError> {
        let mut text = self.and_test()?;
        while *self.peek_kind() == TokenKind::Or {
            self.advance();
            let rhs = self.and_test()?;
            text = format!("{} or {}", text, rhs);
        }
        Ok(text)
    }

    fn and_test(&mut self) -> Result<String, ParseError> {
        let mut text = self.not_test()?;
        while *self.peek_kind() == TokenKind::And {
            self.advance();
            let rhs = self.not_test()?;
            text = format!("{} and {}", text, rhs);
        }
        Ok(text)
    }

    fn not_test(&mut self) -> Result<String, ParseError> {
        if *self.peek_kind() == TokenKind::Not {
            self.advance();
            let inner = self.not_test()?;
            return Ok(format!("not {}", inner));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<String, ParseError> {
        let mut text = self.atom_expr()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Eq => Some(("==", true)),
                TokenKind::Ne => Some(("!=", true)),
                TokenKind::Lt => Some(("<", false)),
                TokenKind::Le => Some(("<=", false)),
                TokenKind::Gt => Some((">", false)),
                TokenKind::Ge => Some((">=", false)),
                TokenKind::In => Some(("in", false)),
                TokenKind::Is => Some(("is", false)),
                _ => None,
            };
            let Some((op, tight)) = op else { break };
            self.advance();
            let rhs = self.atom_expr()?;
            text = if tight {
                format!("{}{}{}", text, op, rhs)
            } else {
                format!("{} {} {}", text, op, rhs)
            };
        }
        Ok(text)
    }

    fn atom_expr(&mut self) -> Result<String, ParseError> {
        let mut text = self.atom()?;
        while *self.peek_kind() == TokenKind::Dot {
            self.advance();
            let (attr, _) = self.expect_name("attribute name")?;
            text = format!("{}.{}", text, attr);
        }
        Ok(text)
    }

    fn atom(&mut self) -> Result<String, ParseError> {
        match self.peek_kind().clone() {
            TokenKind::Name(name) => {
                if *self.peek_ahead(1) == TokenKind::LParen {
                    return Err(self.error(&["an expression (function calls are not allowed here)"]));
                }
                self.advance();
                Ok(name)
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(TokenKind::RParen, ")")?;
                Ok(format!("({})", inner))
            }
            kind => {
                if let Some(_literal) = self.peek_literal() {
                    let token = self.advance();
                    return Ok(token.kind.text());
                }
                let _ = kind;
                Err(self.error(&["a name", "a literal", "("]))
            }
        }
    }
}
