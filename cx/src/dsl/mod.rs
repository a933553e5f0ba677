//! Plan DSL: lexer, parser, AST and validation
//!
//! The DSL is line-oriented with Python-like indentation:
//!
//! ```text
//! t1 = task(name="download", url="https://example.com")
//! if t1.result.ok:
//!     task(name="parse", data=t1.result)
//! else:
//!     task(name="report_failure")
//! for item in t1.result.items:
//!     task(name="upload", item=item)
//! retry attempts=3 backoff=0.5:
//!     task(name="save")
//! ```
//!
//! Blocks are introduced by `:` and delimited by synthetic Indent/Dedent
//! tokens. Newlines inside brackets are insignificant. Expressions are
//! restricted to names, attribute paths, literals and boolean/comparison
//! operators; they are carried through to the CFG as normalized text.

mod ast;
mod lexer;
mod parser;
mod token;
mod validate;

pub use ast::{unparse, ArgValue, AssignValue, AstRoot, Stmt, TaskCall};
pub use lexer::{lex, lex_expression};
pub use parser::{parse, ParseError};
pub use token::{Token, TokenKind};
pub use validate::{validate_ast, Severity, ValidationIssue, ValidationReport};
