//! Line lexer with synthetic Indent/Dedent tokens
//!
//! Indentation is significant only at bracket depth zero; newlines inside
//! `()`/`[]`/`{}` are insignificant. Tab width is fixed at 4 spaces.

use super::parser::ParseError;
use super::token::{Token, TokenKind};

const TAB_WIDTH: u32 = 4;

/// Lex full DSL source into a token stream ending in Eof
pub fn lex(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut indents: Vec<u32> = vec![0];
    let mut depth: usize = 0;
    let mut line_no: u32 = 0;

    for raw_line in source.lines() {
        line_no += 1;
        let chars: Vec<char> = raw_line.chars().collect();

        // Measure indentation and skip blank/comment-only lines
        let mut i = 0usize;
        let mut width = 0u32;
        while i < chars.len() && (chars[i] == ' ' || chars[i] == '\t') {
            width += if chars[i] == '\t' { TAB_WIDTH } else { 1 };
            i += 1;
        }
        let blank = i >= chars.len() || chars[i] == '#';
        if depth == 0 {
            if blank {
                continue;
            }
            let top = *indents.last().unwrap();
            if width > top {
                indents.push(width);
                tokens.push(Token::new(TokenKind::Indent, line_no, 1));
            } else if width < top {
                while *indents.last().unwrap() > width {
                    indents.pop();
                    tokens.push(Token::new(TokenKind::Dedent, line_no, 1));
                }
                if *indents.last().unwrap() != width {
                    return Err(ParseError::new(
                        line_no,
                        1,
                        format!("indent width {}", width),
                        vec!["a previously used indentation level".to_string()],
                    ));
                }
            }
        } else if blank {
            continue;
        }

        let produced = lex_line(&chars, i, line_no, &mut depth, &mut tokens)?;

        if depth == 0 && produced {
            tokens.push(Token::new(TokenKind::Newline, line_no, chars.len() as u32 + 1));
        }
    }

    if depth > 0 {
        return Err(ParseError::new(
            line_no,
            1,
            "end of input".to_string(),
            vec!["closing bracket".to_string()],
        ));
    }

    while indents.len() > 1 {
        indents.pop();
        tokens.push(Token::new(TokenKind::Dedent, line_no + 1, 1));
    }
    tokens.push(Token::new(TokenKind::Eof, line_no + 1, 1));
    Ok(tokens)
}

/// Lex a bare expression (no layout tokens), for condition evaluation
pub fn lex_expression(text: &str) -> Result<Vec<Token>, ParseError> {
    let tokens = lex(text)?;
    Ok(tokens
        .into_iter()
        .filter(|t| {
            !matches!(
                t.kind,
                TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent
            )
        })
        .collect())
}

/// Lex one physical line starting at `start`; returns whether any token
/// was produced
fn lex_line(
    chars: &[char],
    start: usize,
    line_no: u32,
    depth: &mut usize,
    tokens: &mut Vec<Token>,
) -> Result<bool, ParseError> {
    let mut i = start;
    let mut produced = false;

    while i < chars.len() {
        let c = chars[i];
        let col = i as u32 + 1;

        if c == ' ' || c == '\t' {
            i += 1;
            continue;
        }
        if c == '#' {
            break;
        }

        let kind = if c.is_ascii_alphabetic() || c == '_' {
            let begin = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[begin..i].iter().collect();
            TokenKind::keyword(&word).unwrap_or(TokenKind::Name(word))
        } else if c.is_ascii_digit() {
            let begin = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let is_float = i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit();
            if is_float {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[begin..i].iter().collect();
                TokenKind::Float(text.parse().map_err(|_| {
                    ParseError::new(line_no, col, text.clone(), vec!["a number".to_string()])
                })?)
            } else {
                let text: String = chars[begin..i].iter().collect();
                TokenKind::Int(text.parse().map_err(|_| {
                    ParseError::new(line_no, col, text.clone(), vec!["a number".to_string()])
                })?)
            }
        } else if c == '"' || c == '\'' {
            let quote = c;
            i += 1;
            let mut value = String::new();
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' && i + 1 < chars.len() {
                    let esc = chars[i + 1];
                    value.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    i += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                value.push(ch);
                i += 1;
            }
            if !closed {
                return Err(ParseError::new(
                    line_no,
                    col,
                    "unterminated string".to_string(),
                    vec![format!("closing {}", quote)],
                ));
            }
            TokenKind::Str(value)
        } else {
            let two: Option<TokenKind> = if i + 1 < chars.len() {
                match (c, chars[i + 1]) {
                    ('=', '=') => Some(TokenKind::Eq),
                    ('!', '=') => Some(TokenKind::Ne),
                    ('<', '=') => Some(TokenKind::Le),
                    ('>', '=') => Some(TokenKind::Ge),
                    _ => None,
                }
            } else {
                None
            };
            if let Some(kind) = two {
                i += 2;
                tokens.push(Token::new(kind, line_no, col));
                produced = true;
                continue;
            }
            i += 1;
            match c {
                '=' => TokenKind::Assign,
                '<' => TokenKind::Lt,
                '>' => TokenKind::Gt,
                ',' => TokenKind::Comma,
                ':' => TokenKind::Colon,
                '.' => TokenKind::Dot,
                '(' => {
                    *depth += 1;
                    TokenKind::LParen
                }
                '[' => {
                    *depth += 1;
                    TokenKind::LBracket
                }
                '{' => {
                    *depth += 1;
                    TokenKind::LBrace
                }
                ')' | ']' | '}' => {
                    if *depth == 0 {
                        return Err(ParseError::new(
                            line_no,
                            col,
                            c.to_string(),
                            vec!["matching opening bracket".to_string()],
                        ));
                    }
                    *depth -= 1;
                    match c {
                        ')' => TokenKind::RParen,
                        ']' => TokenKind::RBracket,
                        _ => TokenKind::RBrace,
                    }
                }
                other => {
                    return Err(ParseError::new(
                        line_no,
                        col,
                        other.to_string(),
                        vec!["a statement".to_string()],
                    ));
                }
            }
        };

        tokens.push(Token::new(kind, line_no, col));
        produced = true;
    }

    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_assignment() {
        let tokens = kinds("t1 = task(name=\"load\")");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Name("t1".to_string()),
                TokenKind::Assign,
                TokenKind::Name("task".to_string()),
                TokenKind::LParen,
                TokenKind::Name("name".to_string()),
                TokenKind::Assign,
                TokenKind::Str("load".to_string()),
                TokenKind::RParen,
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_indent_dedent() {
        let tokens = kinds("if x:\n    task(name=\"a\")\ntask(name=\"b\")");
        let indents = tokens.iter().filter(|k| **k == TokenKind::Indent).count();
        let dedents = tokens.iter().filter(|k| **k == TokenKind::Dedent).count();
        assert_eq!(indents, 1);
        assert_eq!(dedents, 1);
    }

    #[test]
    fn test_dedent_emitted_at_eof() {
        let tokens = kinds("if x:\n    task(name=\"a\")");
        assert_eq!(tokens[tokens.len() - 1], TokenKind::Eof);
        assert_eq!(tokens[tokens.len() - 2], TokenKind::Dedent);
    }

    #[test]
    fn test_newline_inside_brackets_insignificant() {
        let tokens = kinds("t1 = task(\n    name=\"load\",\n    retries=3\n)");
        let newlines = tokens.iter().filter(|k| **k == TokenKind::Newline).count();
        let indents = tokens.iter().filter(|k| **k == TokenKind::Indent).count();
        assert_eq!(newlines, 1);
        assert_eq!(indents, 0);
    }

    #[test]
    fn test_tab_counts_as_four_spaces() {
        // Tab-indented and 4-space-indented bodies are the same level
        let tokens = kinds("if x:\n\ttask(name=\"a\")\n    task(name=\"b\")");
        let indents = tokens.iter().filter(|k| **k == TokenKind::Indent).count();
        assert_eq!(indents, 1);
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let tokens = kinds("# header\n\nt1 = task(name=\"x\")  # trailing\n");
        let names = tokens
            .iter()
            .filter(|k| matches!(k, TokenKind::Name(_)))
            .count();
        assert_eq!(names, 3); // t1, task, name
    }

    #[test]
    fn test_comparison_operators() {
        let tokens = kinds("a <= b");
        assert!(tokens.contains(&TokenKind::Le));
        let tokens = kinds("a != b");
        assert!(tokens.contains(&TokenKind::Ne));
    }

    #[test]
    fn test_inconsistent_dedent_rejected() {
        let err = lex("if x:\n        task(name=\"a\")\n  task(name=\"b\")").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_unterminated_string_rejected() {
        let err = lex("t = task(name=\"oops)").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_unbalanced_bracket_rejected() {
        assert!(lex("t = task(name=\"x\"").is_err());
        assert!(lex("t = task name=\"x\")").is_err());
    }

    #[test]
    fn test_lex_expression_strips_layout() {
        let tokens = lex_expression("t1.result.ok and not t2.failed").unwrap();
        assert!(!tokens.iter().any(|t| t.kind == TokenKind::Newline));
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }
}
