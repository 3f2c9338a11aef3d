//! Parser for the access-path expressions that annotations and statements use.
//!
//! The grammar is the small C subset capability expressions are written in:
//!
//! ```text
//! expr    := '&' expr | '*' expr | postfix
//! postfix := primary ( '->' IDENT | '.' IDENT | '[' expr ']' )*
//! primary := IDENT | INT | '(' expr ')'
//! ```
//!
//! `a->f` is desugared to `(*a).f` while parsing so later stages only see
//! dereferences and field projections.

use std::fmt;
use thiserror::Error;

/// Parsed capability or member access expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Ident(String),
    Int(i64),
    AddrOf(Box<Expr>),
    Deref(Box<Expr>),
    Field { base: Box<Expr>, field: String },
    Index { base: Box<Expr>, index: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse expression `{input}`: {reason}")]
pub struct ExprError {
    pub input: String,
    pub reason: String,
}

impl Expr {
    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Ident(name.into())
    }

    /// Literal integer value, with `true`/`false` accepted as 1/0.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            Expr::Ident(name) if name == "true" => Some(1),
            Expr::Ident(name) if name == "false" => Some(0),
            _ => None,
        }
    }

    pub fn as_ident(&self) -> Option<&str> {
        match self {
            Expr::Ident(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ident(name) => write!(f, "{name}"),
            Expr::Int(v) => write!(f, "{v}"),
            Expr::AddrOf(inner) => write!(f, "&{inner}"),
            Expr::Deref(inner) => match inner.as_ref() {
                Expr::Ident(_) | Expr::Int(_) => write!(f, "*{inner}"),
                _ => write!(f, "*({inner})"),
            },
            Expr::Field { base, field } => match base.as_ref() {
                Expr::Deref(ptr) => write!(f, "{}->{field}", Postfix(ptr)),
                other => write!(f, "{}.{field}", Postfix(other)),
            },
            Expr::Index { base, index } => write!(f, "{}[{index}]", Postfix(base)),
        }
    }
}

/// Parenthesizes prefix expressions used as a postfix base.
struct Postfix<'a>(&'a Expr);

impl fmt::Display for Postfix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Expr::AddrOf(_) | Expr::Deref(_) => write!(f, "({})", self.0),
            other => write!(f, "{other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(i64),
    Amp,
    Star,
    Arrow,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'&' => {
                tokens.push(Token::Amp);
                i += 1;
            }
            b'*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            b'.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            b'(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            b'[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            b']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'>') => {
                tokens.push(Token::Arrow);
                i += 2;
            }
            b'0'..=b'9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let text = &input[start..i];
                let value = if let Some(hex) = text
                    .strip_prefix("0x")
                    .or_else(|| text.strip_prefix("0X"))
                {
                    i64::from_str_radix(hex, 16)
                } else {
                    text.trim_end_matches(['u', 'U', 'l', 'L']).parse::<i64>()
                };
                tokens.push(Token::Int(
                    value.map_err(|_| format!("invalid integer literal `{text}`"))?,
                ));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token::Ident(input[start..i].to_string()));
            }
            other => return Err(format!("unexpected character `{}`", other as char)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.bump() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(format!("expected {want:?}, found {tok:?}")),
            None => Err(format!("expected {want:?}, found end of input")),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Amp) => {
                self.bump();
                Ok(Expr::AddrOf(Box::new(self.expr()?)))
            }
            Some(Token::Star) => {
                self.bump();
                Ok(Expr::Deref(Box::new(self.expr()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut base = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Arrow) => {
                    self.bump();
                    let field = self.field_name()?;
                    base = Expr::Field {
                        base: Box::new(Expr::Deref(Box::new(base))),
                        field,
                    };
                }
                Some(Token::Dot) => {
                    self.bump();
                    let field = self.field_name()?;
                    base = Expr::Field {
                        base: Box::new(base),
                        field,
                    };
                }
                Some(Token::LBracket) => {
                    self.bump();
                    let index = self.expr()?;
                    self.expect(Token::RBracket)?;
                    base = Expr::Index {
                        base: Box::new(base),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(base),
            }
        }
    }

    fn field_name(&mut self) -> Result<String, String> {
        match self.bump() {
            Some(Token::Ident(name)) => Ok(name),
            Some(tok) => Err(format!("expected field name, found {tok:?}")),
            None => Err("expected field name, found end of input".to_string()),
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(tok) => Err(format!("unexpected token {tok:?}")),
            None => Err("empty expression".to_string()),
        }
    }
}

/// Parse a capability or access-path expression.
pub fn parse_expr(input: &str) -> Result<Expr, ExprError> {
    let err = |reason: String| ExprError {
        input: input.to_string(),
        reason,
    };

    let tokens = tokenize(input).map_err(err)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr().map_err(err)?;
    if let Some(tok) = parser.peek() {
        return Err(err(format!("trailing input at {tok:?}")));
    }
    Ok(expr)
}

/// Split a comma separated argument list, respecting nested parentheses.
pub fn split_args(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut cur = String::new();

    for c in input.chars() {
        match c {
            '(' | '[' => {
                depth += 1;
                cur.push(c);
            }
            ')' | ']' => {
                depth -= 1;
                cur.push(c);
            }
            ',' if depth == 0 => {
                out.push(cur.trim().to_string());
                cur.clear();
            }
            _ => cur.push(c),
        }
    }

    if !cur.trim().is_empty() || !out.is_empty() {
        out.push(cur.trim().to_string());
    }
    out
}
