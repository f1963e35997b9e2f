//! Safe conditional-gate expression evaluation.
//!
//! Gate `when` expressions are evaluated against a closed value space —
//! `tags`, `metadata`, and `gateHistory` — with no ambient capabilities: no
//! filesystem, network, timers, or host functions. The grammar is a bounded
//! subset: literals, dotted field access, equality, numeric/string
//! comparison, membership (`in` / `contains`), boolean connectives, and
//! parentheses. An empty expression is always active; a parse error, type
//! error, non-boolean result, or blown 100 ms budget evaluates to `false`
//! and the gate is skipped.

use aof_core::GateHistoryEntry;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Evaluation budget for one expression
pub const EVAL_TIMEOUT: Duration = Duration::from_millis(100);
/// Upper bound on expression source length
const MAX_EXPR_LEN: usize = 4096;

/// The closed value space a gate condition may read.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    pub tags: &'a [String],
    pub metadata: &'a BTreeMap<String, serde_json::Value>,
    pub gate_history: &'a [GateHistoryEntry],
}

/// Evaluate a gate condition. `None` or an all-whitespace expression is
/// always active; every failure mode evaluates to `false`.
pub fn evaluate_gate_condition(when: Option<&str>, ctx: &ConditionContext<'_>) -> bool {
    let Some(source) = when else {
        return true;
    };
    if source.trim().is_empty() {
        return true;
    }
    if source.len() > MAX_EXPR_LEN {
        tracing::warn!(len = source.len(), "Gate condition too long; skipping gate");
        return false;
    }

    let deadline = Instant::now() + EVAL_TIMEOUT;
    match parse(source).and_then(|expr| expr.eval(ctx, deadline)) {
        Ok(Value::Bool(b)) => b,
        Ok(other) => {
            tracing::warn!(
                expression = source,
                result = ?other,
                "Gate condition did not evaluate to a boolean; skipping gate"
            );
            false
        }
        Err(e) => {
            tracing::warn!(expression = source, error = %e, "Gate condition failed; skipping gate");
            false
        }
    }
}

/// Runtime value of the expression language
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Value>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }

    fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            // Objects are opaque; field access descends before conversion
            serde_json::Value::Object(_) => Value::Null,
        }
    }
}

#[derive(Debug)]
enum EvalError {
    Parse(String),
    Type(String),
    UnknownName(String),
    Timeout,
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalError::Parse(msg) => write!(f, "parse error: {msg}"),
            EvalError::Type(msg) => write!(f, "type error: {msg}"),
            EvalError::UnknownName(name) => write!(f, "unknown name: {name}"),
            EvalError::Timeout => write!(f, "evaluation timed out"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    And,
    Or,
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, ctx: &ConditionContext<'_>, deadline: Instant) -> Result<Value, EvalError> {
        if Instant::now() >= deadline {
            return Err(EvalError::Timeout);
        }
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(parts) => resolve_path(parts, ctx),
            Expr::Not(inner) => match inner.eval(ctx, deadline)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(EvalError::Type(format!(
                    "'!' needs a bool, got {}",
                    other.type_name()
                ))),
            },
            Expr::Binary(op, lhs, rhs) => {
                // Short-circuit the connectives
                if matches!(op, BinOp::And | BinOp::Or) {
                    let left = expect_bool(lhs.eval(ctx, deadline)?, "left of connective")?;
                    return match (op, left) {
                        (BinOp::And, false) => Ok(Value::Bool(false)),
                        (BinOp::Or, true) => Ok(Value::Bool(true)),
                        _ => {
                            let right =
                                expect_bool(rhs.eval(ctx, deadline)?, "right of connective")?;
                            Ok(Value::Bool(right))
                        }
                    };
                }

                let left = lhs.eval(ctx, deadline)?;
                let right = rhs.eval(ctx, deadline)?;
                apply_comparison(*op, left, right)
            }
        }
    }
}

fn expect_bool(value: Value, context: &str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::Type(format!(
            "{context} needs a bool, got {}",
            other.type_name()
        ))),
    }
}

fn apply_comparison(op: BinOp, left: Value, right: Value) -> Result<Value, EvalError> {
    let result = match op {
        BinOp::Eq => left == right,
        BinOp::Ne => left != right,
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
                (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                _ => {
                    return Err(EvalError::Type(format!(
                        "cannot order {} against {}",
                        left.type_name(),
                        right.type_name()
                    )))
                }
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }
        }
        BinOp::In => return membership(&left, &right),
        BinOp::Contains => return membership(&right, &left),
        BinOp::And | BinOp::Or => unreachable!("connectives handled earlier"),
    };
    Ok(Value::Bool(result))
}

/// `needle in haystack`: element of a list, or substring of a string
fn membership(needle: &Value, haystack: &Value) -> Result<Value, EvalError> {
    match haystack {
        Value::List(items) => Ok(Value::Bool(items.contains(needle))),
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(Value::Bool(s.contains(sub.as_str()))),
            other => Err(EvalError::Type(format!(
                "substring test needs a string, got {}",
                other.type_name()
            ))),
        },
        other => Err(EvalError::Type(format!(
            "'in' needs a list or string on the right, got {}",
            other.type_name()
        ))),
    }
}

fn resolve_path(parts: &[String], ctx: &ConditionContext<'_>) -> Result<Value, EvalError> {
    match parts[0].as_str() {
        "tags" => {
            if parts.len() > 1 {
                return Err(EvalError::Type("tags has no fields".to_string()));
            }
            Ok(Value::List(
                ctx.tags.iter().map(|t| Value::Str(t.clone())).collect(),
            ))
        }
        "gateHistory" => {
            if parts.len() > 1 {
                return Err(EvalError::Type("gateHistory has no fields".to_string()));
            }
            Ok(Value::List(
                ctx.gate_history
                    .iter()
                    .map(|e| Value::Str(e.gate.clone()))
                    .collect(),
            ))
        }
        "metadata" => {
            if parts.len() == 1 {
                return Err(EvalError::Type(
                    "metadata must be accessed by field".to_string(),
                ));
            }
            let Some(mut current) = ctx.metadata.get(&parts[1]) else {
                return Ok(Value::Null);
            };
            for part in &parts[2..] {
                match current.get(part) {
                    Some(next) => current = next,
                    None => return Ok(Value::Null),
                }
            }
            Ok(Value::from_json(current))
        }
        other => Err(EvalError::UnknownName(other.to_string())),
    }
}

// ── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    In,
    Contains,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    And,
    Or,
    Dot,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Eq);
                } else {
                    return Err(EvalError::Parse("expected '=='".to_string()));
                }
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::And);
                } else {
                    return Err(EvalError::Parse("expected '&&'".to_string()));
                }
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_some() {
                    tokens.push(Token::Or);
                } else {
                    return Err(EvalError::Parse("expected '||'".to_string()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => s.push(c),
                        None => return Err(EvalError::Parse("unterminated string".to_string())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value: f64 = num
                    .parse()
                    .map_err(|_| EvalError::Parse(format!("bad number '{num}'")))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "in" => Token::In,
                    "contains" => Token::Contains,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(EvalError::Parse(format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

// ── Recursive-descent parser ───────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn parse(source: &str) -> Result<Expr, EvalError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(EvalError::Parse("trailing input".to_string()));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), EvalError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => Err(EvalError::Parse(format!(
                "expected {token:?}, got {other:?}"
            ))),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and_expr()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.unary()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::In) => BinOp::In,
            Some(Token::Contains) => BinOp::Contains,
            _ => return Ok(left),
        };
        self.next();
        let right = self.operand()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn operand(&mut self) -> Result<Expr, EvalError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Num(n))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Ident(first)) => {
                let mut parts = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(part)) => parts.push(part),
                        other => {
                            return Err(EvalError::Parse(format!(
                                "expected field name after '.', got {other:?}"
                            )))
                        }
                    }
                }
                Ok(Expr::Path(parts))
            }
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(EvalError::Parse(format!("unexpected token {other:?}"))),
        }
    }
}
