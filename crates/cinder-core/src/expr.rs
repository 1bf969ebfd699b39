//! Condition and template expressions.
//!
//! Expressions are parsed once into an [`Expression`] tree and evaluated against an
//! [`ExprContext`]. The grammar is deliberately small:
//!
//! ```text
//! or         := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := primary ( ( "==" | "!=" ) primary )?
//! primary    := literal | "(" or ")" | function "(" args ")" | path
//! path       := root ( "." ident | "[" string "]" )*
//! ```
//!
//! Roots are `run`, `trigger`, `inputs`, `env`, `matrix`, `needs`, `steps` and `job`.
//! A missing path evaluates to `null`. `hashFiles(...)` reads files under `job.workspace`.

use crate::glob::hash_files;
use crate::workflow::{EnvMap, MatrixAssignment};
use indexmap::IndexMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,

    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected {found}, expected {expected}")]
    UnexpectedToken { found: String, expected: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown context '{0}'")]
    UnknownContext(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{name}() takes {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
        }
    }

    fn to_number(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) if s.trim().is_empty() => 0.0,
            Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        }
    }

    /// Equality with numeric coercion when the operand types differ.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => self.to_number() == other.to_number(),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map_or(Value::Null, Value::Number),
            serde_json::Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Run,
    Trigger,
    Inputs,
    Env,
    Matrix,
    Needs,
    Steps,
    Job,
}

impl Root {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "run" => Root::Run,
            "trigger" => Root::Trigger,
            "inputs" => Root::Inputs,
            "env" => Root::Env,
            "matrix" => Root::Matrix,
            "needs" => Root::Needs,
            "steps" => Root::Steps,
            "job" => Root::Job,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Success,
    Failure,
    Always,
    Cancelled,
    Contains,
    StartsWith,
    EndsWith,
    HashFiles,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "success" => Function::Success,
            "failure" => Function::Failure,
            "always" => Function::Always,
            "cancelled" => Function::Cancelled,
            "contains" => Function::Contains,
            "startsWith" => Function::StartsWith,
            "endsWith" => Function::EndsWith,
            "hashFiles" => Function::HashFiles,
            _ => return None,
        })
    }

    /// Exact argument count; `None` means one or more.
    fn arity(&self) -> Option<usize> {
        match self {
            Function::Success | Function::Failure | Function::Always | Function::Cancelled => {
                Some(0)
            }
            Function::Contains | Function::StartsWith | Function::EndsWith => Some(2),
            Function::HashFiles => None,
        }
    }

    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Function::Success | Function::Failure | Function::Always | Function::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Path { root: Root, segments: Vec<String> },
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Compare {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Call {
        function: Function,
        args: Vec<Expression>,
    },
}

impl Expression {
    /// Parse an expression, accepting an optional `${{ ... }}` wrapper.
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let body = strip_wrapper(source.trim());
        let tokens = tokenize(body)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.advance() {
            return Err(ExprError::UnexpectedToken {
                found: token.describe(),
                expected: "end of expression".to_string(),
            });
        }
        Ok(expr)
    }

    /// Whether the expression calls `success()`, `failure()`, `always()` or `cancelled()`.
    pub fn references_status(&self) -> bool {
        match self {
            Expression::Literal(_) | Expression::Path { .. } => false,
            Expression::Not(inner) => inner.references_status(),
            Expression::And(l, r) | Expression::Or(l, r) => {
                l.references_status() || r.references_status()
            }
            Expression::Compare { left, right, .. } => {
                left.references_status() || right.references_status()
            }
            Expression::Call { function, args } => {
                function.is_status() || args.iter().any(Expression::references_status)
            }
        }
    }

    pub fn evaluate(&self, ctx: &ExprContext) -> Value {
        match self {
            Expression::Literal(value) => value.clone(),
            Expression::Path { root, segments } => ctx.lookup(*root, segments),
            Expression::Not(inner) => Value::Bool(!inner.evaluate(ctx).is_truthy()),
            Expression::And(l, r) => {
                let left = l.evaluate(ctx);
                if left.is_truthy() { r.evaluate(ctx) } else { left }
            }
            Expression::Or(l, r) => {
                let left = l.evaluate(ctx);
                if left.is_truthy() { left } else { r.evaluate(ctx) }
            }
            Expression::Compare { op, left, right } => {
                let equal = left.evaluate(ctx).loose_eq(&right.evaluate(ctx));
                Value::Bool(match op {
                    CompareOp::Eq => equal,
                    CompareOp::Ne => !equal,
                })
            }
            Expression::Call { function, args } => call(*function, args, ctx),
        }
    }
}

fn call(function: Function, args: &[Expression], ctx: &ExprContext) -> Value {
    let status = ctx.status;
    match function {
        Function::Success => Value::Bool(status.success()),
        Function::Failure => Value::Bool(status.failed),
        Function::Always => Value::Bool(true),
        Function::Cancelled => Value::Bool(status.cancelled),
        Function::Contains | Function::StartsWith | Function::EndsWith => {
            let haystack = args[0].evaluate(ctx).to_string();
            let needle = args[1].evaluate(ctx).to_string();
            Value::Bool(match function {
                Function::Contains => haystack.contains(&needle),
                Function::StartsWith => haystack.starts_with(&needle),
                _ => haystack.ends_with(&needle),
            })
        }
        Function::HashFiles => {
            let Some(workspace) = ctx.job.get("workspace") else {
                return Value::String(String::new());
            };
            let patterns: Vec<String> = args.iter().map(|a| a.evaluate(ctx).to_string()).collect();
            Value::String(hash_files(Path::new(workspace), &patterns))
        }
    }
}

fn strip_wrapper(source: &str) -> &str {
    source
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(source)
}

/// A job, step or artifact `if:` condition.
///
/// Without a status function the expression is implicitly `success() && (expr)`;
/// an absent condition is just `success()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    expr: Option<Expression>,
}

impl Condition {
    pub fn parse(source: Option<&str>) -> Result<Self, ExprError> {
        let expr = source.map(Expression::parse).transpose()?;
        Ok(Self { expr })
    }

    pub fn references_status(&self) -> bool {
        self.expr.as_ref().is_some_and(Expression::references_status)
    }

    pub fn evaluate(&self, ctx: &ExprContext) -> bool {
        match &self.expr {
            None => ctx.status.success(),
            Some(expr) if expr.references_status() => expr.evaluate(ctx).is_truthy(),
            Some(expr) => ctx.status.success() && expr.evaluate(ctx).is_truthy(),
        }
    }
}

/// Outcome of earlier work as seen by status functions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusView {
    pub failed: bool,
    pub cancelled: bool,
}

impl StatusView {
    pub fn success(&self) -> bool {
        !self.failed && !self.cancelled
    }
}

#[derive(Debug, Clone, Default)]
pub struct NeedsEntry {
    pub result: String,
    pub outputs: EnvMap,
}

#[derive(Debug, Clone, Default)]
pub struct StepEntry {
    pub outcome: String,
    pub outputs: EnvMap,
}

/// Values visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct ExprContext {
    pub run: EnvMap,
    pub trigger: serde_json::Map<String, serde_json::Value>,
    pub inputs: EnvMap,
    pub env: EnvMap,
    pub matrix: MatrixAssignment,
    pub needs: IndexMap<String, NeedsEntry>,
    pub steps: IndexMap<String, StepEntry>,
    pub job: EnvMap,
    pub status: StatusView,
}

impl ExprContext {
    fn lookup(&self, root: Root, segments: &[String]) -> Value {
        let string = |map: &EnvMap| match segments {
            [key] => map.get(key).map_or(Value::Null, |v| Value::String(v.clone())),
            _ => Value::Null,
        };

        match root {
            Root::Run => string(&self.run),
            Root::Inputs => string(&self.inputs),
            Root::Env => string(&self.env),
            Root::Job => string(&self.job),
            Root::Trigger => match segments.split_first() {
                Some((first, rest)) => json_path(self.trigger.get(first), rest),
                None => Value::Null,
            },
            Root::Matrix => match segments.split_first() {
                Some((first, rest)) => json_path(self.matrix.get(first), rest),
                None => Value::Null,
            },
            Root::Needs => match segments {
                [job, field] if field == "result" => self
                    .needs
                    .get(job)
                    .map_or(Value::Null, |n| Value::String(n.result.clone())),
                [job, field, key] if field == "outputs" => self
                    .needs
                    .get(job)
                    .and_then(|n| n.outputs.get(key))
                    .map_or(Value::Null, |v| Value::String(v.clone())),
                _ => Value::Null,
            },
            Root::Steps => match segments {
                [step, field] if field == "outcome" || field == "conclusion" => self
                    .steps
                    .get(step)
                    .map_or(Value::Null, |s| Value::String(s.outcome.clone())),
                [step, field, key] if field == "outputs" => self
                    .steps
                    .get(step)
                    .and_then(|s| s.outputs.get(key))
                    .map_or(Value::Null, |v| Value::String(v.clone())),
                _ => Value::Null,
            },
        }
    }
}

fn json_path(start: Option<&serde_json::Value>, rest: &[String]) -> Value {
    let mut current = match start {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        current = match current {
            serde_json::Value::Object(map) => match map.get(segment) {
                Some(next) => next,
                None => return Value::Null,
            },
            serde_json::Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    Value::from_json(current)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Not,
    And,
    Or,
    Eq,
    Ne,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Str(s) => format!("string '{s}'"),
            Token::Number(n) => format!("number {n}"),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::Not => "'!'".to_string(),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Eq => "'=='".to_string(),
            Token::Ne => "'!='".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, ch)) = chars.peek() {
        let single = match ch {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            '.' => Some(Token::Dot),
            _ => None,
        };
        if let Some(token) = single {
            chars.next();
            tokens.push(token);
            continue;
        }

        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' | '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == ch => tokens.push(match ch {
                        '=' => Token::Eq,
                        '&' => Token::And,
                        _ => Token::Or,
                    }),
                    _ => return Err(ExprError::UnexpectedChar { ch, offset }),
                }
            }
            '\'' | '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        // A doubled quote is an escaped quote.
                        Some((_, c)) if c == ch => {
                            if matches!(chars.peek(), Some(&(_, next)) if next == ch) {
                                chars.next();
                                value.push(ch);
                            } else {
                                break;
                            }
                        }
                        Some((_, c)) => value.push(c),
                        None => return Err(ExprError::UnterminatedString(offset)),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' || (c == '-' && text.is_empty()) {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, offset }),
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

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExprError::UnexpectedToken {
                found: token.describe(),
                expected: expected.describe(),
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn parse_or(&mut self) -> Result<Expression, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ExprError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expression::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, ExprError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_primary()?;
        Ok(Expression::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_primary(&mut self) -> Result<Expression, ExprError> {
        match self.advance() {
            None => Err(ExprError::UnexpectedEnd),
            Some(Token::Str(s)) => Ok(Expression::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expression::Literal(Value::Number(n))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expression::Literal(Value::Bool(true))),
                "false" => Ok(Expression::Literal(Value::Bool(false))),
                "null" => Ok(Expression::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => self.parse_call(name),
                _ => self.parse_path(name),
            },
            Some(other) => Err(ExprError::UnexpectedToken {
                found: other.describe(),
                expected: "a value".to_string(),
            }),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expression, ExprError> {
        let function =
            Function::from_name(&name).ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
        } else {
            loop {
                args.push(self.parse_or()?);
                match self.advance() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    Some(token) => {
                        return Err(ExprError::UnexpectedToken {
                            found: token.describe(),
                            expected: "',' or ')'".to_string(),
                        });
                    }
                    None => return Err(ExprError::UnexpectedEnd),
                }
            }
        }

        let accepted = match function.arity() {
            Some(n) => args.len() == n,
            None => !args.is_empty(),
        };
        if !accepted {
            return Err(ExprError::Arity {
                name,
                expected: function.arity().unwrap_or(1),
                found: args.len(),
            });
        }
        Ok(Expression::Call { function, args })
    }

    fn parse_path(&mut self, name: String) -> Result<Expression, ExprError> {
        let root = Root::from_name(&name).ok_or(ExprError::UnknownContext(name))?;
        let mut segments = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(segment)) => segments.push(segment),
                        Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            segments.push((n as u64).to_string())
                        }
                        Some(token) => {
                            return Err(ExprError::UnexpectedToken {
                                found: token.describe(),
                                expected: "a property name".to_string(),
                            });
                        }
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Str(segment)) => segments.push(segment),
                        Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                            segments.push((n as u64).to_string())
                        }
                        Some(token) => {
                            return Err(ExprError::UnexpectedToken {
                                found: token.describe(),
                                expected: "a string index".to_string(),
                            });
                        }
                        None => return Err(ExprError::UnexpectedEnd),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expression::Path { root, segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> ExprContext {
        let mut ctx = ExprContext::default();
        ctx.env.insert("TARGET".into(), "release".into());
        ctx.matrix.insert("node".into(), serde_json::json!(18));
        ctx.matrix.insert("os".into(), serde_json::json!("linux"));
        ctx.trigger.insert("ref".into(), serde_json::json!("refs/heads/main"));
        ctx.needs.insert(
            "build".into(),
            NeedsEntry {
                result: "success".into(),
                outputs: [("version".to_string(), "1.2.3".to_string())].into_iter().collect(),
            },
        );
        ctx
    }

    fn eval(source: &str, ctx: &ExprContext) -> Value {
        Expression::parse(source).unwrap().evaluate(ctx)
    }

    #[test]
    fn test_precedence() {
        let expr = Expression::parse("true || false && false").unwrap();
        assert!(matches!(expr, Expression::Or(..)));
        assert_eq!(eval("!false && true", &ctx()), Value::Bool(true));
        assert_eq!(eval("(true || false) && false", &ctx()), Value::Bool(false));
    }

    #[test]
    fn test_paths_and_equality() {
        let ctx = ctx();
        assert_eq!(eval("matrix.node == 18", &ctx), Value::Bool(true));
        assert_eq!(eval("matrix.node == '18'", &ctx), Value::Bool(true));
        assert_eq!(eval("matrix['os'] != 'windows'", &ctx), Value::Bool(true));
        assert_eq!(eval("env.TARGET", &ctx), Value::String("release".into()));
        assert_eq!(eval("needs.build.outputs.version", &ctx).to_string(), "1.2.3");
        assert_eq!(eval("needs.build.result == 'success'", &ctx), Value::Bool(true));
        assert_eq!(eval("env.MISSING", &ctx), Value::Null);
    }

    #[test]
    fn test_string_functions() {
        let ctx = ctx();
        assert_eq!(eval("startsWith(trigger.ref, 'refs/heads/')", &ctx), Value::Bool(true));
        assert_eq!(eval("endsWith(trigger.ref, 'main')", &ctx), Value::Bool(true));
        assert_eq!(eval("contains(env.TARGET, 'lea')", &ctx), Value::Bool(true));
    }

    #[test]
    fn test_hash_files_reads_job_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();
        let mut ctx = ctx();
        ctx.job.insert("workspace".into(), dir.path().display().to_string());

        let hash = eval("hashFiles('**/package-lock.json', '**/yarn.lock')", &ctx).to_string();
        assert_eq!(hash.len(), 64);
        assert_eq!(eval("hashFiles('*.json')", &ctx).to_string(), hash);
        assert_eq!(eval("hashFiles('*.toml')", &ctx), Value::String(String::new()));
        assert!(!Condition::parse(Some("hashFiles('x') != ''")).unwrap().references_status());

        ctx.job.clear();
        assert_eq!(eval("hashFiles('*.json')", &ctx), Value::String(String::new()));
    }

    #[test]
    fn test_or_returns_operand() {
        assert_eq!(eval("inputs.tag || 'latest'", &ctx()).to_string(), "latest");
    }

    #[test]
    fn test_wrapper_is_stripped() {
        assert_eq!(eval("${{ matrix.os }}", &ctx()).to_string(), "linux");
    }

    #[test]
    fn test_implicit_success() {
        let mut ctx = ctx();
        let plain = Condition::parse(Some("matrix.os == 'linux'")).unwrap();
        let always = Condition::parse(Some("always()")).unwrap();
        let failure = Condition::parse(Some("failure()")).unwrap();
        let absent = Condition::parse(None).unwrap();

        assert!(plain.evaluate(&ctx));
        assert!(absent.evaluate(&ctx));
        assert!(!failure.evaluate(&ctx));

        ctx.status.failed = true;
        assert!(!plain.evaluate(&ctx));
        assert!(!absent.evaluate(&ctx));
        assert!(always.evaluate(&ctx));
        assert!(failure.evaluate(&ctx));

        assert!(!plain.references_status());
        assert!(!absent.references_status());
        assert!(Condition::parse(Some("!cancelled() && env.X"))
            .unwrap()
            .references_status());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Expression::parse("  "), Err(ExprError::Empty));
        assert_eq!(
            Expression::parse("secrets.TOKEN"),
            Err(ExprError::UnknownContext("secrets".into()))
        );
        assert_eq!(
            Expression::parse("toJSON(env)"),
            Err(ExprError::UnknownFunction("toJSON".into()))
        );
        assert!(matches!(
            Expression::parse("contains('a')"),
            Err(ExprError::Arity { expected: 2, found: 1, .. })
        ));
        assert!(matches!(
            Expression::parse("hashFiles()"),
            Err(ExprError::Arity { expected: 1, found: 0, .. })
        ));
        assert!(matches!(
            Expression::parse("'open"),
            Err(ExprError::UnterminatedString(0))
        ));
        assert!(matches!(
            Expression::parse("a = b"),
            Err(ExprError::UnknownContext(_)) | Err(ExprError::UnexpectedChar { .. })
        ));
        assert!(matches!(
            Expression::parse("env.A env.B"),
            Err(ExprError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn test_number_rendering() {
        assert_eq!(Value::Number(18.0).to_string(), "18");
        assert_eq!(Value::Number(1.5).to_string(), "1.5");
        assert_eq!(Value::Null.to_string(), "");
    }
}
