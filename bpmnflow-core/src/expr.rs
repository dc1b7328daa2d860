//! Expression evaluation for mappings and sequence conditions.
//!
//! The engine only depends on the [`Evaluator`] trait. [`ContextExpr`] is the
//! built-in evaluator, a small FEEL-flavoured language:
//!
//! - literals: `42`, `-1.5`, `"text"`, `'text'`, `true`, `false`, `null`
//! - paths: `order.total` (missing segments evaluate to `null`)
//! - arithmetic: `+ - * /` (`+` also concatenates strings)
//! - comparison: `== != > >= < <=` (`=` is accepted as equality)
//! - logic: `and`, `or`, `not` and `&&`, `||`, `!`
//! - grouping: `(expr)`
//! - context literals: `{ total: price * qty, "currency": "EUR" }`
//! - lists: `[a, b, 3]`
//!
//! Examples:
//! - `amount > 100 and approved`
//! - `{ order: order, priority: score >= 7 }`

use crate::error::CoreError;
use parking_lot::RwLock;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Pluggable expression evaluator.
///
/// Implementations must be a pure function of `(expression, ctx)`.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, ctx: &Value) -> Result<Value, CoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Context(Vec<(String, Expr)>),
    List(Vec<Expr>),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(bad("empty expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(bad(format!(
                "unexpected input at offset {}: '{}'",
                parser.pos,
                &parser.input[parser.pos..]
            )));
        }
        Ok(expr)
    }

    /// Evaluates the expression against a context.
    pub fn evaluate(&self, ctx: &Value) -> Result<Value, CoreError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(parts) => Ok(get_path(ctx, parts)),
            Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!is_truthy(&inner.evaluate(ctx)?))),
            Expr::Unary(UnaryOp::Neg, inner) => {
                let v = inner.evaluate(ctx)?;
                match as_f64(&v) {
                    Some(n) => Ok(number(-n)),
                    None => Err(bad(format!("cannot negate {}", v))),
                }
            }
            Expr::Binary(BinaryOp::And, left, right) => {
                if !is_truthy(&left.evaluate(ctx)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(ctx)?)))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if is_truthy(&left.evaluate(ctx)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&right.evaluate(ctx)?)))
            }
            Expr::Binary(op, left, right) => {
                let l = left.evaluate(ctx)?;
                let r = right.evaluate(ctx)?;
                binary(*op, &l, &r)
            }
            Expr::Context(entries) => {
                let mut map = Map::new();
                for (key, expr) in entries {
                    map.insert(key.clone(), expr.evaluate(ctx)?);
                }
                Ok(Value::Object(map))
            }
            Expr::List(items) => items
                .iter()
                .map(|e| e.evaluate(ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, CoreError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => as_f64(l).zip(as_f64(r)).and_then(|(a, b)| a.partial_cmp(&b)),
            };
            let result = ordering
                .map(|o| match op {
                    BinaryOp::Gt => o.is_gt(),
                    BinaryOp::Ge => o.is_ge(),
                    BinaryOp::Lt => o.is_lt(),
                    _ => o.is_le(),
                })
                .unwrap_or(false);
            Ok(Value::Bool(result))
        }
        BinaryOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => arithmetic(op, l, r),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, l, r),
        BinaryOp::And | BinaryOp::Or => unreachable!("logical operators short-circuit"),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, CoreError> {
    let (a, b) = match as_f64(l).zip(as_f64(r)) {
        Some(pair) => pair,
        None => {
            return Err(bad(format!(
                "arithmetic on non-numeric operands {} and {}",
                l, r
            )))
        }
    };
    let n = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        _ => {
            if b == 0.0 {
                return Err(bad("division by zero"));
            }
            a / b
        }
    };
    Ok(number(n))
}

/// Builds a JSON number, keeping integral results integral.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn get_path(ctx: &Value, parts: &[String]) -> Value {
    let mut current = ctx;
    for part in parts {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }
    current.clone()
}

/// Truthiness used by conditions and logical operators.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        _ => a == b,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn bad(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidExpression {
        reason: reason.into(),
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_whitespace();
            if self.eat_str("||") || self.eat_keyword("or") {
                let right = self.parse_and()?;
                left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_comparison()?;
        loop {
            self.skip_whitespace();
            if self.eat_str("&&") || self.eat_keyword("and") {
                let right = self.parse_comparison()?;
                left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, CoreError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.eat_str("==") {
            BinaryOp::Eq
        } else if self.eat_str("!=") {
            BinaryOp::Ne
        } else if self.eat_str(">=") {
            BinaryOp::Ge
        } else if self.eat_str("<=") {
            BinaryOp::Le
        } else if self.eat_str(">") {
            BinaryOp::Gt
        } else if self.eat_str("<") {
            BinaryOp::Lt
        } else if self.eat_str("=") {
            BinaryOp::Eq
        } else {
            return Ok(left);
        };

        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            self.skip_whitespace();
            let op = if self.eat_str("+") {
                BinaryOp::Add
            } else if self.eat_str("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let op = if self.eat_str("*") {
                BinaryOp::Mul
            } else if self.eat_str("/") {
                BinaryOp::Div
            } else {
                return Ok(left);
            };
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        if self.eat_keyword("not") {
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        if self.peek_char() == Some('-') {
            let next = self.input[self.pos + 1..].chars().next();
            if next.map(|c| c.is_ascii_digit()).unwrap_or(false) {
                return Ok(Expr::Literal(self.parse_number()?));
            }
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.expect(')')?;
                Ok(expr)
            }
            Some('{') => self.parse_context(),
            Some('[') => self.parse_list(),
            Some('"') | Some('\'') => Ok(Expr::Literal(Value::String(self.parse_string()?))),
            Some(c) if c.is_ascii_digit() => Ok(Expr::Literal(self.parse_number()?)),
            Some(c) if is_ident_char(c) => self.parse_path(),
            Some(c) => Err(bad(format!("unexpected character '{}'", c))),
            None => Err(bad("unexpected end of expression")),
        }
    }

    fn parse_context(&mut self) -> Result<Expr, CoreError> {
        self.expect('{')?;
        let mut entries = Vec::new();

        self.skip_whitespace();
        if self.peek_char() == Some('}') {
            self.pos += 1;
            return Ok(Expr::Context(entries));
        }

        loop {
            self.skip_whitespace();
            let key = match self.peek_char() {
                Some('"') | Some('\'') => self.parse_string()?,
                _ => self.parse_ident()?,
            };
            self.expect(':')?;
            let value = self.parse_expr()?;
            entries.push((key, value));

            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some('}') => {
                    self.pos += 1;
                    return Ok(Expr::Context(entries));
                }
                _ => return Err(bad("expected ',' or '}' in context literal")),
            }
        }
    }

    fn parse_list(&mut self) -> Result<Expr, CoreError> {
        self.expect('[')?;
        let mut items = Vec::new();

        self.skip_whitespace();
        if self.peek_char() == Some(']') {
            self.pos += 1;
            return Ok(Expr::List(items));
        }

        loop {
            items.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek_char() {
                Some(',') => self.pos += 1,
                Some(']') => {
                    self.pos += 1;
                    return Ok(Expr::List(items));
                }
                _ => return Err(bad("expected ',' or ']' in list")),
            }
        }
    }

    fn parse_path(&mut self) -> Result<Expr, CoreError> {
        let first = self.parse_ident()?;
        match first.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        let mut parts = vec![first];
        while self.peek_char() == Some('.') {
            self.pos += 1;
            parts.push(self.parse_ident()?);
        }
        Ok(Expr::Path(parts))
    }

    fn parse_ident(&mut self) -> Result<String, CoreError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if is_ident_char(c) {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(bad(format!("expected identifier at offset {}", start)));
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn parse_string(&mut self) -> Result<String, CoreError> {
        let quote = match self.peek_char() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(bad("expected string")),
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                let escaped = self.peek_char().ok_or_else(|| bad("unterminated string"))?;
                self.pos += escaped.len_utf8();
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            } else {
                out.push(c);
            }
        }

        Err(bad("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.peek_char() == Some('.') {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }

        let num_str = &self.input[start..self.pos];
        if !is_float {
            if let Ok(n) = num_str.parse::<i64>() {
                return Ok(Value::Number(Number::from(n)));
            }
        }
        num_str
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| bad(format!("invalid number: '{}'", num_str)))
    }

    fn expect(&mut self, c: char) -> Result<(), CoreError> {
        self.skip_whitespace();
        if self.peek_char() != Some(c) {
            return Err(bad(format!("expected '{}'", c)));
        }
        self.pos += 1;
        Ok(())
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.peek_str(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if !self.peek_str(kw) {
            return false;
        }
        let after = self.input[self.pos + kw.len()..].chars().next();
        if after.map(is_ident_char).unwrap_or(false) {
            return false;
        }
        self.pos += kw.len();
        true
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

/// Built-in evaluator with a parse cache.
#[derive(Default)]
pub struct ContextExpr {
    cache: RwLock<HashMap<String, Arc<Expr>>>,
}

impl ContextExpr {
    pub fn new() -> Self {
        Self::default()
    }

    fn compiled(&self, expression: &str) -> Result<Arc<Expr>, CoreError> {
        if let Some(expr) = self.cache.read().get(expression) {
            return Ok(expr.clone());
        }
        let expr = Arc::new(Expr::parse(expression)?);
        self.cache
            .write()
            .insert(expression.to_string(), expr.clone());
        Ok(expr)
    }
}

impl Evaluator for ContextExpr {
    fn evaluate(&self, expression: &str, ctx: &Value) -> Result<Value, CoreError> {
        self.compiled(expression)?.evaluate(ctx)
    }
}
