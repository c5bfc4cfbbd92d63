//! Expression evaluator
//!
//! Evaluates the expressions embedded in `{{ }}`, `if`, `foreach` and subview
//! arguments against a JSON data dictionary. The syntax is a small host-flavoured
//! subset: `$vars`, `->` and `[]` access, arithmetic, `.` concatenation,
//! comparisons, `&&`/`||`, `??`, ternaries and calls to host functions.
//!
//! Evaluation faults (undefined variables, bad operands, ...) are reported as
//! [`EvalError`]s; the renderer attaches line information.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A data dictionary: string keys, JSON values
pub type Dictionary = Map<String, Value>;

/// A host function callable from templates
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("syntax error, {message} at column {column}")]
pub struct SyntaxError {
    pub message: String,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("Undefined variable ${0}")]
    UndefinedVariable(String),

    #[error("Undefined array key \"{0}\"")]
    UndefinedKey(String),

    #[error("Undefined property: {0}")]
    UndefinedProperty(String),

    #[error("Attempt to read property \"{name}\" on {found}")]
    PropertyOnScalar { name: String, found: &'static str },

    #[error("Cannot access offset on value of type {0}")]
    IndexOnScalar(&'static str),

    #[error("Unsupported operand types: {left} {op} {right}")]
    UnsupportedOperands {
        left: &'static str,
        op: BinaryOp,
        right: &'static str,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Call to undefined function {0}()")]
    UndefinedFunction(String),

    #[error("{function}() expects {expected}")]
    BadArguments {
        function: String,
        expected: &'static str,
    },

    #[error("Array to string conversion")]
    ArrayToString,

    #[error("foreach() argument must be of type array|object, {0} given")]
    NotIterable(&'static str),

    #[error("{0}")]
    Host(String),
}

impl EvalError {
    /// Faults that `isset`, `empty` and `??` treat as "not set"
    fn is_missing(&self) -> bool {
        matches!(
            self,
            EvalError::UndefinedVariable(_)
                | EvalError::UndefinedKey(_)
                | EvalError::UndefinedProperty(_)
                | EvalError::PropertyOnScalar { .. }
                | EvalError::IndexOnScalar(_)
        )
    }
}

// --- AST ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Literal { value: Value },
    Var { name: String },
    Array { items: Vec<ArrayItem> },
    Property { base: Box<Expr>, name: String },
    Index { base: Box<Expr>, index: Box<Expr> },
    Call { function: String, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Ternary {
        condition: Box<Expr>,
        then: Option<Box<Expr>>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayItem {
    #[serde(default)]
    pub key: Option<Expr>,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Identical,
    NotIdentical,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Coalesce,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => ".",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Identical => "===",
            BinaryOp::NotIdentical => "!==",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Coalesce => "??",
        };
        f.write_str(symbol)
    }
}

/// Header of a `foreach`: `source as $value` or `source as $key => $value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopHeader {
    pub source: Expr,
    pub key: Option<String>,
    pub value: String,
}

// --- Lexer ---

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Var(String),
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Punct(&'static str),
}

const PUNCTS: &[&str] = &[
    "===", "!==", "=>", "->", "==", "!=", "<=", ">=", "&&", "||", "??", "<", ">", "!", "+", "-",
    "*", "/", "%", ".", "?", ":", "(", ")", "[", "]", ",",
];

fn lex(src: &str) -> Result<Vec<(Tok, usize)>, SyntaxError> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut i = 0;

    let err = |message: String, column: usize| SyntaxError { message, column };

    while i < chars.len() {
        let (pos, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '$' {
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && is_ident_char(chars[j].1, j == start) {
                j += 1;
            }
            if j == start {
                return Err(err("unexpected '$'".into(), pos + 1));
            }
            let name: String = chars[start..j].iter().map(|(_, c)| c).collect();
            tokens.push((Tok::Var(name), pos));
            i = j;
            continue;
        }

        if is_ident_char(c, true) {
            let mut j = i;
            while j < chars.len() && is_ident_char(chars[j].1, j == i) {
                j += 1;
            }
            let name: String = chars[i..j].iter().map(|(_, c)| c).collect();
            tokens.push((Tok::Ident(name), pos));
            i = j;
            continue;
        }

        if c.is_ascii_digit() {
            let mut j = i;
            while j < chars.len() && chars[j].1.is_ascii_digit() {
                j += 1;
            }
            let is_float = j + 1 < chars.len() && chars[j].1 == '.' && chars[j + 1].1.is_ascii_digit();
            if is_float {
                j += 1;
                while j < chars.len() && chars[j].1.is_ascii_digit() {
                    j += 1;
                }
            }
            let text: String = chars[i..j].iter().map(|(_, c)| c).collect();
            let tok = if is_float {
                text.parse::<f64>().map(Tok::Float).ok()
            } else {
                text.parse::<i64>().map(Tok::Int).ok()
            };
            let tok = tok.ok_or_else(|| err(format!("invalid number '{}'", text), pos + 1))?;
            tokens.push((tok, pos));
            i = j;
            continue;
        }

        if c == '"' || c == '\'' {
            let mut j = i + 1;
            let mut value = String::new();
            let mut closed = false;
            while j < chars.len() {
                let ch = chars[j].1;
                if ch == c {
                    closed = true;
                    j += 1;
                    break;
                }
                if ch == '\\' && j + 1 < chars.len() {
                    let next = chars[j + 1].1;
                    match (c, next) {
                        (_, '\\') => value.push('\\'),
                        (q, n) if n == q => value.push(q),
                        ('"', 'n') => value.push('\n'),
                        ('"', 't') => value.push('\t'),
                        ('"', '$') => value.push('$'),
                        (_, other) => {
                            value.push('\\');
                            value.push(other);
                        }
                    }
                    j += 2;
                    continue;
                }
                value.push(ch);
                j += 1;
            }
            if !closed {
                return Err(err("unterminated string".into(), pos + 1));
            }
            tokens.push((Tok::Str(value), pos));
            i = j;
            continue;
        }

        let rest = &src[pos..];
        match PUNCTS.iter().find(|p| rest.starts_with(**p)) {
            Some(p) => {
                tokens.push((Tok::Punct(*p), pos));
                i += p.chars().count();
            }
            None => return Err(err(format!("unexpected '{}'", c), pos + 1)),
        }
    }

    Ok(tokens)
}

fn is_ident_char(c: char, first: bool) -> bool {
    c == '_' || c.is_alphabetic() || (!first && c.is_ascii_digit())
}

// --- Parser ---

/// Recursive-descent parser over the expression token stream.
///
/// Exposed to the crate so directive parsers can combine expressions with the
/// `as` / `=>` binding forms.
pub(crate) struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
    len: usize,
}

impl Parser {
    pub(crate) fn new(src: &str) -> Result<Self, SyntaxError> {
        Ok(Self {
            tokens: lex(src)?,
            pos: 0,
            len: src.len(),
        })
    }

    pub(crate) fn peek_nth(&self, n: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + n).map(|(t, _)| t)
    }

    fn peek(&self) -> Option<&Tok> {
        self.peek_nth(0)
    }

    pub(crate) fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn column(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.len, |(_, p)| *p) + 1
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            message: message.into(),
            column: self.column(),
        }
    }

    fn unexpected(&self) -> SyntaxError {
        match self.peek() {
            Some(tok) => self.error(format!("unexpected {}", describe(tok))),
            None => self.error("unexpected end of expression"),
        }
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Some(Tok::Punct(q)) if *q == p)
    }

    pub(crate) fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), SyntaxError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(name)) if name.eq_ignore_ascii_case(kw))
    }

    pub(crate) fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_var(&mut self) -> Result<String, SyntaxError> {
        match self.peek() {
            Some(Tok::Var(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    pub(crate) fn finish(&self) -> Result<(), SyntaxError> {
        if self.pos < self.tokens.len() {
            Err(self.unexpected())
        } else {
            Ok(())
        }
    }

    pub(crate) fn expr(&mut self) -> Result<Expr, SyntaxError> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<Expr, SyntaxError> {
        let condition = self.coalesce()?;
        if !self.eat_punct("?") {
            return Ok(condition);
        }
        let then = if self.eat_punct(":") {
            None
        } else {
            let then = self.ternary()?;
            self.expect_punct(":")?;
            Some(Box::new(then))
        };
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then,
            otherwise: Box::new(otherwise),
        })
    }

    fn coalesce(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.or()?;
        if self.eat_punct("??") {
            let right = self.coalesce()?;
            return Ok(binary(BinaryOp::Coalesce, left, right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and()?;
        while self.eat_punct("||") || self.eat_keyword("or") {
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.equality()?;
        while self.eat_punct("&&") || self.eat_keyword("and") {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.comparison()?;
        loop {
            let op = if self.eat_punct("===") {
                BinaryOp::Identical
            } else if self.eat_punct("!==") {
                BinaryOp::NotIdentical
            } else if self.eat_punct("==") {
                BinaryOp::Eq
            } else if self.eat_punct("!=") {
                BinaryOp::Ne
            } else {
                return Ok(left);
            };
            let right = self.comparison()?;
            left = binary(op, left, right);
        }
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.concat()?;
        loop {
            let op = if self.eat_punct("<=") {
                BinaryOp::Le
            } else if self.eat_punct(">=") {
                BinaryOp::Ge
            } else if self.eat_punct("<") {
                BinaryOp::Lt
            } else if self.eat_punct(">") {
                BinaryOp::Gt
            } else {
                return Ok(left);
            };
            let right = self.concat()?;
            left = binary(op, left, right);
        }
    }

    fn concat(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.additive()?;
        while self.eat_punct(".") {
            let right = self.additive()?;
            left = binary(BinaryOp::Concat, left, right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_punct("+") {
                BinaryOp::Add
            } else if self.eat_punct("-") {
                BinaryOp::Sub
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_punct("*") {
                BinaryOp::Mul
            } else if self.eat_punct("/") {
                BinaryOp::Div
            } else if self.eat_punct("%") {
                BinaryOp::Mod
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_punct("!") {
            let expr = self.unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(expr) });
        }
        if self.eat_punct("-") {
            let expr = self.unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Neg, expr: Box::new(expr) });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct("->") {
                let name = match self.bump() {
                    Some(Tok::Ident(name)) => name,
                    _ => {
                        self.pos = self.pos.saturating_sub(1);
                        return Err(self.unexpected());
                    }
                };
                expr = Expr::Property { base: Box::new(expr), name };
            } else if self.eat_punct("[") {
                let index = self.expr()?;
                self.expect_punct("]")?;
                expr = Expr::Index { base: Box::new(expr), index: Box::new(index) };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let Some(tok) = self.peek().cloned() else {
            return Err(self.unexpected());
        };
        match tok {
            Tok::Var(name) => {
                self.pos += 1;
                Ok(Expr::Var { name })
            }
            Tok::Int(i) => {
                self.pos += 1;
                Ok(literal(Value::from(i)))
            }
            Tok::Float(f) => {
                self.pos += 1;
                Ok(literal(Number::from_f64(f).map_or(Value::Null, Value::Number)))
            }
            Tok::Str(s) => {
                self.pos += 1;
                Ok(literal(Value::String(s)))
            }
            Tok::Punct("(") => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Tok::Punct("[") => {
                self.pos += 1;
                self.array_items("]")
            }
            Tok::Ident(name) => {
                self.pos += 1;
                match name.to_ascii_lowercase().as_str() {
                    "true" => return Ok(literal(Value::Bool(true))),
                    "false" => return Ok(literal(Value::Bool(false))),
                    "null" => return Ok(literal(Value::Null)),
                    _ => {}
                }
                if !self.eat_punct("(") {
                    self.pos -= 1;
                    return Err(self.unexpected());
                }
                if name.eq_ignore_ascii_case("array") {
                    return self.array_items(")");
                }
                let mut args = Vec::new();
                if !self.eat_punct(")") {
                    loop {
                        args.push(self.expr()?);
                        if self.eat_punct(")") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Call { function: name, args })
            }
            Tok::Punct(_) => Err(self.unexpected()),
        }
    }

    fn array_items(&mut self, close: &str) -> Result<Expr, SyntaxError> {
        let mut items = Vec::new();
        while !self.eat_punct(close) {
            let first = self.expr()?;
            let item = if self.eat_punct("=>") {
                ArrayItem { key: Some(first), value: self.expr()? }
            } else {
                ArrayItem { key: None, value: first }
            };
            items.push(item);
            if !self.eat_punct(",") {
                self.expect_punct(close)?;
                break;
            }
        }
        Ok(Expr::Array { items })
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Var(name) => format!("variable ${}", name),
        Tok::Ident(name) => format!("identifier '{}'", name),
        Tok::Int(i) => format!("integer {}", i),
        Tok::Float(f) => format!("number {}", f),
        Tok::Str(_) => "string".to_string(),
        Tok::Punct(p) => format!("'{}'", p),
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
}

fn literal(value: Value) -> Expr {
    Expr::Literal { value }
}

/// Parse a complete expression
pub fn parse(src: &str) -> Result<Expr, SyntaxError> {
    let mut parser = Parser::new(src)?;
    let expr = parser.expr()?;
    parser.finish()?;
    Ok(expr)
}

/// Parse a `foreach` header
pub fn parse_loop_header(src: &str) -> Result<LoopHeader, SyntaxError> {
    let mut parser = Parser::new(src)?;
    let source = parser.expr()?;
    if !parser.eat_keyword("as") {
        return Err(parser.error("expecting 'as'"));
    }
    let first = parser.expect_var()?;
    let header = if parser.eat_punct("=>") {
        let value = parser.expect_var()?;
        LoopHeader { source, key: Some(first), value }
    } else {
        LoopHeader { source, key: None, value: first }
    };
    parser.finish()?;
    Ok(header)
}

// --- Runtime ---

/// Variable scopes for one render call (innermost last)
#[derive(Debug, Clone)]
pub struct Scope {
    scopes: Vec<Dictionary>,
}

impl Scope {
    pub fn new(data: Dictionary) -> Self {
        Self { scopes: vec![data] }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    /// Set a variable in the innermost scope
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    pub fn push(&mut self) {
        self.scopes.push(Dictionary::new());
    }

    pub fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Collapse all scopes into one dictionary, inner scopes winning
    pub fn flatten(&self) -> Dictionary {
        let mut data = Dictionary::new();
        for scope in &self.scopes {
            for (k, v) in scope {
                data.insert(k.clone(), v.clone());
            }
        }
        data
    }
}

/// Registry of host functions
#[derive(Clone, Default)]
pub struct Functions {
    fns: HashMap<String, HostFn>,
}

impl fmt::Debug for Functions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.fns.keys().collect();
        names.sort();
        f.debug_struct("Functions").field("names", &names).finish()
    }
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Arc::new(f));
    }

    fn get(&self, name: &str) -> Option<&HostFn> {
        self.fns.get(name)
    }
}

/// Expression evaluator
pub struct Evaluator<'a> {
    scope: &'a Scope,
    functions: &'a Functions,
}

impl<'a> Evaluator<'a> {
    pub fn new(scope: &'a Scope, functions: &'a Functions) -> Self {
        Self { scope, functions }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal { value } => Ok(value.clone()),
            Expr::Var { name } => self
                .scope
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
            Expr::Array { items } => self.eval_array(items),
            Expr::Property { base, name } => {
                let base = self.eval(base)?;
                match base {
                    Value::Object(map) => map
                        .get(name)
                        .cloned()
                        .ok_or_else(|| EvalError::UndefinedProperty(name.clone())),
                    other => Err(EvalError::PropertyOnScalar {
                        name: name.clone(),
                        found: type_name(&other),
                    }),
                }
            }
            Expr::Index { base, index } => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                index_value(base, &index)
            }
            Expr::Call { function, args } => self.eval_call(function, args),
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                    UnaryOp::Neg => match to_number(&value) {
                        Some(Num::Int(i)) => Ok(i.checked_neg().map_or_else(|| float(-(i as f64)), Value::from)),
                        Some(Num::Float(f)) => Ok(float(-f)),
                        None => Err(EvalError::UnsupportedOperands {
                            left: "int",
                            op: BinaryOp::Sub,
                            right: type_name(&value),
                        }),
                    },
                }
            }
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
            Expr::Ternary { condition, then, otherwise } => {
                let cond = self.eval(condition)?;
                if is_truthy(&cond) {
                    match then {
                        Some(then) => self.eval(then),
                        None => Ok(cond),
                    }
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    /// Evaluate, treating missing variables/keys as `None`
    fn eval_lenient(&self, expr: &Expr) -> Result<Option<Value>, EvalError> {
        match self.eval(expr) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_missing() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn eval_array(&self, items: &[ArrayItem]) -> Result<Value, EvalError> {
        if items.iter().all(|item| item.key.is_none()) {
            let values: Result<Vec<_>, _> = items.iter().map(|item| self.eval(&item.value)).collect();
            return Ok(Value::Array(values?));
        }
        let mut map = Dictionary::new();
        let mut next_index = 0usize;
        for item in items {
            let key = match &item.key {
                Some(key) => to_output(&self.eval(key)?)?,
                None => {
                    let key = next_index.to_string();
                    next_index += 1;
                    key
                }
            };
            map.insert(key, self.eval(&item.value)?);
        }
        Ok(Value::Object(map))
    }

    fn eval_binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value, EvalError> {
        match op {
            BinaryOp::And => {
                let l = is_truthy(&self.eval(left)?);
                return Ok(Value::Bool(l && is_truthy(&self.eval(right)?)));
            }
            BinaryOp::Or => {
                let l = is_truthy(&self.eval(left)?);
                return Ok(Value::Bool(l || is_truthy(&self.eval(right)?)));
            }
            BinaryOp::Coalesce => {
                return match self.eval_lenient(left)? {
                    Some(value) if !value.is_null() => Ok(value),
                    _ => self.eval(right),
                };
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;

        match op {
            BinaryOp::Concat => Ok(Value::String(format!("{}{}", to_output(&l)?, to_output(&r)?))),
            BinaryOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
            BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
            BinaryOp::Identical => Ok(Value::Bool(l == r)),
            BinaryOp::NotIdentical => Ok(Value::Bool(l != r)),
            BinaryOp::Lt => Ok(Value::Bool(compare(&l, &r).map_or(false, |o| o.is_lt()))),
            BinaryOp::Le => Ok(Value::Bool(compare(&l, &r).map_or(false, |o| o.is_le()))),
            BinaryOp::Gt => Ok(Value::Bool(compare(&l, &r).map_or(false, |o| o.is_gt()))),
            BinaryOp::Ge => Ok(Value::Bool(compare(&l, &r).map_or(false, |o| o.is_ge()))),
            _ => arithmetic(op, &l, &r),
        }
    }

    fn eval_call(&self, function: &str, args: &[Expr]) -> Result<Value, EvalError> {
        match function.to_ascii_lowercase().as_str() {
            "isset" => {
                for arg in args {
                    match self.eval_lenient(arg)? {
                        Some(value) if !value.is_null() => continue,
                        _ => return Ok(Value::Bool(false)),
                    }
                }
                return Ok(Value::Bool(!args.is_empty()));
            }
            "empty" => {
                let [arg] = args else {
                    return Err(EvalError::BadArguments {
                        function: function.to_string(),
                        expected: "exactly 1 argument",
                    });
                };
                let value = self.eval_lenient(arg)?;
                return Ok(Value::Bool(value.map_or(true, |v| !is_truthy(&v))));
            }
            _ => {}
        }

        let values: Vec<Value> = args.iter().map(|a| self.eval(a)).collect::<Result<_, _>>()?;

        if let Some(f) = self.functions.get(function) {
            return f(&values).map_err(EvalError::Host);
        }

        call_builtin(function, &values)
            .unwrap_or_else(|| Err(EvalError::UndefinedFunction(function.to_string())))
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
    let bad = |expected: &'static str| -> Result<Value, EvalError> {
        Err(EvalError::BadArguments {
            function: name.to_string(),
            expected,
        })
    };

    let result = match (name.to_ascii_lowercase().as_str(), args) {
        ("count", [Value::Array(a)]) => Ok(Value::from(a.len())),
        ("count", [Value::Object(o)]) => Ok(Value::from(o.len())),
        ("count", _) => bad("an array or object"),
        ("strlen", [v]) => to_output(v).map(|s| Value::from(s.len())),
        ("strtoupper" | "upper", [v]) => to_output(v).map(|s| Value::String(s.to_uppercase())),
        ("strtolower" | "lower", [v]) => to_output(v).map(|s| Value::String(s.to_lowercase())),
        ("ucfirst", [v]) => to_output(v).map(|s| {
            let mut chars = s.chars();
            Value::String(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            })
        }),
        ("trim", [v]) => to_output(v).map(|s| Value::String(s.trim().to_string())),
        ("implode" | "join", [sep, Value::Array(items)]) => {
            let sep = match to_output(sep) {
                Ok(sep) => sep,
                Err(e) => return Some(Err(e)),
            };
            items
                .iter()
                .map(to_output)
                .collect::<Result<Vec<_>, _>>()
                .map(|parts| Value::String(parts.join(&sep)))
        }
        ("implode" | "join", _) => bad("a separator and an array"),
        ("in_array", [needle, Value::Array(items)]) => {
            Ok(Value::Bool(items.iter().any(|item| loose_eq(needle, item))))
        }
        ("in_array", _) => bad("a value and an array"),
        ("array_keys", [Value::Object(o)]) => Ok(Value::Array(o.keys().cloned().map(Value::String).collect())),
        ("array_keys", [Value::Array(a)]) => Ok(Value::Array((0..a.len()).map(Value::from).collect())),
        ("array_keys", _) => bad("an array or object"),
        ("str_repeat", [s, n]) => match (to_output(s), to_number(n)) {
            (Ok(s), Some(Num::Int(n))) if n >= 0 => match usize::try_from(n)
                .ok()
                .and_then(|n| s.len().checked_mul(n).map(|len| (n, len)))
            {
                Some((n, len)) if len <= MAX_REPEAT_BYTES => Ok(Value::String(s.repeat(n))),
                _ => bad("a result shorter than 16 MiB"),
            },
            (Err(e), _) => Err(e),
            _ => bad("a string and a non-negative integer"),
        },
        ("json_encode", [v]) => Ok(Value::String(v.to_string())),
        ("esc_html" | "esc_attr" | "htmlspecialchars", [v]) => to_output(v).map(|s| Value::String(escape_html(&s))),
        (
            "strlen" | "strtoupper" | "upper" | "strtolower" | "lower" | "ucfirst" | "trim" | "json_encode"
            | "esc_html" | "esc_attr" | "htmlspecialchars" | "str_repeat",
            _,
        ) => bad("a different number of arguments"),
        _ => return None,
    };
    Some(result)
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}

fn index_value(base: Value, index: &Value) -> Result<Value, EvalError> {
    match base {
        Value::Array(items) => {
            let position = match to_number(index) {
                Some(Num::Int(i)) if i >= 0 => Some(i as usize),
                _ => None,
            };
            position
                .and_then(|i| items.into_iter().nth(i))
                .ok_or_else(|| EvalError::UndefinedKey(key_text(index)))
        }
        Value::Object(mut map) => map
            .remove(&key_text(index))
            .ok_or_else(|| EvalError::UndefinedKey(key_text(index))),
        Value::String(s) => match to_number(index) {
            Some(Num::Int(i)) if i >= 0 => s
                .chars()
                .nth(i as usize)
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| EvalError::UndefinedKey(i.to_string())),
            _ => Err(EvalError::IndexOnScalar("string")),
        },
        other => Err(EvalError::IndexOnScalar(type_name(&other))),
    }
}

fn key_text(index: &Value) -> String {
    match index {
        Value::String(s) => s.clone(),
        Value::Bool(b) => (*b as i64).to_string(),
        Value::Null => String::new(),
        other => to_output(other).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn to_number(value: &Value) -> Option<Num> {
    match value {
        Value::Null => Some(Num::Int(0)),
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Number(n) => n
            .as_i64()
            .map(Num::Int)
            .or_else(|| n.as_f64().map(Num::Float)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .map(Num::Int)
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(Num::Float))
        }
        _ => None,
    }
}

/// Largest string `str_repeat` will build
const MAX_REPEAT_BYTES: usize = 16 * 1024 * 1024;

fn float(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    let unsupported = || EvalError::UnsupportedOperands {
        left: type_name(l),
        op,
        right: type_name(r),
    };
    let (a, b) = match (to_number(l), to_number(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(unsupported()),
    };

    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Div if y == 0 => return Err(EvalError::DivisionByZero),
            BinaryOp::Div if x.checked_rem(y) == Some(0) => x.checked_div(y),
            BinaryOp::Div => None,
            BinaryOp::Mod if y == 0 => return Err(EvalError::DivisionByZero),
            BinaryOp::Mod => x.checked_rem(y),
            _ => return Err(unsupported()),
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    let v = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div if y == 0.0 => return Err(EvalError::DivisionByZero),
        BinaryOp::Div => x / y,
        BinaryOp::Mod => {
            let (xi, yi) = (x as i64, y as i64);
            if yi == 0 {
                return Err(EvalError::DivisionByZero);
            }
            // i64::MIN % -1 overflows; the remainder is 0
            return Ok(Value::from(xi.checked_rem(yi).unwrap_or(0)));
        }
        _ => return Err(unsupported()),
    };
    Ok(float(v))
}

/// Loose equality, comparing numerically when both sides look numeric
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, other) | (other, Value::Null) => !is_truthy(other),
        (Value::Bool(x), other) | (other, Value::Bool(x)) => *x == is_truthy(other),
        (Value::String(x), Value::String(y)) => match (to_number(a), to_number(b)) {
            (Some(n), Some(m)) => n.as_f64() == m.as_f64(),
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| loose_eq(p, q))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map_or(false, |w| loose_eq(v, w)))
        }
        _ => match (to_number(a), to_number(b)) {
            (Some(n), Some(m)) => n.as_f64() == m.as_f64(),
            _ => false,
        },
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) if to_number(a).is_none() || to_number(b).is_none() => Some(x.cmp(y)),
        _ => {
            let (n, m) = (to_number(a)?, to_number(b)?);
            n.as_f64().partial_cmp(&m.as_f64())
        }
    }
}

/// Truthiness: null, false, 0, 0.0, "", "0" and empty collections are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert a value to output text
pub fn to_output(value: &Value) -> Result<String, EvalError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(true) => Ok("1".to_string()),
        Value::Bool(false) => Ok(String::new()),
        Value::Number(n) => Ok(match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (None, Some(u), _) => u.to_string(),
            (None, None, Some(f)) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
                format!("{}", f as i64)
            }
            (None, None, Some(f)) => f.to_string(),
            _ => n.to_string(),
        }),
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Err(EvalError::ArrayToString),
    }
}

/// Key/value pairs a `foreach` walks over
pub fn iterate(value: &Value) -> Result<Vec<(Value, Value)>, EvalError> {
    match value {
        Value::Array(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i), v.clone()))
            .collect()),
        Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), v.clone()))
            .collect()),
        other => Err(EvalError::NotIterable(type_name(other))),
    }
}
