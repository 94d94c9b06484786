//! Message selectors.
//!
//! A selector is a boolean expression over message properties in the usual
//! SQL-92 subset: comparisons, `AND`/`OR`/`NOT`, arithmetic, `IS [NOT] NULL`,
//! `[NOT] LIKE`, `[NOT] IN` and `[NOT] BETWEEN`. Evaluation uses three-valued
//! logic; a message matches only when the expression is definitely true.
//!
//! Selectors are parsed once at subscribe time, so a malformed selector is
//! rejected before the subscription exists and dispatch never sees an error.
//!
//! Besides application properties these header names are understood:
//! `JMSMessageID`, `JMSDeliveryMode`, `JMSTimestamp`, `JMSRedelivered`,
//! `JMSXDeliveryCount`.

use std::cmp::Ordering;
use std::fmt;

use crate::broker::message::{Message, PropertyValue};
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

impl From<&PropertyValue> for Value {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::Int(*i),
            PropertyValue::Double(d) => Value::Double(*d),
            PropertyValue::String(s) => Value::Str(s.clone()),
        }
    }
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    fn truth(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Identifier(String),
    Negate(Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Vec<char>,
        escape: Option<char>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Value>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
}

/// A parsed selector.
#[derive(Clone)]
pub struct Selector {
    source: String,
    expr: Expr,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, BrokerError> {
        let invalid = |reason: String| BrokerError::InvalidSelector {
            selector: source.to_string(),
            reason,
        };
        let tokens = tokenize(source).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("empty selector".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr().map_err(invalid)?;
        if let Some(token) = parser.peek() {
            return Err(invalid(format!("unexpected trailing token {token:?}")));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, message: &Message) -> bool {
        eval(&self.expr, message).truth() == Some(true)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Selector").field(&self.source).finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Keyword(&'static str),
    Str(String),
    Int(i64),
    Double(f64),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const KEYWORDS: [&str; 11] = [
    "AND", "OR", "NOT", "IS", "NULL", "LIKE", "IN", "BETWEEN", "TRUE", "FALSE", "ESCAPE",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op("="));
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(match c {
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    _ => "/",
                }));
                i += 1;
            }
            '<' => {
                let op = match chars.get(i + 1) {
                    Some('>') => "<>",
                    Some('=') => "<=",
                    _ => "<",
                };
                i += op.len();
                tokens.push(Token::Op(op));
            }
            '>' => {
                let op = if chars.get(i + 1) == Some(&'=') { ">=" } else { ">" };
                i += op.len();
                tokens.push(Token::Op(op));
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.contains('.') {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| format!("invalid number {text}"))?;
                    tokens.push(Token::Double(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| format!("invalid number {text}"))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let upper = word.to_ascii_uppercase();
                match KEYWORDS.iter().find(|k| **k == upper) {
                    Some(keyword) => tokens.push(Token::Keyword(*keyword)),
                    None => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
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
        self.pos += 1;
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Keyword(k)) if *k == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            other => Err(format!("expected {expected:?}, found {other:?}")),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("OR") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.not_expr()?;
        while self.eat_keyword("AND") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, String> {
        if self.eat_keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Expr, String> {
        let left = self.additive()?;

        if let Some(Token::Op(op)) = self.peek() {
            let op = match *op {
                "=" => Some(CmpOp::Eq),
                "<>" => Some(CmpOp::Ne),
                "<" => Some(CmpOp::Lt),
                "<=" => Some(CmpOp::Le),
                ">" => Some(CmpOp::Gt),
                ">=" => Some(CmpOp::Ge),
                _ => None,
            };
            if let Some(op) = op {
                self.pos += 1;
                let right = self.additive()?;
                return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
            }
        }

        if self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            if !self.eat_keyword("NULL") {
                return Err("expected NULL after IS".to_string());
            }
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("LIKE") {
            let pattern = match self.advance() {
                Some(Token::Str(s)) => s.chars().collect(),
                other => return Err(format!("LIKE expects a string pattern, found {other:?}")),
            };
            let escape = if self.eat_keyword("ESCAPE") {
                match self.advance() {
                    Some(Token::Str(s)) if s.chars().count() == 1 => s.chars().next(),
                    other => return Err(format!("ESCAPE expects one character, found {other:?}")),
                }
            } else {
                None
            };
            return Ok(Expr::Like {
                expr: Box::new(left),
                pattern,
                escape,
                negated,
            });
        }
        if self.eat_keyword("IN") {
            self.expect(Token::LParen)?;
            let mut list = Vec::new();
            loop {
                list.push(match self.advance() {
                    Some(Token::Str(s)) => Value::Str(s),
                    Some(Token::Int(i)) => Value::Int(i),
                    Some(Token::Double(d)) => Value::Double(d),
                    other => return Err(format!("IN expects literals, found {other:?}")),
                });
                match self.advance() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    other => return Err(format!("expected , or ) in IN list, found {other:?}")),
                }
            }
            return Ok(Expr::In {
                expr: Box::new(left),
                list,
                negated,
            });
        }
        if self.eat_keyword("BETWEEN") {
            let low = self.additive()?;
            if !self.eat_keyword("AND") {
                return Err("expected AND in BETWEEN".to_string());
            }
            let high = self.additive()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            });
        }
        if negated {
            return Err("NOT must be followed by LIKE, IN or BETWEEN here".to_string());
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => ArithOp::Add,
                Some(Token::Op("-")) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => ArithOp::Mul,
                Some(Token::Op("/")) => ArithOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Op("-"))) {
            self.pos += 1;
            return Ok(Expr::Negate(Box::new(self.unary()?)));
        }
        if matches!(self.peek(), Some(Token::Op("+"))) {
            self.pos += 1;
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Double(d)) => Ok(Expr::Literal(Value::Double(d))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Keyword("TRUE")) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::Keyword("FALSE")) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Keyword("NULL")) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Identifier(name)),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn header(name: &str, message: &Message) -> Option<Value> {
    Some(match name {
        "JMSMessageID" => Value::Str(message.id.0.clone()),
        "JMSDeliveryMode" => Value::Str(
            if message.is_persistent() {
                "PERSISTENT"
            } else {
                "NON_PERSISTENT"
            }
            .to_string(),
        ),
        "JMSTimestamp" => Value::Int(message.timestamp),
        "JMSRedelivered" => Value::Bool(message.is_redelivered()),
        "JMSXDeliveryCount" => Value::Int(i64::from(message.redelivery_count) + 1),
        _ => return None,
    })
}

fn bool_value(b: Option<bool>) -> Value {
    b.map_or(Value::Null, Value::Bool)
}

fn eval(expr: &Expr, message: &Message) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Identifier(name) => header(name, message)
            .or_else(|| message.property(name).map(Value::from))
            .unwrap_or(Value::Null),
        Expr::Negate(inner) => match eval(inner, message) {
            Value::Int(i) => Value::Int(-i),
            Value::Double(d) => Value::Double(-d),
            _ => Value::Null,
        },
        Expr::Arith(op, l, r) => arith(*op, eval(l, message), eval(r, message)),
        Expr::Compare(op, l, r) => bool_value(compare(*op, &eval(l, message), &eval(r, message))),
        Expr::Not(inner) => bool_value(eval(inner, message).truth().map(|b| !b)),
        Expr::And(l, r) => {
            let left = eval(l, message).truth();
            if left == Some(false) {
                return Value::Bool(false);
            }
            match (left, eval(r, message).truth()) {
                (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            }
        }
        Expr::Or(l, r) => {
            let left = eval(l, message).truth();
            if left == Some(true) {
                return Value::Bool(true);
            }
            match (left, eval(r, message).truth()) {
                (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            }
        }
        Expr::IsNull { expr, negated } => {
            let is_null = eval(expr, message) == Value::Null;
            Value::Bool(is_null != *negated)
        }
        Expr::Like {
            expr,
            pattern,
            escape,
            negated,
        } => match eval(expr, message) {
            Value::Str(s) => {
                let text: Vec<char> = s.chars().collect();
                Value::Bool(like(&text, pattern, *escape) != *negated)
            }
            _ => Value::Null,
        },
        Expr::In {
            expr,
            list,
            negated,
        } => {
            let value = eval(expr, message);
            if value == Value::Null {
                return Value::Null;
            }
            let found = list
                .iter()
                .any(|candidate| compare(CmpOp::Eq, &value, candidate) == Some(true));
            Value::Bool(found != *negated)
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let value = eval(expr, message);
            let above = compare(CmpOp::Ge, &value, &eval(low, message));
            let below = compare(CmpOp::Le, &value, &eval(high, message));
            match (above, below) {
                (Some(a), Some(b)) => Value::Bool((a && b) != *negated),
                _ => Value::Null,
            }
        }
    }
}

fn arith(op: ArithOp, left: Value, right: Value) -> Value {
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        return match op {
            ArithOp::Add => a.checked_add(*b).map_or(Value::Null, Value::Int),
            ArithOp::Sub => a.checked_sub(*b).map_or(Value::Null, Value::Int),
            ArithOp::Mul => a.checked_mul(*b).map_or(Value::Null, Value::Int),
            ArithOp::Div => a.checked_div(*b).map_or(Value::Null, Value::Int),
        };
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => Value::Double(match op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
        }),
        _ => Value::Null,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Option<bool> {
    let ordering = match (left, right) {
        (Value::Null, _) | (_, Value::Null) => return None,
        (Value::Str(a), Value::Str(b)) => match op {
            CmpOp::Eq => return Some(a == b),
            CmpOp::Ne => return Some(a != b),
            _ => return None,
        },
        (Value::Bool(a), Value::Bool(b)) => match op {
            CmpOp::Eq => return Some(a == b),
            CmpOp::Ne => return Some(a != b),
            _ => return None,
        },
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b)?,
            _ => return Some(op == CmpOp::Ne),
        },
    };
    Some(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

fn like(text: &[char], pattern: &[char], escape: Option<char>) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(c) if Some(*c) == escape => match pattern.get(1) {
            Some(literal) => text.first() == Some(literal) && like(&text[1..], &pattern[2..], escape),
            None => false,
        },
        Some('%') => (0..=text.len()).any(|skip| like(&text[skip..], &pattern[1..], escape)),
        Some('_') => !text.is_empty() && like(&text[1..], &pattern[1..], escape),
        Some(c) => text.first() == Some(c) && like(&text[1..], &pattern[1..], escape),
    }
}
