// logtail - core/expression.rs
//
// Small boolean filter-expression language.
//
//   expr     := or
//   or       := and ( ("or" | "||") and )*
//   and      := unary ( ("and" | "&&") unary )*
//   unary    := ("not" | "!") unary | compare
//   compare  := operand ( op operand )?
//   op       := "==" | "!=" | "<" | "<=" | ">" | ">=" | "contains"
//   operand  := "(" expr ")" | variable | literal
//   variable := "$timestamp" | "$level" | "$message" | "$line"
//   literal  := "quoted string" | integer | level name | true | false
//
// Examples:
//   $level >= warning and not $message contains "heartbeat"
//   $timestamp >= "2024-01-15 00:00:00" and $timestamp < "2024-01-16 00:00:00"
//   "timeout" or $line < 100
//
// A bare quoted string in boolean position means `$message contains ...`.
// `contains` is case-insensitive; `==` on text is exact.
//
// Expressions are type-checked while parsing so evaluation never fails.

use crate::core::model::{Level, LogEntry};
use crate::core::timestamp::sniff_timestamp;
use crate::util::error::FilterError;
use chrono::{DateTime, Utc};

/// A variable bound to a column of the entry under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    Timestamp,
    Level,
    Message,
    Line,
}

impl Variable {
    fn from_name(name: &str) -> Option<Variable> {
        match name.to_ascii_lowercase().as_str() {
            "timestamp" => Some(Variable::Timestamp),
            "level" => Some(Variable::Level),
            "message" => Some(Variable::Message),
            "line" => Some(Variable::Line),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Variable::Timestamp => "$timestamp",
            Variable::Level => "$level",
            Variable::Message => "$message",
            Variable::Line => "$line",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// The operator with its operands swapped (`a < b` == `b > a`).
    fn flipped(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }

    fn test<T: PartialOrd>(self, lhs: &T, rhs: &T) -> bool {
        match self {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
        }
    }

    fn is_ordering(self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

/// A type-checked comparison: variable on the left, constant on the right.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Timestamp(CompareOp, DateTime<Utc>),
    Level(CompareOp, Level),
    Line(CompareOp, usize),
    Message(CompareOp, String),
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(bool),
    /// Case-insensitive substring test; the needle is stored lower-cased.
    MessageContains(String),
    Compare(Comparison),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse `source` into an expression.
    pub fn parse(source: &str) -> Result<Expr, FilterError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some((_, at)) => Err(parser.error(at, "unexpected trailing input")),
        }
    }

    /// Evaluate against one entry.
    pub fn eval(&self, entry: &LogEntry) -> bool {
        match self {
            Expr::Constant(b) => *b,
            Expr::MessageContains(needle) => entry
                .raw_content()
                .map(|m| m.to_lowercase().contains(needle.as_str()))
                .unwrap_or(false),
            Expr::Compare(cmp) => match cmp {
                // Entries without a timestamp never satisfy a time comparison.
                Comparison::Timestamp(op, ts) => {
                    entry.timestamp().is_some_and(|t| op.test(&t, ts))
                }
                Comparison::Level(op, level) => op.test(&entry.level(), level),
                Comparison::Line(op, n) => op.test(&entry.line_number(), n),
                Comparison::Message(op, text) => {
                    op.test(&entry.raw_content().unwrap_or(""), &text.as_str())
                }
            },
            Expr::Not(inner) => !inner.eval(entry),
            Expr::And(a, b) => a.eval(entry) && b.eval(entry),
            Expr::Or(a, b) => a.eval(entry) || b.eval(entry),
        }
    }
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Var(Variable),
    Str(String),
    Int(i64),
    Word(String),
    Op(CompareOp),
    AndOp,
    OrOp,
    NotOp,
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, FilterError> {
    let err = |position: usize, reason: &str| FilterError::Expression {
        expression: source.to_string(),
        position,
        reason: reason.to_string(),
    };

    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();
    while let Some(&(at, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push((Token::LParen, at));
            }
            ')' => {
                chars.next();
                tokens.push((Token::RParen, at));
            }
            '"' | '\'' => {
                chars.next();
                let quote = c;
                let mut text = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => text.push(escaped),
                            None => break,
                        },
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        c => text.push(c),
                    }
                }
                if !closed {
                    return Err(err(at, "unterminated string literal"));
                }
                tokens.push((Token::Str(text), at));
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                chars.next();
                let next = chars.peek().map(|&(_, n)| n);
                let (token, double) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(CompareOp::Eq), true),
                    ('!', Some('=')) => (Token::Op(CompareOp::Ne), true),
                    ('<', Some('=')) => (Token::Op(CompareOp::Le), true),
                    ('>', Some('=')) => (Token::Op(CompareOp::Ge), true),
                    ('&', Some('&')) => (Token::AndOp, true),
                    ('|', Some('|')) => (Token::OrOp, true),
                    ('<', _) => (Token::Op(CompareOp::Lt), false),
                    ('>', _) => (Token::Op(CompareOp::Gt), false),
                    ('!', _) => (Token::NotOp, false),
                    _ => return Err(err(at, "unknown operator")),
                };
                if double {
                    chars.next();
                }
                tokens.push((token, at));
            }
            '$' => {
                chars.next();
                let name = take_word(&mut chars);
                let var = Variable::from_name(&name)
                    .ok_or_else(|| err(at, &format!("unknown variable '${name}'")))?;
                tokens.push((Token::Var(var), at));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let word = take_word(&mut chars);
                let n = word
                    .parse::<i64>()
                    .map_err(|_| err(at, &format!("invalid number '{word}'")))?;
                tokens.push((Token::Int(n), at));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let word = take_word(&mut chars);
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::AndOp,
                    "or" => Token::OrOp,
                    "not" => Token::NotOp,
                    _ => Token::Word(word),
                };
                tokens.push((token, at));
            }
            _ => return Err(err(at, &format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

fn take_word(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> String {
    let mut word = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' || (c == '-' && word.is_empty()) {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

// =============================================================================
// Parser
// =============================================================================

/// An operand before type checking.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Var(Variable),
    Str(String),
    Int(i64),
    Word(String),
    Expr(Expr),
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<(Token, usize)> {
        self.tokens.get(self.pos).cloned()
    }

    fn end_position(&self) -> usize {
        self.source.len()
    }

    fn error(&self, position: usize, reason: &str) -> FilterError {
        FilterError::Expression {
            expression: self.source.to_string(),
            position,
            reason: reason.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some((Token::OrOp, _))) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some((Token::AndOp, _))) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, FilterError> {
        if matches!(self.peek(), Some((Token::NotOp, _))) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, FilterError> {
        let (lhs, lhs_at) = self.parse_operand()?;
        let op = match self.peek() {
            Some((Token::Op(op), at)) => Some((Some(op), at)),
            Some((Token::Word(w), at)) if w.eq_ignore_ascii_case("contains") => Some((None, at)),
            _ => None,
        };
        let Some((op, op_at)) = op else {
            return self.boolean_operand(lhs, lhs_at);
        };
        self.pos += 1;
        let (rhs, rhs_at) = self.parse_operand()?;
        match op {
            Some(op) => self.comparison(lhs, op, rhs, op_at, rhs_at),
            None => self.contains(lhs, rhs, op_at, rhs_at),
        }
    }

    fn parse_operand(&mut self) -> Result<(Operand, usize), FilterError> {
        let Some((token, at)) = self.peek() else {
            return Err(self.error(self.end_position(), "expected an operand"));
        };
        self.pos += 1;
        let operand = match token {
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.peek() {
                    Some((Token::RParen, _)) => self.pos += 1,
                    Some((_, p)) => return Err(self.error(p, "expected ')'")),
                    None => return Err(self.error(self.end_position(), "expected ')'")),
                }
                Operand::Expr(inner)
            }
            Token::Var(v) => Operand::Var(v),
            Token::Str(s) => Operand::Str(s),
            Token::Int(n) => Operand::Int(n),
            Token::Word(w) => Operand::Word(w),
            _ => return Err(self.error(at, "expected an operand")),
        };
        Ok((operand, at))
    }

    /// An operand standing alone in boolean position.
    fn boolean_operand(&self, operand: Operand, at: usize) -> Result<Expr, FilterError> {
        match operand {
            Operand::Expr(e) => Ok(e),
            Operand::Str(s) => Ok(Expr::MessageContains(s.to_lowercase())),
            Operand::Word(w) if w.eq_ignore_ascii_case("true") => Ok(Expr::Constant(true)),
            Operand::Word(w) if w.eq_ignore_ascii_case("false") => Ok(Expr::Constant(false)),
            _ => Err(self.error(at, "expected a boolean expression")),
        }
    }

    fn comparison(
        &self,
        lhs: Operand,
        op: CompareOp,
        rhs: Operand,
        op_at: usize,
        rhs_at: usize,
    ) -> Result<Expr, FilterError> {
        let (var, op, constant, constant_at) = match (lhs, rhs) {
            (Operand::Var(v), c) => (v, op, c, rhs_at),
            (c, Operand::Var(v)) => (v, op.flipped(), c, op_at),
            _ => return Err(self.error(op_at, "a comparison needs a $variable")),
        };
        let mismatch = |expected: &str| {
            self.error(
                constant_at,
                &format!("{} must be compared with {expected}", var.name()),
            )
        };
        let cmp = match var {
            Variable::Timestamp => match constant {
                Operand::Str(s) => {
                    let ts = DateTime::parse_from_rfc3339(s.trim())
                        .map(|dt| dt.with_timezone(&Utc))
                        .ok()
                        .or_else(|| sniff_timestamp(&s))
                        .ok_or_else(|| mismatch("a quoted timestamp"))?;
                    Comparison::Timestamp(op, ts)
                }
                _ => return Err(mismatch("a quoted timestamp")),
            },
            Variable::Level => {
                let level = match &constant {
                    Operand::Word(w) | Operand::Str(w) => Level::from_name(w),
                    _ => None,
                };
                Comparison::Level(op, level.ok_or_else(|| mismatch("a level name"))?)
            }
            Variable::Line => match constant {
                Operand::Int(n) => Comparison::Line(op, usize::try_from(n).unwrap_or(0)),
                _ => return Err(mismatch("an integer")),
            },
            Variable::Message => match constant {
                _ if op.is_ordering() => {
                    return Err(self.error(op_at, "$message only supports ==, != and contains"))
                }
                Operand::Str(s) => Comparison::Message(op, s),
                _ => return Err(mismatch("a quoted string")),
            },
        };
        Ok(Expr::Compare(cmp))
    }

    fn contains(
        &self,
        lhs: Operand,
        rhs: Operand,
        op_at: usize,
        rhs_at: usize,
    ) -> Result<Expr, FilterError> {
        if lhs != Operand::Var(Variable::Message) {
            return Err(self.error(op_at, "contains applies to $message only"));
        }
        match rhs {
            Operand::Str(s) => Ok(Expr::MessageContains(s.to_lowercase())),
            _ => Err(self.error(rhs_at, "contains needs a quoted string")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::column::{columns, Value};
    use chrono::TimeZone;

    fn entry(line: usize, level: Level, message: &str, hour: Option<u32>) -> LogEntry {
        let mut e = LogEntry::new();
        e.set(columns::LINE_NUMBER, Value::Number(line));
        e.set(columns::LEVEL, Value::Level(level));
        e.set(columns::RAW_CONTENT, Value::Text(Some(message.to_string())));
        e.set(
            columns::TIMESTAMP,
            Value::Timestamp(hour.map(|h| Utc.with_ymd_and_hms(2024, 1, 15, h, 0, 0).unwrap())),
        );
        e
    }

    #[test]
    fn test_level_and_contains() {
        let expr = Expr::parse(r#"$level >= warning and not $message contains "heartbeat""#).unwrap();
        assert!(expr.eval(&entry(1, Level::Error, "disk full", None)));
        assert!(!expr.eval(&entry(2, Level::Error, "HEARTBEAT lost", None)));
        assert!(!expr.eval(&entry(3, Level::Info, "disk full", None)));
    }

    #[test]
    fn test_timestamp_range() {
        let expr = Expr::parse(
            r#"$timestamp >= "2024-01-15 10:00:00" && $timestamp < "2024-01-15T12:00:00Z""#,
        )
        .unwrap();
        assert!(expr.eval(&entry(1, Level::Info, "x", Some(10))));
        assert!(expr.eval(&entry(1, Level::Info, "x", Some(11))));
        assert!(!expr.eval(&entry(1, Level::Info, "x", Some(12))));
        assert!(!expr.eval(&entry(1, Level::Info, "x", None)));
    }

    #[test]
    fn test_literal_on_left_flips_operator() {
        let expr = Expr::parse("100 > $line").unwrap();
        assert!(expr.eval(&entry(99, Level::Info, "x", None)));
        assert!(!expr.eval(&entry(100, Level::Info, "x", None)));
    }

    #[test]
    fn test_precedence_and_parentheses() {
        // and binds tighter than or
        let expr = Expr::parse(r#""a" or "b" and false"#).unwrap();
        assert!(expr.eval(&entry(1, Level::Info, "a", None)));
        let expr = Expr::parse(r#"("a" or "b") and false"#).unwrap();
        assert!(!expr.eval(&entry(1, Level::Info, "a", None)));
    }

    #[test]
    fn test_bare_string_is_contains() {
        let expr = Expr::parse("'Timeout'").unwrap();
        assert_eq!(expr, Expr::MessageContains("timeout".to_string()));
    }

    #[test]
    fn test_message_equality_is_exact() {
        let expr = Expr::parse(r#"$message == "ok""#).unwrap();
        assert!(expr.eval(&entry(1, Level::Info, "ok", None)));
        assert!(!expr.eval(&entry(1, Level::Info, "OK", None)));
    }

    #[test]
    fn test_parse_errors_carry_position() {
        let cases = [
            ("$level >= banana", 10),
            ("$bogus == 1", 0),
            ("$line == 1 )", 11),
            ("(\"a\"", 4),
            ("$message < \"x\"", 9),
            ("\"open", 0),
        ];
        for (source, expected) in cases {
            match Expr::parse(source) {
                Err(FilterError::Expression { position, .. }) => {
                    assert_eq!(position, expected, "{source}")
                }
                other => panic!("{source}: expected expression error, got {other:?}"),
            }
        }
    }
}
