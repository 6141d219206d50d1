//! Restricted arithmetic/string evaluator.
//!
//! Expressions are source text interleaved with already-evaluated operands
//! (the values substituted for reference blocks). The grammar is fixed:
//!
//! ```text
//! expr    := term (("+" | "-") term)*
//! term    := unary (("*" | "/" | "%") unary)*
//! unary   := "-" unary | power
//! power   := primary ["^" unary]
//! primary := number | string | operand | ident ["(" args ")"] | "(" expr ")"
//! ```
//!
//! `+` adds numbers and concatenates as soon as either side is text. No
//! host code is ever executed.

use crate::value::Datum;
use thiserror::Error;

/// A piece of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Part<'a> {
    Source(&'a str),
    /// A substituted reference value; `None` when the reference had none.
    Operand(Option<Datum>),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("unexpected character `{0}`")]
    Lex(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("unknown name `{0}`")]
    UnknownName(String),
    #[error("`{name}` expects {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: &'static str,
        found: usize,
    },
    #[error("`{op}` needs numeric operands")]
    NotNumeric { op: String },
    #[error("reference has no value")]
    MissingOperand,
    #[error("result is not finite")]
    NotFinite,
    #[error("expression nests too deeply")]
    TooDeep,
}

/// Nesting bound for parentheses, calls and unary operators.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
    Operand(Datum),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => format!("`{n}`"),
            Token::Str(s) => format!("'{s}'"),
            Token::Ident(s) => format!("`{s}`"),
            Token::Op(c) => format!("`{c}`"),
            Token::LParen => "`(`".into(),
            Token::RParen => "`)`".into(),
            Token::Comma => "`,`".into(),
            Token::Operand(d) => format!("operand `{d}`"),
        }
    }
}

fn lex(src: &str, out: &mut Vec<Token>) -> Result<(), EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse().map_err(|_| EvalError::Lex(c))?;
                out.push(Token::Num(n));
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(EvalError::UnterminatedString),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                out.push(Token::Str(text));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                out.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            ',' => {
                out.push(Token::Comma);
                i += 1;
            }
            other => return Err(EvalError::Lex(other)),
        }
    }
    Ok(())
}

/// Evaluates an expression made of source text and substituted operands.
pub fn evaluate(parts: &[Part<'_>]) -> Result<Datum, EvalError> {
    let mut tokens = Vec::new();
    for part in parts {
        match part {
            Part::Source(src) => lex(src, &mut tokens)?,
            Part::Operand(Some(value)) => tokens.push(Token::Operand(value.clone())),
            Part::Operand(None) => return Err(EvalError::MissingOperand),
        }
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if let Some(token) = parser.tokens.get(parser.pos) {
        return Err(EvalError::UnexpectedToken(token.describe()));
    }
    match value {
        Datum::Number(n) if !n.is_finite() => Err(EvalError::NotFinite),
        other => Ok(other),
    }
}

/// Evaluates plain source text.
pub fn evaluate_str(src: &str) -> Result<Datum, EvalError> {
    evaluate(&[Part::Source(src)])
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, EvalError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(EvalError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn eat_op(&mut self, ops: &[char]) -> Option<char> {
        match self.peek() {
            Some(Token::Op(c)) if ops.contains(c) => {
                let c = *c;
                self.pos += 1;
                Some(c)
            }
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<Datum, EvalError> {
        let mut lhs = self.term()?;
        while let Some(op) = self.eat_op(&['+', '-']) {
            let rhs = self.term()?;
            lhs = if op == '+' { add(lhs, rhs)? } else { numeric(op, &lhs, &rhs)? };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Datum, EvalError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&['*', '/', '%']) {
            let rhs = self.unary()?;
            lhs = numeric(op, &lhs, &rhs)?;
        }
        Ok(lhs)
    }

    // Every recursive path of the grammar passes through here.
    fn unary(&mut self) -> Result<Datum, EvalError> {
        if self.depth >= MAX_DEPTH {
            return Err(EvalError::TooDeep);
        }
        self.depth += 1;
        let result = self.signed();
        self.depth -= 1;
        result
    }

    fn signed(&mut self) -> Result<Datum, EvalError> {
        if self.eat_op(&['-']).is_some() {
            let v = self.unary()?;
            let n = v.as_number().ok_or_else(|| EvalError::NotNumeric { op: "-".into() })?;
            return Ok(Datum::Number(-n));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Datum, EvalError> {
        let base = self.primary()?;
        if self.eat_op(&['^']).is_some() {
            let exponent = self.unary()?;
            return numeric('^', &base, &exponent);
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Datum, EvalError> {
        match self.next()? {
            Token::Num(n) => Ok(Datum::Number(n)),
            Token::Str(s) => Ok(Datum::Text(s)),
            Token::Operand(d) => Ok(d),
            Token::LParen => {
                let v = self.expr()?;
                self.expect_rparen()?;
                Ok(v)
            }
            Token::Ident(name) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.pos += 1;
                    let args = self.args()?;
                    call(&name, args)
                } else {
                    constant(&name)
                }
            }
            other => Err(EvalError::UnexpectedToken(other.describe())),
        }
    }

    fn args(&mut self) -> Result<Vec<Datum>, EvalError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next()? {
                Token::Comma => continue,
                Token::RParen => return Ok(args),
                other => return Err(EvalError::UnexpectedToken(other.describe())),
            }
        }
    }

    fn expect_rparen(&mut self) -> Result<(), EvalError> {
        match self.next()? {
            Token::RParen => Ok(()),
            other => Err(EvalError::UnexpectedToken(other.describe())),
        }
    }
}

fn is_text(d: &Datum) -> bool {
    match d {
        Datum::Text(_) => true,
        Datum::Number(_) => false,
        Datum::List(items) => items.iter().any(is_text),
    }
}

fn add(lhs: Datum, rhs: Datum) -> Result<Datum, EvalError> {
    if is_text(&lhs) || is_text(&rhs) {
        return Ok(Datum::Text(format!("{lhs}{rhs}")));
    }
    numeric('+', &lhs, &rhs)
}

fn numeric(op: char, lhs: &Datum, rhs: &Datum) -> Result<Datum, EvalError> {
    let err = || EvalError::NotNumeric { op: op.to_string() };
    let a = lhs.as_number().ok_or_else(err)?;
    let b = rhs.as_number().ok_or_else(err)?;
    let n = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' => a / b,
        '%' => a % b,
        '^' => a.powf(b),
        _ => return Err(err()),
    };
    Ok(Datum::Number(n))
}

/// Applies a binary operator outside an expression, as accumulating
/// assignments do.
pub(crate) fn combine(op: char, lhs: Datum, rhs: Datum) -> Result<Datum, EvalError> {
    if op == '+' {
        add(lhs, rhs)
    } else {
        numeric(op, &lhs, &rhs)
    }
}

fn constant(name: &str) -> Result<Datum, EvalError> {
    match name {
        "pi" => Ok(Datum::Number(std::f64::consts::PI)),
        "e" => Ok(Datum::Number(std::f64::consts::E)),
        _ => Err(EvalError::UnknownName(name.to_string())),
    }
}

/// Numbers of `args`, with list arguments flattened.
fn numbers(name: &str, args: &[Datum]) -> Result<Vec<f64>, EvalError> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Datum::List(items) => out.extend(numbers(name, items)?),
            other => out.push(
                other
                    .as_number()
                    .ok_or_else(|| EvalError::NotNumeric { op: name.to_string() })?,
            ),
        }
    }
    Ok(out)
}

fn call(name: &str, args: Vec<Datum>) -> Result<Datum, EvalError> {
    let arity = |expected: &'static str| EvalError::Arity {
        name: name.to_string(),
        expected,
        found: args.len(),
    };
    let unary = |f: fn(f64) -> f64| -> Result<Datum, EvalError> {
        match numbers(name, &args)?.as_slice() {
            [x] if args.len() == 1 => Ok(Datum::Number(f(*x))),
            _ => Err(arity("1")),
        }
    };
    let binary = |f: fn(f64, f64) -> f64| -> Result<Datum, EvalError> {
        match numbers(name, &args)?.as_slice() {
            [x, y] if args.len() == 2 => Ok(Datum::Number(f(*x, *y))),
            _ => Err(arity("2")),
        }
    };
    match name {
        "abs" => unary(f64::abs),
        "sqrt" => unary(f64::sqrt),
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "atan2" => binary(f64::atan2),
        "pow" => binary(f64::powf),
        "min" | "max" => {
            let ns = numbers(name, &args)?;
            let fold: fn(f64, f64) -> f64 = if name == "min" { f64::min } else { f64::max };
            ns.into_iter()
                .reduce(fold)
                .map(Datum::Number)
                .ok_or_else(|| arity("at least 1"))
        }
        "sum" => Ok(Datum::Number(numbers(name, &args)?.into_iter().sum())),
        "len" => match args.as_slice() {
            [Datum::List(items)] => Ok(Datum::Number(items.len() as f64)),
            [_] => Ok(Datum::Number(1.0)),
            _ => Err(arity("1")),
        },
        _ => Err(EvalError::UnknownFunction(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn num(src: &str) -> f64 {
        evaluate_str(src).unwrap().as_number().unwrap()
    }

    #[test]
    fn precedence_and_associativity() {
        assert_eq!(num("1 + 2 * 3"), 7.0);
        assert_eq!(num("(1 + 2) * 3"), 9.0);
        assert_eq!(num("2 ^ 3 ^ 2"), 512.0);
        assert_eq!(num("-2 ^ 2"), -4.0);
        assert_eq!(num("10 - 4 - 3"), 3.0);
        assert_eq!(num("7 % 4"), 3.0);
        assert_eq!(num("1.5e2"), 150.0);
    }

    #[test]
    fn functions_and_constants() {
        assert_eq!(num("abs(-3)"), 3.0);
        assert_eq!(num("max(1, 5, 2)"), 5.0);
        assert_eq!(num("min(4, 2)"), 2.0);
        assert_eq!(num("pow(2, 10)"), 1024.0);
        assert!((num("atan2(1, 1)") - std::f64::consts::FRAC_PI_4).abs() < 1e-12);
        assert!((num("cos(pi)") + 1.0).abs() < 1e-12);
        assert!(matches!(evaluate_str("sqrt(1, 2)"), Err(EvalError::Arity { .. })));
        assert!(matches!(evaluate_str("exec(1)"), Err(EvalError::UnknownFunction(_))));
        assert!(matches!(evaluate_str("window"), Err(EvalError::UnknownName(_))));
    }

    #[test]
    fn plus_concatenates_text() {
        let parts = [
            Part::Operand(Some(Datum::from("<mi>a</mi>"))),
            Part::Source(" + '<mo>+</mo>' + "),
            Part::Operand(Some(Datum::from("<mi>b</mi>"))),
        ];
        assert_eq!(
            evaluate(&parts).unwrap(),
            Datum::from("<mi>a</mi><mo>+</mo><mi>b</mi>")
        );
        assert!(matches!(evaluate_str("'a' * 2"), Err(EvalError::NotNumeric { .. })));
    }

    #[test]
    fn operands_and_lists() {
        let list = Datum::List(vec![Datum::Number(1.0), Datum::Number(2.0), Datum::Number(3.0)]);
        let parts = [Part::Source("sum("), Part::Operand(Some(list)), Part::Source(") * 2")];
        assert_eq!(evaluate(&parts).unwrap(), Datum::Number(12.0));
        assert_eq!(
            evaluate(&[Part::Operand(None)]),
            Err(EvalError::MissingOperand)
        );
    }

    #[test]
    fn malformed_input_is_an_error() {
        for src in ["", "1 +", "(1", "1 2", "'open", "1 ; 2", "max()"] {
            assert!(evaluate_str(src).is_err(), "{src:?} should fail");
        }
        assert_eq!(evaluate_str("1 / 0"), Err(EvalError::NotFinite));
    }

    #[test]
    fn deep_nesting_is_rejected_not_overflowed() {
        let deep = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(evaluate_str(&deep), Err(EvalError::TooDeep));
        assert_eq!(evaluate_str(&"-".repeat(10_000)), Err(EvalError::TooDeep));

        let nested = format!("{}1{}", "abs(".repeat(40), ")".repeat(40));
        assert_eq!(num(&nested), 1.0);
    }

    proptest! {
        #[test]
        fn integer_arithmetic_matches_native(a in -1000i32..1000, b in -1000i32..1000, c in 1i32..100) {
            let src = format!("{a} + {b} * {c} - ({a} % {c})");
            let expected = f64::from(a) + f64::from(b) * f64::from(c) - (f64::from(a) % f64::from(c));
            prop_assert_eq!(num(&src), expected);
        }
    }
}
