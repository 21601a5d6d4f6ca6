// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modsim project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Expression evaluation for derived registers
//!
//! Derived registers compute their value from other registers with a small
//! arithmetic language: numeric literals, identifiers, `+ - * /` with the
//! usual precedence, unary minus, parentheses, and calls to a fixed set of
//! functions (`min`, `max` and the `math` namespace). There is no control
//! flow, no assignment, no attribute access and no indexing; an identifier
//! resolves only against the environment the caller supplies.
//!
//! Expressions are parsed once, when a simulation is built, into an
//! [`Expr`] tree that the update loop re-evaluates every tick. Evaluation
//! is total: arithmetic follows IEEE-754 (division by zero yields an
//! infinity or NaN), and an unresolved identifier evaluates to NaN so the
//! caller can keep the previous register value.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Errors produced while parsing an expression string.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("invalid numeric literal '{0}'")]
    InvalidNumber(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected '{0}' at offset {1}")]
    UnexpectedToken(String, usize),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{function}' expects {expected} argument(s), got {got}")]
    WrongArity {
        function: &'static str,
        expected: &'static str,
        got: usize,
    },
}

/// The function whitelist available to expressions.
///
/// `min` and `max` are callable bare; the remaining entries form the math
/// namespace and are callable either bare (`sqrt(x)`) or qualified
/// (`math.sqrt(x)`), so configurations may use either form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Min,
    Max,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sqrt,
    Exp,
    Log,
    Log10,
    Pow,
    Floor,
    Ceil,
    Abs,
}

impl Function {
    fn resolve(name: &str, qualified: bool) -> Option<Function> {
        let f = match name {
            "min" if !qualified => Function::Min,
            "max" if !qualified => Function::Max,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "atan2" => Function::Atan2,
            "sqrt" => Function::Sqrt,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "log10" => Function::Log10,
            "pow" => Function::Pow,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "abs" => Function::Abs,
            _ => return None,
        };
        Some(f)
    }

    fn name(self) -> &'static str {
        match self {
            Function::Min => "min",
            Function::Max => "max",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Asin => "asin",
            Function::Acos => "acos",
            Function::Atan => "atan",
            Function::Atan2 => "atan2",
            Function::Sqrt => "sqrt",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Log10 => "log10",
            Function::Pow => "pow",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Abs => "abs",
        }
    }

    /// Checks the argument count at parse time so evaluation never has to.
    fn check_arity(self, got: usize) -> Result<(), ExprError> {
        let expected: &'static str = match self {
            Function::Min | Function::Max => {
                if got >= 2 {
                    return Ok(());
                }
                "at least 2"
            }
            Function::Atan2 | Function::Pow => {
                if got == 2 {
                    return Ok(());
                }
                "2"
            }
            _ => {
                if got == 1 {
                    return Ok(());
                }
                "1"
            }
        };
        Err(ExprError::WrongArity {
            function: self.name(),
            expected,
            got,
        })
    }

    fn apply(self, args: &[f64]) -> f64 {
        match self {
            Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
            Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Function::Sin => args[0].sin(),
            Function::Cos => args[0].cos(),
            Function::Tan => args[0].tan(),
            Function::Asin => args[0].asin(),
            Function::Acos => args[0].acos(),
            Function::Atan => args[0].atan(),
            Function::Atan2 => args[0].atan2(args[1]),
            Function::Sqrt => args[0].sqrt(),
            Function::Exp => args[0].exp(),
            Function::Log => args[0].ln(),
            Function::Log10 => args[0].log10(),
            Function::Pow => args[0].powf(args[1]),
            Function::Floor => args[0].floor(),
            Function::Ceil => args[0].ceil(),
            Function::Abs => args[0].abs(),
        }
    }
}

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A parsed expression tree, reusable across ticks.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Parse an expression string into an evaluation tree.
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if let Some((token, at)) = parser.peek() {
            return Err(ExprError::UnexpectedToken(token.to_string(), at));
        }
        Ok(expr)
    }

    /// Evaluate against an environment lookup.
    ///
    /// `lookup` receives every identifier the tree references. An
    /// identifier that resolves to `None` yields NaN, which callers treat
    /// as "keep the previous value"; validated schemas never hit that
    /// path.
    pub fn eval<F>(&self, lookup: &F) -> f64
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self {
            Expr::Number(v) => *v,
            Expr::Var(name) => lookup(name).unwrap_or(f64::NAN),
            Expr::Neg(inner) => -inner.eval(lookup),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.eval(lookup);
                let r = rhs.eval(lookup);
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                }
            }
            Expr::Call { function, args } => {
                let values: Vec<f64> = args.iter().map(|a| a.eval(lookup)).collect();
                function.apply(&values)
            }
        }
    }

    /// Collect the free identifiers of the tree.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Var(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_variables(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Dot,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(v) => write!(f, "{}", v),
            Token::Ident(name) => write!(f, "{}", name),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Dot => write!(f, "."),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '+' => {
                tokens.push((Token::Plus, i));
                i += 1;
            }
            '-' => {
                tokens.push((Token::Minus, i));
                i += 1;
            }
            '*' => {
                tokens.push((Token::Star, i));
                i += 1;
            }
            '/' => {
                tokens.push((Token::Slash, i));
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, i));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, i));
                i += 1;
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b'.' {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    i += 1;
                    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
                        i += 1;
                    }
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = &input[start..i];
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.to_string()))?;
                tokens.push((Token::Number(value), start));
            }
            '.' => {
                tokens.push((Token::Dot, i));
                i += 1;
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                tokens.push((Token::Ident(input[start..i].to_string()), start));
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<(&Token, usize)> {
        self.tokens.get(self.pos).map(|(t, at)| (t, *at))
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        match self.advance() {
            Some((found, _)) if found == token => Ok(()),
            Some((found, at)) => Err(ExprError::UnexpectedToken(found.to_string(), at)),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some((Token::Plus, _)) => BinOp::Add,
                Some((Token::Minus, _)) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some((Token::Star, _)) => BinOp::Mul,
                Some((Token::Slash, _)) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.factor()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, ExprError> {
        if let Some((Token::Minus, _)) = self.peek() {
            self.advance();
            let inner = self.factor()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some((Token::Number(value), _)) => Ok(Expr::Number(value)),
            Some((Token::LParen, _)) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some((Token::Ident(name), _)) => self.ident_tail(name),
            Some((found, at)) => Err(ExprError::UnexpectedToken(found.to_string(), at)),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    /// An identifier is a variable reference, a bare call, or a
    /// `math.`-qualified call. A dot in any other position is an error.
    fn ident_tail(&mut self, name: String) -> Result<Expr, ExprError> {
        match self.peek() {
            Some((Token::Dot, dot_at)) => {
                if name != "math" {
                    return Err(ExprError::UnexpectedToken(".".to_string(), dot_at));
                }
                self.advance();
                let (func_name, func_at) = match self.advance() {
                    Some((Token::Ident(n), at)) => (n, at),
                    Some((found, at)) => {
                        return Err(ExprError::UnexpectedToken(found.to_string(), at))
                    }
                    None => return Err(ExprError::UnexpectedEnd),
                };
                let function = Function::resolve(&func_name, true)
                    .ok_or_else(|| ExprError::UnknownFunction(format!("math.{}", func_name)))?;
                if !matches!(self.peek(), Some((Token::LParen, _))) {
                    return Err(ExprError::UnexpectedToken(func_name, func_at));
                }
                self.call(function)
            }
            Some((Token::LParen, _)) => {
                let function =
                    Function::resolve(&name, false).ok_or(ExprError::UnknownFunction(name))?;
                self.call(function)
            }
            _ => Ok(Expr::Var(name)),
        }
    }

    fn call(&mut self, function: Function) -> Result<Expr, ExprError> {
        self.expect(Token::LParen)?;
        let mut args = vec![self.expression()?];
        while let Some((Token::Comma, _)) = self.peek() {
            self.advance();
            args.push(self.expression()?);
        }
        self.expect(Token::RParen)?;
        function.check_arity(args.len())?;
        Ok(Expr::Call { function, args })
    }
}
