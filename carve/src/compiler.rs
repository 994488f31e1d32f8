//! Expression compiler
//!
//! Turns a textual expression such as `x^2 + y^2 - 4` into a [`Tape`].
//!
//! ```
//! use carve::compiler::compile;
//!
//! let tape = compile("x^2 + y^2 - 4")?;
//! assert_eq!(tape.len(), 6);
//! # Ok::<(), carve::compiler::CompileError>(())
//! ```
//!
//! Supported syntax:
//! - Numbers (`1`, `2.5`, `1e-3`), the axes `x`, `y`, `z`, and `pi`
//! - Binary `+`, `-`, `*`, `/`, and `^` (integer exponents only)
//! - Unary `-`
//! - Functions `sqrt`, `abs`, `sin`, `cos`, `exp`, `ln`, `square`, `min`, `max`
//!
//! Subexpressions made only of constants are folded; operations with one
//! constant operand use the register-immediate opcodes.  Registers are
//! allocated as a stack, so the result always lands in register 0.
use crate::tape::{Instruction, Opcode, REG_COUNT, Tape};
use std::ops::Range;

/// Error produced when an expression fails to compile
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{message} (at {}..{})", span.start, span.end)]
pub struct CompileError {
    /// Human-readable description
    pub message: String,
    /// Byte range in the source expression
    pub span: Range<usize>,
}

impl CompileError {
    fn new(message: impl Into<String>, span: Range<usize>) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

/// Compiles an expression into a tape
pub fn compile(expr: &str) -> Result<Tape, CompileError> {
    let tokens = lex(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let node = parser.expr()?;
    let end = parser.peek();
    if end.kind != TokenKind::End {
        return Err(CompileError::new("unexpected token", end.span.clone()));
    }

    let mut out = vec![];
    emit(&node, 0, &mut out).map_err(|()| {
        CompileError::new(
            format!("expression needs more than {REG_COUNT} registers"),
            0..expr.len(),
        )
    })?;
    // Every register and opcode is in range by construction
    Tape::new(out).map_err(|e| CompileError::new(e.to_string(), 0..expr.len()))
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
enum TokenKind {
    Number(f32),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
    End,
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    span: Range<usize>,
}

fn lex(s: &str) -> Result<Vec<Token>, CompileError> {
    let mut out = vec![];
    let mut chars = s.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut end = start;
            let mut prev = ' ';
            while let Some(&(i, c)) = chars.peek() {
                let exponent_sign = (c == '-' || c == '+') && prev == 'e';
                if c.is_ascii_digit() || c == '.' || c == 'e' || exponent_sign
                {
                    end = i + c.len_utf8();
                    prev = c;
                    chars.next();
                } else {
                    break;
                }
            }
            let text = &s[start..end];
            let v = text.parse::<f32>().map_err(|_| {
                let msg = format!("invalid number '{text}'");
                CompileError::new(msg, start..end)
            })?;
            out.push(Token {
                kind: TokenKind::Number(v),
                span: start..end,
            });
        } else if c.is_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    end = i + c.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(Token {
                kind: TokenKind::Ident(s[start..end].to_owned()),
                span: start..end,
            });
        } else {
            let span = start..start + c.len_utf8();
            let kind = match c {
                '+' | '-' | '*' | '/' | '^' => TokenKind::Op(c),
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                ',' => TokenKind::Comma,
                _ => {
                    return Err(CompileError::new(
                        format!("unexpected character '{c}'"),
                        span,
                    ));
                }
            };
            chars.next();
            out.push(Token { kind, span });
        }
    }
    out.push(Token {
        kind: TokenKind::End,
        span: s.len()..s.len(),
    });
    Ok(out)
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
enum Node {
    Const(f32),
    Axis(u8),
    Unary(Opcode, Box<Node>),
    Binary(Opcode, Box<Node>, Box<Node>),
    Pow(Box<Node>, i32),
}

impl Node {
    fn unary(op: Opcode, a: Node) -> Node {
        if let Node::Const(a) = a {
            let v = match op {
                Opcode::Neg => -a,
                Opcode::Abs => a.abs(),
                Opcode::Square => a * a,
                Opcode::Sqrt => a.sqrt(),
                Opcode::Sin => a.sin(),
                Opcode::Cos => a.cos(),
                Opcode::Exp => a.exp(),
                Opcode::Ln => a.ln(),
                _ => unreachable!("{op:?} is not a unary opcode"),
            };
            Node::Const(v)
        } else {
            Node::Unary(op, Box::new(a))
        }
    }

    fn binary(op: Opcode, a: Node, b: Node) -> Node {
        if let (Node::Const(a), Node::Const(b)) = (&a, &b) {
            let v = match op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div => a / b,
                Opcode::Min => a.min(*b),
                Opcode::Max => a.max(*b),
                _ => unreachable!("{op:?} is not a binary opcode"),
            };
            Node::Const(v)
        } else {
            Node::Binary(op, Box::new(a), Box::new(b))
        }
    }

    fn pow(a: Node, n: i32) -> Node {
        match (a, n) {
            (Node::Const(a), n) => Node::Const(a.powi(n)),
            (_, 0) => Node::Const(1.0),
            (a, 1) => a,
            (a, n) => Node::Pow(Box::new(a), n),
        }
    }
}

/// Maximum nesting of parentheses, function calls, and unary operators
const MAX_DEPTH: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let t = self.peek().clone();
        if t.kind != TokenKind::End {
            self.pos += 1;
        }
        t
    }

    fn expect(
        &mut self,
        kind: TokenKind,
        what: &str,
    ) -> Result<(), CompileError> {
        let t = self.next();
        if t.kind == kind {
            Ok(())
        } else {
            Err(CompileError::new(format!("expected {what}"), t.span))
        }
    }

    /// `expr := term (('+' | '-') term)*`
    fn expr(&mut self) -> Result<Node, CompileError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Op('+') => Opcode::Add,
                TokenKind::Op('-') => Opcode::Sub,
                _ => break Ok(lhs),
            };
            self.next();
            let rhs = self.term()?;
            lhs = Node::binary(op, lhs, rhs);
        }
    }

    /// `term := unary (('*' | '/') unary)*`
    fn term(&mut self) -> Result<Node, CompileError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Op('*') => Opcode::Mul,
                TokenKind::Op('/') => Opcode::Div,
                _ => break Ok(lhs),
            };
            self.next();
            let rhs = self.unary()?;
            lhs = Node::binary(op, lhs, rhs);
        }
    }

    /// `unary := '-' unary | power`
    ///
    /// Every recursive path through the grammar passes through here, so this
    /// is where nesting depth is tracked.
    fn unary(&mut self) -> Result<Node, CompileError> {
        if self.depth >= MAX_DEPTH {
            return Err(CompileError::new(
                format!("expression is nested more than {MAX_DEPTH} deep"),
                self.peek().span.clone(),
            ));
        }
        self.depth += 1;
        let out = self.unary_inner();
        self.depth -= 1;
        out
    }

    fn unary_inner(&mut self) -> Result<Node, CompileError> {
        if self.peek().kind == TokenKind::Op('-') {
            self.next();
            let a = self.unary()?;
            Ok(Node::unary(Opcode::Neg, a))
        } else {
            self.power()
        }
    }

    /// `power := atom ('^' unary)?`
    fn power(&mut self) -> Result<Node, CompileError> {
        let base = self.atom()?;
        if self.peek().kind != TokenKind::Op('^') {
            return Ok(base);
        }
        self.next();
        let start = self.peek().span.start;
        let exp = self.unary()?;
        let end = self.tokens[self.pos.saturating_sub(1)].span.end;
        match exp {
            Node::Const(v) if v.fract() == 0.0 && v.abs() <= 1024.0 => {
                Ok(Node::pow(base, v as i32))
            }
            _ => Err(CompileError::new(
                "exponent must be a constant integer",
                start..end.max(start),
            )),
        }
    }

    /// `atom := number | ident | ident '(' args ')' | '(' expr ')'`
    fn atom(&mut self) -> Result<Node, CompileError> {
        let t = self.next();
        match t.kind {
            TokenKind::Number(v) => Ok(Node::Const(v)),
            TokenKind::LParen => {
                let e = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(e)
            }
            TokenKind::Ident(name) => self.ident(&name, t.span),
            _ => Err(CompileError::new("expected an expression", t.span)),
        }
    }

    fn ident(
        &mut self,
        name: &str,
        span: Range<usize>,
    ) -> Result<Node, CompileError> {
        match name {
            "x" => return Ok(Node::Axis(0)),
            "y" => return Ok(Node::Axis(1)),
            "z" => return Ok(Node::Axis(2)),
            "pi" => return Ok(Node::Const(std::f32::consts::PI)),
            _ => (),
        }
        let unary = match name {
            "neg" => Some(Opcode::Neg),
            "abs" => Some(Opcode::Abs),
            "square" => Some(Opcode::Square),
            "sqrt" => Some(Opcode::Sqrt),
            "sin" => Some(Opcode::Sin),
            "cos" => Some(Opcode::Cos),
            "exp" => Some(Opcode::Exp),
            "ln" | "log" => Some(Opcode::Ln),
            _ => None,
        };
        let binary = match name {
            "min" => Some(Opcode::Min),
            "max" => Some(Opcode::Max),
            _ => None,
        };
        if unary.is_none() && binary.is_none() {
            return Err(CompileError::new(
                format!("unknown identifier '{name}'"),
                span,
            ));
        }

        self.expect(TokenKind::LParen, "'(' after function name")?;
        let mut args = vec![self.expr()?];
        while self.peek().kind == TokenKind::Comma {
            self.next();
            args.push(self.expr()?);
        }
        let close = self.peek().span.end;
        self.expect(TokenKind::RParen, "')'")?;

        let expected = if unary.is_some() { 1 } else { 2 };
        if args.len() != expected {
            return Err(CompileError::new(
                format!(
                    "'{name}' takes {expected} argument{}, got {}",
                    if expected == 1 { "" } else { "s" },
                    args.len()
                ),
                span.start..close,
            ));
        }
        let mut args = args.into_iter();
        let a = args.next().unwrap();
        Ok(match (unary, binary) {
            (Some(op), _) => Node::unary(op, a),
            (None, Some(op)) => Node::binary(op, a, args.next().unwrap()),
            (None, None) => unreachable!(),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Emits instructions to compute `node` into register `reg`
///
/// Registers above `reg` are free for scratch use; returns `Err(())` if the
/// register file runs out.
fn emit(node: &Node, reg: u8, out: &mut Vec<Instruction>) -> Result<(), ()> {
    if reg as usize >= REG_COUNT {
        return Err(());
    }
    match node {
        Node::Const(v) => out.push(Instruction::constant(reg, *v)),
        Node::Axis(a) => out.push(Instruction::input(reg, *a)),
        Node::Unary(op, a) => {
            emit(a, reg, out)?;
            out.push(Instruction::unary(*op, reg, reg));
        }
        Node::Pow(a, n) => {
            emit(a, reg, out)?;
            out.push(if *n == 2 {
                Instruction::unary(Opcode::Square, reg, reg)
            } else {
                Instruction::with_imm(Opcode::PowImm, reg, reg, *n as f32)
            });
        }
        Node::Binary(op, a, b) => match (op, a.as_ref(), b.as_ref()) {
            (Opcode::Add, v, Node::Const(c))
            | (Opcode::Add, Node::Const(c), v) => {
                emit(v, reg, out)?;
                out.push(Instruction::with_imm(Opcode::AddImm, reg, reg, *c));
            }
            (Opcode::Sub, v, Node::Const(c)) => {
                emit(v, reg, out)?;
                out.push(Instruction::with_imm(Opcode::AddImm, reg, reg, -c));
            }
            (Opcode::Sub, Node::Const(c), v) => {
                emit(v, reg, out)?;
                out.push(Instruction::unary(Opcode::Neg, reg, reg));
                out.push(Instruction::with_imm(Opcode::AddImm, reg, reg, *c));
            }
            (Opcode::Mul, v, Node::Const(c))
            | (Opcode::Mul, Node::Const(c), v) => {
                emit(v, reg, out)?;
                out.push(Instruction::with_imm(Opcode::MulImm, reg, reg, *c));
            }
            (Opcode::Div, v, Node::Const(c)) => {
                emit(v, reg, out)?;
                out.push(Instruction::with_imm(
                    Opcode::MulImm,
                    reg,
                    reg,
                    1.0 / c,
                ));
            }
            (op, a, b) => {
                let next = reg.checked_add(1).ok_or(())?;
                emit(a, reg, out)?;
                emit(b, next, out)?;
                out.push(Instruction::binary(*op, reg, reg, next));
            }
        },
    }
    Ok(())
}
