//! Instruction tape format
//!
//! A tape is a linear list of fixed-width instructions for a register-based
//! evaluator.  It is evaluated once per region with interval arithmetic (to
//! classify the region) and once per pixel with plain `f32` arithmetic (in the
//! terminal pass).
//!
//! # Wire format
//! On the wire (and in the GPU tape buffer), a tape is a little-endian `u32`
//! instruction count, followed by that many 8-byte instructions:
//!
//! | Byte | Value                                       |
//! |------|---------------------------------------------|
//! | 0    | output register                             |
//! | 1    | right-hand input register                   |
//! | 2    | left-hand input register                    |
//! | 3    | opcode                                      |
//! | 4-7  | `f32` immediate (little-endian)             |
//!
//! Read as a little-endian `u32`, the first word unpacks into
//! `(out, rhs, lhs, opcode)`; the interpreter relies on this ordering.
//! Depending on the opcode, some of these bytes are unused and written as 0.
//!
//! ## Evaluation
//! All [`REG_COUNT`] registers start at zero.  After the last instruction,
//! register 0 holds the result, so an empty tape evaluates to 0 everywhere.
//!
//! ## Opcode values
//! Opcode values are generated automatically from [`Opcode`] variants, in
//! declaration order; use [`iter_ops`] to get `(name, value)` pairs.
use crate::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, little_endian};

/// Size of the evaluator's register file
pub const REG_COUNT: usize = 64;

/// Size of the tape header, in bytes
pub const HEADER_SIZE: usize = 4;

/// Default maximum instruction count for a tape buffer
pub const MAX_INSTS: u32 = 100_000;

/// Tape operation
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    strum::EnumIter,
    strum::IntoStaticStr,
    strum::FromRepr,
)]
#[repr(u8)]
pub enum Opcode {
    /// Reads an input axis; `lhs` is the axis index (0 = X, 1 = Y, 2 = Z)
    Input,
    /// Writes the immediate
    Const,

    /// Negates `lhs`
    Neg,
    /// Absolute value of `lhs`
    Abs,
    /// Squares `lhs`
    Square,
    /// Square root of `lhs`
    Sqrt,
    /// Sine of `lhs`
    Sin,
    /// Cosine of `lhs`
    Cos,
    /// Natural exponent of `lhs`
    Exp,
    /// Natural logarithm of `lhs`
    Ln,

    /// `lhs + rhs`
    Add,
    /// `lhs - rhs`
    Sub,
    /// `lhs * rhs`
    Mul,
    /// `lhs / rhs`
    Div,
    /// Minimum of `lhs` and `rhs`
    Min,
    /// Maximum of `lhs` and `rhs`
    Max,

    /// `lhs + imm`
    AddImm,
    /// `lhs * imm`
    MulImm,
    /// `lhs` raised to the integer power `imm`
    PowImm,
}

impl Opcode {
    /// Returns the number of register inputs used by this opcode
    pub fn arity(&self) -> usize {
        match self {
            Opcode::Input | Opcode::Const => 0,
            Opcode::Neg
            | Opcode::Abs
            | Opcode::Square
            | Opcode::Sqrt
            | Opcode::Sin
            | Opcode::Cos
            | Opcode::Exp
            | Opcode::Ln
            | Opcode::AddImm
            | Opcode::MulImm
            | Opcode::PowImm => 1,
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Min
            | Opcode::Max => 2,
        }
    }
}

/// Iterates over opcode `(names, value)` tuples, with names in `CamelCase`
///
/// This is a helper function for defining constants in a shader interpreter
pub fn iter_ops<'a>() -> impl Iterator<Item = (&'a str, u8)> {
    use strum::IntoEnumIterator;

    Opcode::iter().map(|op| {
        let s: &'static str = op.into();
        (s, op as u8)
    })
}

/// Single 8-byte tape instruction
#[derive(Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Instruction {
    out: u8,
    rhs: u8,
    lhs: u8,
    opcode: u8,
    imm: little_endian::F32,
}
static_assertions::const_assert_eq!(std::mem::size_of::<Instruction>(), 8);
static_assertions::const_assert_eq!(std::mem::align_of::<Instruction>(), 1);

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Instruction");
        match self.opcode() {
            Some(op) => d.field("opcode", &op),
            None => d.field("opcode", &self.opcode),
        };
        d.field("out", &self.out)
            .field("lhs", &self.lhs)
            .field("rhs", &self.rhs)
            .field("imm", &self.imm())
            .finish()
    }
}

impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Instruction {
    /// Builds an instruction from its raw fields
    pub fn new(opcode: Opcode, out: u8, lhs: u8, rhs: u8, imm: f32) -> Self {
        Self {
            out,
            rhs,
            lhs,
            opcode: opcode as u8,
            imm: little_endian::F32::new(imm),
        }
    }
    /// Reads input axis `axis` into register `out`
    pub fn input(out: u8, axis: u8) -> Self {
        Self::new(Opcode::Input, out, axis, 0, 0.0)
    }
    /// Writes the constant `imm` into register `out`
    pub fn constant(out: u8, imm: f32) -> Self {
        Self::new(Opcode::Const, out, 0, 0, imm)
    }
    /// Builds a single-input operation
    pub fn unary(opcode: Opcode, out: u8, lhs: u8) -> Self {
        Self::new(opcode, out, lhs, 0, 0.0)
    }
    /// Builds a two-input operation
    pub fn binary(opcode: Opcode, out: u8, lhs: u8, rhs: u8) -> Self {
        Self::new(opcode, out, lhs, rhs, 0.0)
    }
    /// Builds a register-immediate operation
    pub fn with_imm(opcode: Opcode, out: u8, lhs: u8, imm: f32) -> Self {
        Self::new(opcode, out, lhs, 0, imm)
    }

    /// Returns the decoded opcode, or `None` if the byte is unknown
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_repr(self.opcode)
    }
    /// Output register
    pub fn out(&self) -> u8 {
        self.out
    }
    /// Left-hand input register (or axis index, for [`Opcode::Input`])
    pub fn lhs(&self) -> u8 {
        self.lhs
    }
    /// Right-hand input register
    pub fn rhs(&self) -> u8 {
        self.rhs
    }
    /// Immediate value
    pub fn imm(&self) -> f32 {
        self.imm.get()
    }
}

/// Validated instruction tape
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Tape {
    instructions: Vec<Instruction>,
}

impl Tape {
    /// Builds a tape, checking opcodes and register indices
    pub fn new(instructions: Vec<Instruction>) -> Result<Self, Error> {
        for (index, inst) in instructions.iter().enumerate() {
            let Some(op) = inst.opcode() else {
                return Err(Error::UnknownOpcode {
                    opcode: inst.opcode,
                    index,
                });
            };
            let check = |reg: u8| {
                if (reg as usize) < REG_COUNT {
                    Ok(())
                } else {
                    Err(Error::BadRegister { reg, index })
                }
            };
            check(inst.out)?;
            match op.arity() {
                0 if op == Opcode::Input && inst.lhs > 2 => {
                    return Err(Error::BadRegister {
                        reg: inst.lhs,
                        index,
                    });
                }
                0 => (),
                1 => check(inst.lhs)?,
                _ => {
                    check(inst.lhs)?;
                    check(inst.rhs)?;
                }
            }
        }
        Ok(Self { instructions })
    }

    /// Parses a tape from its wire format (header included)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let (count, rest) = little_endian::U32::read_from_prefix(bytes)
            .map_err(|_| Error::MissingTapeHeader)?;
        let count = count.get();
        if rest.len() != count as usize * std::mem::size_of::<Instruction>() {
            return Err(Error::BadTapeLength {
                expected: count,
                actual: rest.len(),
            });
        }
        let instructions = <[Instruction]>::ref_from_bytes(rest)
            .map_err(|_| Error::BadTapeLength {
                expected: count,
                actual: rest.len(),
            })?
            .to_vec();
        Self::new(instructions)
    }

    /// Serializes the tape into its wire format (header included)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.byte_len());
        out.extend_from_slice(
            little_endian::U32::new(self.len() as u32).as_bytes(),
        );
        out.extend_from_slice(self.instruction_bytes());
        out
    }

    /// Returns the number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Checks whether the tape is empty
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Returns the size of the instruction data (without header), in bytes
    pub fn byte_len(&self) -> usize {
        std::mem::size_of_val(self.instructions.as_slice())
    }

    /// Returns the instructions in evaluation order
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns the raw instruction bytes (without header)
    pub fn instruction_bytes(&self) -> &[u8] {
        self.instructions.as_bytes()
    }
}

/// Point evaluation on the CPU, used to check GPU results
#[cfg(test)]
pub(crate) fn eval_point(tape: &Tape, x: f32, y: f32, z: f32) -> f32 {
    let mut regs = [0f32; REG_COUNT];
    for inst in tape.instructions() {
        let a = regs[inst.lhs() as usize % REG_COUNT];
        let b = regs[inst.rhs() as usize % REG_COUNT];
        let v = match inst.opcode().unwrap() {
            Opcode::Input => [x, y, z][inst.lhs() as usize],
            Opcode::Const => inst.imm(),
            Opcode::Neg => -a,
            Opcode::Abs => a.abs(),
            Opcode::Square => a * a,
            Opcode::Sqrt => a.sqrt(),
            Opcode::Sin => a.sin(),
            Opcode::Cos => a.cos(),
            Opcode::Exp => a.exp(),
            Opcode::Ln => a.ln(),
            Opcode::Add => a + b,
            Opcode::Sub => a - b,
            Opcode::Mul => a * b,
            Opcode::Div => a / b,
            Opcode::Min => a.min(b),
            Opcode::Max => a.max(b),
            Opcode::AddImm => a + inst.imm(),
            Opcode::MulImm => a * inst.imm(),
            Opcode::PowImm => a.powi(inst.imm() as i32),
        };
        regs[inst.out() as usize] = v;
    }
    regs[0]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_values() {
        for (i, (_name, op)) in iter_ops().enumerate() {
            assert_eq!(i, op as usize);
            let op = Opcode::from_repr(op).unwrap();
            assert_eq!(Opcode::from_repr(op as u8), Some(op));
        }
        assert!(Opcode::from_repr(iter_ops().count() as u8).is_none());
    }

    #[test]
    fn instruction_layout() {
        let i = Instruction::binary(Opcode::Sub, 1, 2, 3);
        assert_eq!(i.as_bytes(), [1, 3, 2, Opcode::Sub as u8, 0, 0, 0, 0]);

        let i = Instruction::with_imm(Opcode::AddImm, 4, 5, -4.0);
        let mut expected = vec![4, 0, 5, Opcode::AddImm as u8];
        expected.extend((-4.0f32).to_le_bytes());
        assert_eq!(i.as_bytes(), expected);

        // The interpreter reads the first word as `unpack4xU8(word)`
        let word = u32::from_le_bytes(i.as_bytes()[..4].try_into().unwrap());
        assert_eq!(word & 0xFF, 4);
        assert_eq!(word >> 24, Opcode::AddImm as u32);
    }

    #[test]
    fn wire_round_trip() {
        let tape = Tape::new(vec![
            Instruction::input(0, 0),
            Instruction::unary(Opcode::Square, 0, 0),
            Instruction::with_imm(Opcode::AddImm, 0, 0, -1.0),
        ])
        .unwrap();
        let bytes = tape.to_bytes();
        assert_eq!(bytes.len(), 4 + 3 * 8);
        assert_eq!(&bytes[..4], &3u32.to_le_bytes());
        assert_eq!(Tape::from_bytes(&bytes).unwrap(), tape);

        let empty = Tape::default();
        assert_eq!(empty.to_bytes(), vec![0, 0, 0, 0]);
        assert!(Tape::from_bytes(&empty.to_bytes()).unwrap().is_empty());
    }

    #[test]
    fn bad_bytes() {
        assert!(matches!(
            Tape::from_bytes(&[1, 0]),
            Err(Error::MissingTapeHeader)
        ));

        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend([0u8; 8]);
        assert!(matches!(
            Tape::from_bytes(&bytes),
            Err(Error::BadTapeLength {
                expected: 2,
                actual: 8
            })
        ));

        let mut bytes = 1u32.to_le_bytes().to_vec();
        bytes.extend([0, 0, 0, 0xEE, 0, 0, 0, 0]);
        assert!(matches!(
            Tape::from_bytes(&bytes),
            Err(Error::UnknownOpcode {
                opcode: 0xEE,
                index: 0
            })
        ));
    }

    #[test]
    fn bad_registers() {
        let r = Tape::new(vec![Instruction::input(0, 3)]);
        assert!(matches!(r, Err(Error::BadRegister { reg: 3, index: 0 })));

        let r = Tape::new(vec![
            Instruction::constant(0, 1.0),
            Instruction::binary(Opcode::Add, 0, 0, REG_COUNT as u8),
        ]);
        assert!(matches!(r, Err(Error::BadRegister { index: 1, .. })));

        let r = Tape::new(vec![Instruction::constant(REG_COUNT as u8, 1.0)]);
        assert!(matches!(r, Err(Error::BadRegister { index: 0, .. })));
    }

    #[test]
    fn point_eval() {
        let tape = Tape::new(vec![
            Instruction::input(0, 0),
            Instruction::unary(Opcode::Square, 0, 0),
            Instruction::input(1, 1),
            Instruction::unary(Opcode::Square, 1, 1),
            Instruction::binary(Opcode::Add, 0, 0, 1),
            Instruction::with_imm(Opcode::AddImm, 0, 0, -4.0),
        ])
        .unwrap();
        assert_eq!(eval_point(&tape, 0.0, 0.0, 0.0), -4.0);
        assert_eq!(eval_point(&tape, 2.0, 0.0, 0.0), 0.0);
        assert_eq!(eval_point(&tape, 3.0, 4.0, 0.0), 21.0);
        assert_eq!(eval_point(&Tape::default(), 1.0, 2.0, 3.0), 0.0);
    }
}
