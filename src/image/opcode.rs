use thiserror::Error;

use super::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {byte:#04x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },
    #[error("truncated instruction at offset {offset}")]
    Truncated { offset: usize },
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Nop = 0x00,
    LdNull = 0x01,
    LdcI4 = 0x02,
    LdcI8 = 0x03,
    LdcR8 = 0x04,
    LdStr = 0x05,
    LdArg = 0x06,
    StArg = 0x07,
    LdLoc = 0x08,
    StLoc = 0x09,
    Dup = 0x0A,
    Pop = 0x0B,

    Add = 0x10,
    Sub = 0x11,
    Mul = 0x12,
    Div = 0x13,
    Rem = 0x14,
    Neg = 0x15,
    Ceq = 0x18,
    Clt = 0x19,
    Cgt = 0x1A,

    Br = 0x20,
    BrTrue = 0x21,
    BrFalse = 0x22,
    Leave = 0x23,

    Call = 0x30,
    NewObj = 0x31,
    Ret = 0x32,

    LdFld = 0x38,
    StFld = 0x39,
    LdSFld = 0x3A,
    StSFld = 0x3B,

    IsInst = 0x40,
    Throw = 0x41,
    EndFinally = 0x42,
}

/// Shape of the operand following an opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    I32,
    I64,
    F64,
    Var,
    Branch,
    Token,
}

impl OperandKind {
    pub const fn size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Var => 2,
            Self::I32 | Self::Branch | Self::Token => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

impl OpCode {
    pub const fn from_byte(byte: u8) -> Option<Self> {
        use OpCode::*;

        Some(match byte {
            0x00 => Nop,
            0x01 => LdNull,
            0x02 => LdcI4,
            0x03 => LdcI8,
            0x04 => LdcR8,
            0x05 => LdStr,
            0x06 => LdArg,
            0x07 => StArg,
            0x08 => LdLoc,
            0x09 => StLoc,
            0x0A => Dup,
            0x0B => Pop,
            0x10 => Add,
            0x11 => Sub,
            0x12 => Mul,
            0x13 => Div,
            0x14 => Rem,
            0x15 => Neg,
            0x18 => Ceq,
            0x19 => Clt,
            0x1A => Cgt,
            0x20 => Br,
            0x21 => BrTrue,
            0x22 => BrFalse,
            0x23 => Leave,
            0x30 => Call,
            0x31 => NewObj,
            0x32 => Ret,
            0x38 => LdFld,
            0x39 => StFld,
            0x3A => LdSFld,
            0x3B => StSFld,
            0x40 => IsInst,
            0x41 => Throw,
            0x42 => EndFinally,
            _ => return None,
        })
    }

    pub const fn operand_kind(self) -> OperandKind {
        use OpCode::*;

        match self {
            LdcI4 => OperandKind::I32,
            LdcI8 => OperandKind::I64,
            LdcR8 => OperandKind::F64,
            LdArg | StArg | LdLoc | StLoc => OperandKind::Var,
            Br | BrTrue | BrFalse | Leave => OperandKind::Branch,
            LdStr | Call | NewObj | LdFld | StFld | LdSFld | StSFld | IsInst => OperandKind::Token,
            _ => OperandKind::None,
        }
    }

    pub const fn mnemonic(self) -> &'static str {
        use OpCode::*;

        match self {
            Nop => "nop",
            LdNull => "ldnull",
            LdcI4 => "ldc.i4",
            LdcI8 => "ldc.i8",
            LdcR8 => "ldc.r8",
            LdStr => "ldstr",
            LdArg => "ldarg",
            StArg => "starg",
            LdLoc => "ldloc",
            StLoc => "stloc",
            Dup => "dup",
            Pop => "pop",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Rem => "rem",
            Neg => "neg",
            Ceq => "ceq",
            Clt => "clt",
            Cgt => "cgt",
            Br => "br",
            BrTrue => "brtrue",
            BrFalse => "brfalse",
            Leave => "leave",
            Call => "call",
            NewObj => "newobj",
            Ret => "ret",
            LdFld => "ldfld",
            StFld => "stfld",
            LdSFld => "ldsfld",
            StSFld => "stsfld",
            IsInst => "isinst",
            Throw => "throw",
            EndFinally => "endfinally",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    I32(i32),
    I64(i64),
    F64(f64),
    Var(u16),
    /// Offset relative to the start of the next instruction.
    Branch(i32),
    /// Raw token value; a metadata [`Token`] in an image, a reference table index in a linked body.
    Token(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: OpCode,
    pub operand: Operand,
}

impl Instruction {
    pub fn decode(code: &[u8], offset: usize) -> Result<Self, DecodeError> {
        let &byte = code.get(offset).ok_or(DecodeError::Truncated { offset })?;
        let opcode = OpCode::from_byte(byte).ok_or(DecodeError::UnknownOpcode { offset, byte })?;

        let kind = opcode.operand_kind();
        let bytes = code
            .get(offset + 1..offset + 1 + kind.size())
            .ok_or(DecodeError::Truncated { offset })?;

        let operand = match kind {
            OperandKind::None => Operand::None,
            OperandKind::I32 => Operand::I32(i32::from_le_bytes(array(bytes))),
            OperandKind::I64 => Operand::I64(i64::from_le_bytes(array(bytes))),
            OperandKind::F64 => Operand::F64(f64::from_le_bytes(array(bytes))),
            OperandKind::Var => Operand::Var(u16::from_le_bytes(array(bytes))),
            OperandKind::Branch => Operand::Branch(i32::from_le_bytes(array(bytes))),
            OperandKind::Token => Operand::Token(u32::from_le_bytes(array(bytes))),
        };

        Ok(Self {
            offset,
            opcode,
            operand,
        })
    }

    pub fn len(&self) -> usize {
        1 + self.opcode.operand_kind().size()
    }

    pub fn next_offset(&self) -> usize {
        self.offset + self.len()
    }

    /// Absolute target of a branch instruction. May be out of bounds for malformed code.
    pub fn branch_target(&self) -> Option<i64> {
        match self.operand {
            Operand::Branch(rel) => Some(self.next_offset() as i64 + rel as i64),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(raw) => Some(Token::from_raw(raw)),
            _ => None,
        }
    }

    /// Byte range of the operand within the code buffer.
    pub fn operand_range(&self) -> std::ops::Range<usize> {
        self.offset + 1..self.next_offset()
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0; N];
    out.copy_from_slice(bytes);
    out
}

/// Linear decoder over a code buffer.
pub struct Instructions<'a> {
    code: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            offset: 0,
            failed: false,
        }
    }
}

impl Iterator for Instructions<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.code.len() {
            return None;
        }

        let decoded = Instruction::decode(self.code, self.offset);
        match &decoded {
            Ok(instr) => self.offset = instr.next_offset(),
            Err(_) => self.failed = true,
        }

        Some(decoded)
    }
}
