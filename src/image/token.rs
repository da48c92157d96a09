use std::fmt;

use serde::{Deserialize, Serialize};

/// Metadata table a [`Token`] points into.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldDef = 0x04,
    MethodDef = 0x06,
    MemberRef = 0x0A,
    UserString = 0x70,
}

impl Table {
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::TypeRef),
            0x02 => Some(Self::TypeDef),
            0x04 => Some(Self::FieldDef),
            0x06 => Some(Self::MethodDef),
            0x0A => Some(Self::MemberRef),
            0x70 => Some(Self::UserString),
            _ => None,
        }
    }
}

/// A module-relative reference: table tag in the high byte, 1-based row in the low 24 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(u32);

impl Token {
    pub const NIL: Token = Token(0);

    const ROW_MASK: u32 = 0x00FF_FFFF;

    pub const fn new(table: Table, row: u32) -> Self {
        Self(((table as u32) << 24) | (row & Self::ROW_MASK))
    }

    /// Builds the token for the zero-based `index` of `table`.
    pub const fn from_index(table: Table, index: usize) -> Self {
        Self::new(table, index as u32 + 1)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn table(self) -> Option<Table> {
        Table::from_tag((self.0 >> 24) as u8)
    }

    pub const fn row(self) -> u32 {
        self.0 & Self::ROW_MASK
    }

    /// Zero-based row index, `None` for a nil row.
    pub const fn index(self) -> Option<usize> {
        match self.row() {
            0 => None,
            row => Some(row as usize - 1),
        }
    }

    pub const fn is_nil(self) -> bool {
        self.row() == 0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:#010x})", self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
