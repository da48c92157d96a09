use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSig {
    Void,
    I32,
    I64,
    F64,
    String,
    Object,
    /// A named class, by full name (`Namespace.Outer+Inner`).
    Class(String),
    /// Generic parameter of the declaring type.
    Var(u16),
    /// Generic parameter of the method.
    MVar(u16),
}

impl TypeSig {
    pub fn class(full_name: impl Into<String>) -> Self {
        Self::Class(full_name.into())
    }

    pub fn is_generic_param(&self) -> bool {
        matches!(self, Self::Var(_) | Self::MVar(_))
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::F64 => f.write_str("f64"),
            Self::String => f.write_str("string"),
            Self::Object => f.write_str("object"),
            Self::Class(name) => f.write_str(name),
            Self::Var(n) => write!(f, "!{n}"),
            Self::MVar(n) => write!(f, "!!{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSig {
    pub params: Vec<TypeSig>,
    pub ret: TypeSig,
}

impl MethodSig {
    pub fn new(params: impl IntoIterator<Item = TypeSig>, ret: TypeSig) -> Self {
        Self {
            params: params.into_iter().collect(),
            ret,
        }
    }

    pub fn nullary(ret: TypeSig) -> Self {
        Self {
            params: Vec::new(),
            ret,
        }
    }
}

impl fmt::Display for MethodSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.ret)
    }
}
