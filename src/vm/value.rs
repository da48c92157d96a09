use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

use super::{FieldId, TypeId};
use crate::image::TypeSig;

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    I32(i32),
    I64(i64),
    F64(f64),
    Str(Rc<str>),
    Obj(Rc<RefCell<Object>>),
}

#[derive(Debug)]
pub struct Object {
    pub ty: TypeId,
    pub fields: HashMap<FieldId, Value>,
}

impl Value {
    pub fn default_for(ty: &TypeSig) -> Self {
        match ty {
            TypeSig::I32 => Self::I32(0),
            TypeSig::I64 => Self::I64(0),
            TypeSig::F64 => Self::F64(0.0),
            _ => Self::Null,
        }
    }

    pub fn new_object(ty: TypeId) -> Self {
        Self::Obj(Rc::new(RefCell::new(Object {
            ty,
            fields: HashMap::new(),
        })))
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::I32(v) => *v != 0,
            Self::I64(v) => *v != 0,
            Self::F64(v) => *v != 0.0,
            Self::Str(_) | Self::Obj(_) => true,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn object_type(&self) -> Option<TypeId> {
        match self {
            Self::Obj(obj) => Some(obj.borrow().ty),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Obj(a), Self::Obj(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
            Self::Obj(obj) => write!(f, "<object of type {}>", obj.borrow().ty),
        }
    }
}
