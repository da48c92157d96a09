//! On-disk module images.
//!
//! An image starts with a small fixed header carrying the module identity, so
//! the identity can be checked without decoding the rest of the file, followed
//! by the metadata tables encoded as MessagePack.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod builder;
mod marker;
mod opcode;
mod sig;
mod token;

pub use builder::{Asm, AsmError, ImageBuilder, Label};
pub use marker::Markers;
pub use opcode::{DecodeError, Instruction, Instructions, OpCode, Operand, OperandKind};
pub use sig::{MethodSig, TypeSig};
pub use token::{Table, Token};

pub const MAGIC: [u8; 4] = *b"HSMD";
pub const FORMAT_VERSION: u16 = 1;

const HEADER_LEN: usize = MAGIC.len() + 2 + 2;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("not a module image")]
    BadMagic,
    #[error("unsupported image format version {0}")]
    UnsupportedVersion(u16),
    #[error("identity is not valid UTF-8")]
    BadIdentity,
    #[error("header identity {header:?} does not match tables identity {tables:?}")]
    IdentityMismatch { header: String, tables: String },
    #[error("malformed tables: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode tables: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("malformed image: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub name: String,
    pub version: String,
    pub types: Vec<TypeDef>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
    pub type_refs: Vec<TypeRef>,
    pub member_refs: Vec<MemberRef>,
    pub strings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub namespace: String,
    pub name: String,
    /// Index of the enclosing type. Enclosing types always precede their nested types.
    pub declaring_type: Option<u32>,
    pub base_type: Option<Token>,
    pub generic_arity: u16,
    pub attributes: Vec<String>,
    #[serde(skip)]
    pub markers: Markers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub owner: u32,
    pub name: String,
    pub ty: TypeSig,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub owner: u32,
    pub name: String,
    pub sig: MethodSig,
    pub is_static: bool,
    pub generic_arity: u16,
    pub attributes: Vec<String>,
    /// `None` for abstract and extern methods.
    pub body: Option<MethodBody>,
    #[serde(skip)]
    pub markers: Markers,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub max_stack: u16,
    pub locals: Vec<TypeSig>,
    pub code: Vec<u8>,
    pub regions: Vec<ExceptionRegion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    /// Catches exceptions assignable to the referenced type.
    Catch(Token),
    Finally,
    Fault,
}

/// A protected range and its handler, as byte offsets into the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRegion {
    pub kind: RegionKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    /// Name of the module expected to define the type, if pinned.
    pub module: Option<String>,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRef {
    /// A `TypeRef` or `TypeDef` token.
    pub parent: Token,
    pub name: String,
    pub kind: MemberRefKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberRefKind {
    Method {
        sig: MethodSig,
        is_static: bool,
        generic_arity: u16,
    },
    Field {
        ty: TypeSig,
        is_static: bool,
    },
}

impl ModuleImage {
    pub fn identity(&self) -> String {
        format_identity(&self.name, &self.version)
    }

    /// Reads just the identity string from the header of an image file.
    pub fn read_identity(path: impl AsRef<Path>) -> Result<String, ImageError> {
        let mut file = File::open(path)?;

        let mut header = [0; HEADER_LEN];
        file.read_exact(&mut header)?;
        let identity_len = check_header(&header)?;

        let mut identity = vec![0; identity_len];
        file.read_exact(&mut identity)?;

        String::from_utf8(identity).map_err(|_| ImageError::BadIdentity)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ImageError> {
        let header = bytes.get(..HEADER_LEN).ok_or(ImageError::BadMagic)?;
        let identity_len = check_header(header)?;

        let identity = bytes
            .get(HEADER_LEN..HEADER_LEN + identity_len)
            .ok_or_else(|| ImageError::Malformed("truncated identity".into()))?;
        let identity = std::str::from_utf8(identity).map_err(|_| ImageError::BadIdentity)?;

        let mut image: ModuleImage = rmp_serde::from_slice(&bytes[HEADER_LEN + identity_len..])?;

        if image.identity() != identity {
            return Err(ImageError::IdentityMismatch {
                header: identity.to_owned(),
                tables: image.identity(),
            });
        }

        image.validate()?;
        image.resolve_markers();

        Ok(image)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let identity = self.identity();
        let identity_len = u16::try_from(identity.len())
            .map_err(|_| ImageError::Malformed("identity too long".into()))?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + identity.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&identity_len.to_le_bytes());
        bytes.extend_from_slice(identity.as_bytes());
        bytes.extend(rmp_serde::to_vec_named(self)?);

        Ok(bytes)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Full name of the type at `index`, `Namespace.Outer+Inner` for nested types.
    pub fn full_type_name(&self, index: usize) -> String {
        let ty = &self.types[index];
        match ty.declaring_type {
            Some(outer) => format!("{}+{}", self.full_type_name(outer as usize), ty.name),
            None => join_name(&ty.namespace, &ty.name),
        }
    }

    /// Enclosing types of the type at `index`, innermost first.
    pub fn declaring_chain(&self, index: usize) -> impl Iterator<Item = &TypeDef> {
        let mut next = self.types[index].declaring_type;
        std::iter::from_fn(move || {
            let ty = &self.types[next? as usize];
            next = ty.declaring_type;
            Some(ty)
        })
    }

    pub fn methods_of(&self, type_index: usize) -> impl Iterator<Item = (usize, &MethodDef)> {
        self.methods
            .iter()
            .enumerate()
            .filter(move |(_, method)| method.owner as usize == type_index)
    }

    pub fn fields_of(&self, type_index: usize) -> impl Iterator<Item = (usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .filter(move |(_, field)| field.owner as usize == type_index)
    }

    pub fn find_type(&self, full_name: &str) -> Option<usize> {
        (0..self.types.len()).find(|&index| self.full_type_name(index) == full_name)
    }

    pub fn string(&self, token: Token) -> Option<&str> {
        match token.table() {
            Some(Table::UserString) => self.strings.get(token.index()?).map(String::as_str),
            _ => None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ImageError> {
        for (index, ty) in self.types.iter().enumerate() {
            if let Some(outer) = ty.declaring_type
                && outer as usize >= index
            {
                return Err(ImageError::Malformed(format!(
                    "type {} is declared inside a type that does not precede it",
                    ty.name
                )));
            }
        }

        let owners = self
            .fields
            .iter()
            .map(|f| (f.owner, &f.name))
            .chain(self.methods.iter().map(|m| (m.owner, &m.name)));

        for (owner, name) in owners {
            if owner as usize >= self.types.len() {
                return Err(ImageError::Malformed(format!(
                    "member {name} has out of range owner {owner}"
                )));
            }
        }

        Ok(())
    }

    fn resolve_markers(&mut self) {
        for ty in &mut self.types {
            ty.markers = Markers::from_attributes(&ty.attributes);
        }
        for method in &mut self.methods {
            method.markers = Markers::from_attributes(&method.attributes);
        }
    }
}

pub fn format_identity(name: &str, version: &str) -> String {
    format!("{name}, Version={version}")
}

pub(crate) fn join_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{namespace}.{name}")
    }
}

fn check_header(header: &[u8]) -> Result<usize, ImageError> {
    if header[..MAGIC.len()] != MAGIC {
        return Err(ImageError::BadMagic);
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }

    Ok(u16::from_le_bytes([header[6], header[7]]) as usize)
}
