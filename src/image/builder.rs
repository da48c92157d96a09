use thiserror::Error;

use super::{
    ExceptionRegion, FieldDef, MemberRef, MemberRefKind, MethodBody, MethodDef, MethodSig,
    ModuleImage, OpCode, OperandKind, RegionKind, Table, Token, TypeDef, TypeRef, TypeSig,
};

/// Incrementally builds a [`ModuleImage`].
///
/// Tokens handed out by the builder are valid in the finished image. Methods may be
/// defined before their bodies are attached, so bodies can reference methods defined
/// later.
///
/// # Panics
///
/// Methods taking a [`Token`] panic if it was not handed out by this builder for the
/// expected table, such as a field token passed where a type is required.
pub struct ImageBuilder {
    image: ModuleImage,
}

impl ImageBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            image: ModuleImage {
                name: name.into(),
                version: version.into(),
                ..ModuleImage::default()
            },
        }
    }

    pub fn define_type(&mut self, namespace: &str, name: &str) -> Token {
        self.push_type(TypeDef {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            ..TypeDef::default()
        })
    }

    pub fn define_nested_type(&mut self, declaring: Token, name: &str) -> Token {
        let outer = self.row(declaring, Table::TypeDef) as u32;
        self.push_type(TypeDef {
            name: name.to_owned(),
            declaring_type: Some(outer),
            ..TypeDef::default()
        })
    }

    pub fn set_base_type(&mut self, ty: Token, base: Token) {
        let index = self.row(ty, Table::TypeDef);
        self.image.types[index].base_type = Some(base);
    }

    pub fn set_type_generic_arity(&mut self, ty: Token, arity: u16) {
        let index = self.row(ty, Table::TypeDef);
        self.image.types[index].generic_arity = arity;
    }

    pub fn define_field(&mut self, owner: Token, name: &str, ty: TypeSig, is_static: bool) -> Token {
        let owner = self.row(owner, Table::TypeDef) as u32;
        self.image.fields.push(FieldDef {
            owner,
            name: name.to_owned(),
            ty,
            is_static,
        });
        Token::from_index(Table::FieldDef, self.image.fields.len() - 1)
    }

    pub fn define_method(&mut self, owner: Token, name: &str, sig: MethodSig, is_static: bool) -> Token {
        let owner = self.row(owner, Table::TypeDef) as u32;
        self.image.methods.push(MethodDef {
            owner,
            name: name.to_owned(),
            sig,
            is_static,
            generic_arity: 0,
            attributes: Vec::new(),
            body: None,
            markers: Default::default(),
        });
        Token::from_index(Table::MethodDef, self.image.methods.len() - 1)
    }

    pub fn set_method_generic_arity(&mut self, method: Token, arity: u16) {
        let index = self.row(method, Table::MethodDef);
        self.image.methods[index].generic_arity = arity;
    }

    pub fn set_body(&mut self, method: Token, body: MethodBody) {
        let index = self.row(method, Table::MethodDef);
        self.image.methods[index].body = Some(body);
    }

    /// Attaches a custom attribute to a type or method.
    ///
    /// # Panics
    ///
    /// If `target` is neither a type nor a method definition.
    pub fn add_attribute(&mut self, target: Token, attribute: &str) {
        let attributes = match target.table() {
            Some(Table::TypeDef) => {
                let index = self.row(target, Table::TypeDef);
                &mut self.image.types[index].attributes
            }
            Some(Table::MethodDef) => {
                let index = self.row(target, Table::MethodDef);
                &mut self.image.methods[index].attributes
            }
            _ => panic!("attributes can only be attached to types and methods, got {target}"),
        };
        attributes.push(attribute.to_owned());
    }

    pub fn type_ref(&mut self, module: Option<&str>, full_name: &str) -> Token {
        let type_ref = TypeRef {
            module: module.map(str::to_owned),
            full_name: full_name.to_owned(),
        };

        let index = match self.image.type_refs.iter().position(|r| *r == type_ref) {
            Some(index) => index,
            None => {
                self.image.type_refs.push(type_ref);
                self.image.type_refs.len() - 1
            }
        };
        Token::from_index(Table::TypeRef, index)
    }

    pub fn method_ref(&mut self, parent: Token, name: &str, sig: MethodSig, is_static: bool) -> Token {
        self.push_member_ref(MemberRef {
            parent,
            name: name.to_owned(),
            kind: MemberRefKind::Method {
                sig,
                is_static,
                generic_arity: 0,
            },
        })
    }

    pub fn field_ref(&mut self, parent: Token, name: &str, ty: TypeSig, is_static: bool) -> Token {
        self.push_member_ref(MemberRef {
            parent,
            name: name.to_owned(),
            kind: MemberRefKind::Field { ty, is_static },
        })
    }

    pub fn string(&mut self, value: &str) -> Token {
        let index = match self.image.strings.iter().position(|s| s == value) {
            Some(index) => index,
            None => {
                self.image.strings.push(value.to_owned());
                self.image.strings.len() - 1
            }
        };
        Token::from_index(Table::UserString, index)
    }

    pub fn finish(mut self) -> ModuleImage {
        self.image.resolve_markers();
        self.image
    }

    fn push_type(&mut self, ty: TypeDef) -> Token {
        self.image.types.push(ty);
        Token::from_index(Table::TypeDef, self.image.types.len() - 1)
    }

    fn push_member_ref(&mut self, member: MemberRef) -> Token {
        self.image.member_refs.push(member);
        Token::from_index(Table::MemberRef, self.image.member_refs.len() - 1)
    }

    fn row(&self, token: Token, table: Table) -> usize {
        match (token.table(), token.index()) {
            (Some(t), Some(index)) if t == table => index,
            _ => panic!("expected a {table:?} token, got {token}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("label {0} was never marked")]
    UnboundLabel(usize),
    #[error("branch to label {0} is out of range")]
    BranchOutOfRange(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

struct Fixup {
    operand_at: usize,
    next_offset: usize,
    label: Label,
}

struct PendingRegion {
    kind: RegionKind,
    bounds: [Label; 4],
}

/// Label-based assembler producing a [`MethodBody`].
#[derive(Default)]
pub struct Asm {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    regions: Vec<PendingRegion>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    pub fn op(&mut self, opcode: OpCode) -> &mut Self {
        debug_assert_eq!(
            opcode.operand_kind(),
            OperandKind::None,
            "{} takes an operand",
            opcode.mnemonic()
        );
        self.code.push(opcode as u8);
        self
    }

    pub fn ldc_i4(&mut self, value: i32) -> &mut Self {
        self.code.push(OpCode::LdcI4 as u8);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_i8(&mut self, value: i64) -> &mut Self {
        self.code.push(OpCode::LdcI8 as u8);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn ldc_r8(&mut self, value: f64) -> &mut Self {
        self.code.push(OpCode::LdcR8 as u8);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// `ldarg`, `starg`, `ldloc` or `stloc`.
    pub fn var(&mut self, opcode: OpCode, index: u16) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Var);
        self.code.push(opcode as u8);
        self.code.extend_from_slice(&index.to_le_bytes());
        self
    }

    pub fn ldarg(&mut self, index: u16) -> &mut Self {
        self.var(OpCode::LdArg, index)
    }

    pub fn ldloc(&mut self, index: u16) -> &mut Self {
        self.var(OpCode::LdLoc, index)
    }

    pub fn stloc(&mut self, index: u16) -> &mut Self {
        self.var(OpCode::StLoc, index)
    }

    pub fn token(&mut self, opcode: OpCode, token: Token) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Token);
        self.code.push(opcode as u8);
        self.code.extend_from_slice(&token.raw().to_le_bytes());
        self
    }

    pub fn call(&mut self, method: Token) -> &mut Self {
        self.token(OpCode::Call, method)
    }

    pub fn branch(&mut self, opcode: OpCode, label: Label) -> &mut Self {
        debug_assert_eq!(opcode.operand_kind(), OperandKind::Branch);
        self.code.push(opcode as u8);
        let operand_at = self.code.len();
        self.code.extend_from_slice(&[0; 4]);
        self.fixups.push(Fixup {
            operand_at,
            next_offset: self.code.len(),
            label,
        });
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(OpCode::Ret)
    }

    /// Declares a protected region `[try_start, try_end)` handled by `[handler_start, handler_end)`.
    /// Regions must be declared innermost first.
    pub fn region(
        &mut self,
        kind: RegionKind,
        try_start: Label,
        try_end: Label,
        handler_start: Label,
        handler_end: Label,
    ) -> &mut Self {
        self.regions.push(PendingRegion {
            kind,
            bounds: [try_start, try_end, handler_start, handler_end],
        });
        self
    }

    pub fn finish(self, max_stack: u16, locals: Vec<TypeSig>) -> Result<MethodBody, AsmError> {
        let Self {
            mut code,
            labels,
            fixups,
            regions,
        } = self;

        let resolve = |label: Label| labels[label.0].ok_or(AsmError::UnboundLabel(label.0));

        for fixup in fixups {
            let target = resolve(fixup.label)? as i64;
            let rel = i32::try_from(target - fixup.next_offset as i64)
                .map_err(|_| AsmError::BranchOutOfRange(fixup.label.0))?;
            code[fixup.operand_at..fixup.operand_at + 4].copy_from_slice(&rel.to_le_bytes());
        }

        let regions = regions
            .into_iter()
            .map(|region| {
                let [try_start, try_end, handler_start, handler_end] =
                    region.bounds.map(|label| resolve(label).map(|offset| offset as u32));
                Ok(ExceptionRegion {
                    kind: region.kind,
                    try_start: try_start?,
                    try_end: try_end?,
                    handler_start: handler_start?,
                    handler_end: handler_end?,
                })
            })
            .collect::<Result<_, AsmError>>()?;

        Ok(MethodBody {
            max_stack,
            locals,
            code,
            regions,
        })
    }
}
