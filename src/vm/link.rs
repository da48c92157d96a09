use std::rc::Rc;

use thiserror::Error;

use super::{
    BodyBuilder, CodeBody, FieldId, FunctionId, Handler, HandlerKind, LiveRef, ModuleId, Runtime,
    TypeId, VerifyError,
};
use crate::image::{
    DecodeError, Instructions, MemberRefKind, MethodBody, MethodSig, ModuleImage, RegionKind, Table,
    Token, TypeSig,
};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("token {0} is not valid in this image")]
    BadToken(Token),
    #[error("type {0} is not loaded")]
    MissingType(String),
    #[error("function {0} does not exist in the live module")]
    MissingFunction(String),
    #[error("field {0} does not exist in the live module")]
    MissingField(String),
    #[error("{0} matches more than one live function")]
    Ambiguous(String),
    #[error("return type of {name} changed from {live} to {image}")]
    ReturnTypeChanged {
        name: String,
        live: TypeSig,
        image: TypeSig,
    },
    #[error("field {0} changed type or storage")]
    FieldChanged(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Resolves the tokens of one image against the live runtime.
///
/// Definitions (`TypeDef`, `MethodDef`, `FieldDef`) resolve by name and signature inside
/// the live module the image belongs to; references resolve across all loaded modules.
/// Nothing is created: a token whose target does not exist live is an error.
pub struct Linker<'a> {
    runtime: &'a Runtime,
    image: &'a ModuleImage,
    module: ModuleId,
}

impl<'a> Linker<'a> {
    pub fn new(runtime: &'a Runtime, image: &'a ModuleImage, module: ModuleId) -> Self {
        Self {
            runtime,
            image,
            module,
        }
    }

    pub fn resolve(&self, token: Token) -> Result<LiveRef, LinkError> {
        match token.table() {
            Some(Table::TypeDef | Table::TypeRef) => self.resolve_type(token).map(LiveRef::Type),
            Some(Table::MethodDef) => self.method_def(token).map(LiveRef::Function),
            Some(Table::FieldDef) => self.field_def(token).map(LiveRef::Field),
            Some(Table::MemberRef) => self.member_ref(token),
            Some(Table::UserString) => self
                .image
                .string(token)
                .map(|s| LiveRef::String(Rc::from(s)))
                .ok_or(LinkError::BadToken(token)),
            None => Err(LinkError::BadToken(token)),
        }
    }

    pub fn resolve_type(&self, token: Token) -> Result<TypeId, LinkError> {
        match token.table() {
            Some(Table::TypeDef) => {
                let index = row(token, self.image.types.len())?;
                let name = self.image.full_type_name(index);
                self.runtime
                    .module_type(self.module, &name)
                    .ok_or(LinkError::MissingType(name))
            }
            Some(Table::TypeRef) => {
                let type_ref = &self.image.type_refs[row(token, self.image.type_refs.len())?];
                let found = match &type_ref.module {
                    Some(module) => self
                        .runtime
                        .module_by_name(module)
                        .and_then(|module| self.runtime.module_type(module, &type_ref.full_name)),
                    None => self.runtime.find_type(&type_ref.full_name),
                };
                found.ok_or_else(|| LinkError::MissingType(type_ref.full_name.clone()))
            }
            _ => Err(LinkError::BadToken(token)),
        }
    }

    pub fn check_type_sig(&self, ty: &TypeSig) -> Result<(), LinkError> {
        if let TypeSig::Class(name) = ty
            && self.runtime.find_type(name).is_none()
        {
            return Err(LinkError::MissingType(name.clone()));
        }
        Ok(())
    }

    /// Links a method body into verified, executable code.
    pub fn link_body(
        &self,
        name: &str,
        sig: &MethodSig,
        is_static: bool,
        body: &MethodBody,
    ) -> Result<Rc<CodeBody>, LinkError> {
        let mut builder = BodyBuilder::new(name, sig.clone(), is_static);

        self.translate_locals(body, &mut builder)?;
        let code = self.translate_refs(body, &mut builder)?;
        builder.set_code(code);
        builder.set_max_stack(body.max_stack);
        self.translate_exceptions(body, &mut builder)?;

        Ok(builder.finish()?)
    }

    pub fn translate_locals(&self, body: &MethodBody, builder: &mut BodyBuilder) -> Result<(), LinkError> {
        for local in &body.locals {
            self.check_type_sig(local)?;
            builder.declare_local(local.clone());
        }
        Ok(())
    }

    /// Rewrites every token operand into an index of the builder's reference table.
    /// Operand widths are unchanged, so all offsets stay valid.
    pub fn translate_refs(&self, body: &MethodBody, builder: &mut BodyBuilder) -> Result<Vec<u8>, LinkError> {
        let mut code = body.code.clone();

        for instr in Instructions::new(&body.code) {
            let instr = instr?;
            if let Some(token) = instr.token() {
                let index = builder.add_ref(self.resolve(token)?);
                code[instr.operand_range()].copy_from_slice(&index.to_le_bytes());
            }
        }

        Ok(code)
    }

    pub fn translate_exceptions(&self, body: &MethodBody, builder: &mut BodyBuilder) -> Result<(), LinkError> {
        for region in &body.regions {
            let kind = match region.kind {
                RegionKind::Catch(token) => HandlerKind::Catch(self.resolve_type(token)?),
                RegionKind::Finally => HandlerKind::Finally,
                RegionKind::Fault => HandlerKind::Fault,
            };

            builder.add_handler(Handler {
                kind,
                try_start: region.try_start,
                try_end: region.try_end,
                handler_start: region.handler_start,
                handler_end: region.handler_end,
            });
        }
        Ok(())
    }

    fn method_def(&self, token: Token) -> Result<FunctionId, LinkError> {
        let def = &self.image.methods[row(token, self.image.methods.len())?];
        let owner = self.resolve_type(Token::from_index(Table::TypeDef, def.owner as usize))?;
        self.function(owner, &def.name, &def.sig, def.is_static, def.generic_arity)
    }

    fn field_def(&self, token: Token) -> Result<FieldId, LinkError> {
        let def = &self.image.fields[row(token, self.image.fields.len())?];
        let owner = self.resolve_type(Token::from_index(Table::TypeDef, def.owner as usize))?;
        self.field(owner, &def.name, &def.ty, def.is_static)
    }

    fn member_ref(&self, token: Token) -> Result<LiveRef, LinkError> {
        let member = &self.image.member_refs[row(token, self.image.member_refs.len())?];
        let parent = self.resolve_type(member.parent)?;

        match &member.kind {
            MemberRefKind::Method {
                sig,
                is_static,
                generic_arity,
            } => self
                .function(parent, &member.name, sig, *is_static, *generic_arity)
                .map(LiveRef::Function),
            MemberRefKind::Field { ty, is_static } => self
                .field(parent, &member.name, ty, *is_static)
                .map(LiveRef::Field),
        }
    }

    fn function(
        &self,
        ty: TypeId,
        name: &str,
        sig: &MethodSig,
        is_static: bool,
        generic_arity: u16,
    ) -> Result<FunctionId, LinkError> {
        let qualified = || format!("{}::{}{}", self.runtime.ty(ty).full_name, name, sig);

        match self
            .runtime
            .find_functions(ty, name, &sig.params, is_static, generic_arity)
            .as_slice()
        {
            [] => Err(LinkError::MissingFunction(qualified())),
            &[id] => {
                let live = &self.runtime.function(id).sig.ret;
                if *live != sig.ret {
                    return Err(LinkError::ReturnTypeChanged {
                        name: qualified(),
                        live: live.clone(),
                        image: sig.ret.clone(),
                    });
                }
                Ok(id)
            }
            _ => Err(LinkError::Ambiguous(qualified())),
        }
    }

    fn field(&self, ty: TypeId, name: &str, field_ty: &TypeSig, is_static: bool) -> Result<FieldId, LinkError> {
        let qualified = || format!("{}::{}", self.runtime.ty(ty).full_name, name);

        let id = self
            .runtime
            .find_field(ty, name)
            .ok_or_else(|| LinkError::MissingField(qualified()))?;

        let live = self.runtime.field(id);
        if live.ty != *field_ty || live.is_static != is_static {
            return Err(LinkError::FieldChanged(qualified()));
        }

        Ok(id)
    }
}

fn row(token: Token, len: usize) -> Result<usize, LinkError> {
    token
        .index()
        .filter(|&index| index < len)
        .ok_or(LinkError::BadToken(token))
}
