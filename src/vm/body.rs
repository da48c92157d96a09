use std::{collections::HashMap, collections::HashSet, rc::Rc};

use thiserror::Error;

use super::{FieldId, FunctionId, TypeId};
use crate::image::{DecodeError, Instruction, Instructions, MethodSig, OpCode, Operand, TypeSig};

/// A reference from linked code into the live runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LiveRef {
    Type(TypeId),
    Function(FunctionId),
    Field(FieldId),
    String(Rc<str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Catch(TypeId),
    Finally,
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub kind: HandlerKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
}

impl Handler {
    pub fn protects(&self, offset: usize) -> bool {
        (self.try_start as usize..self.try_end as usize).contains(&offset)
    }
}

/// Linked, verified, executable function code.
///
/// Token operands in `code` are indices into `refs`; everything else is byte-for-byte
/// the instruction stream of the image the body was linked from.
#[derive(Debug)]
pub struct CodeBody {
    pub name: String,
    pub sig: MethodSig,
    pub is_static: bool,
    pub max_stack: u16,
    pub locals: Vec<TypeSig>,
    pub code: Vec<u8>,
    pub refs: Vec<LiveRef>,
    /// Innermost regions first.
    pub handlers: Vec<Handler>,
}

impl CodeBody {
    pub fn arg_count(&self) -> usize {
        self.sig.params.len() + usize::from(!self.is_static)
    }

    pub fn live_ref(&self, index: u32) -> Option<&LiveRef> {
        self.refs.get(index as usize)
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("empty code")]
    Empty,
    #[error("branch at offset {offset} targets {target}, which is not an instruction boundary")]
    BadBranch { offset: usize, target: i64 },
    #[error("{opcode} at offset {offset} uses variable {index} out of {count}")]
    BadVariable {
        offset: usize,
        opcode: &'static str,
        index: u16,
        count: usize,
    },
    #[error("{opcode} at offset {offset} has a reference of the wrong kind")]
    BadReference { offset: usize, opcode: &'static str },
    #[error("exception region {index} has invalid bounds")]
    BadRegion { index: usize },
}

/// Assembles a [`CodeBody`] piece by piece and verifies it on [`finish`](Self::finish).
pub struct BodyBuilder {
    name: String,
    sig: MethodSig,
    is_static: bool,
    max_stack: u16,
    locals: Vec<TypeSig>,
    code: Vec<u8>,
    refs: Vec<LiveRef>,
    ref_index: HashMap<LiveRef, u32>,
    handlers: Vec<Handler>,
}

impl BodyBuilder {
    pub fn new(name: impl Into<String>, sig: MethodSig, is_static: bool) -> Self {
        Self {
            name: name.into(),
            sig,
            is_static,
            max_stack: 0,
            locals: Vec::new(),
            code: Vec::new(),
            refs: Vec::new(),
            ref_index: HashMap::new(),
            handlers: Vec::new(),
        }
    }

    pub fn declare_local(&mut self, ty: TypeSig) -> u16 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u16
    }

    /// Interns `live_ref` and returns its operand value.
    pub fn add_ref(&mut self, live_ref: LiveRef) -> u32 {
        if let Some(&index) = self.ref_index.get(&live_ref) {
            return index;
        }

        let index = self.refs.len() as u32;
        self.refs.push(live_ref.clone());
        self.ref_index.insert(live_ref, index);
        index
    }

    pub fn set_code(&mut self, code: Vec<u8>) {
        self.code = code;
    }

    pub fn set_max_stack(&mut self, max_stack: u16) {
        self.max_stack = max_stack;
    }

    pub fn add_handler(&mut self, handler: Handler) {
        self.handlers.push(handler);
    }

    pub fn finish(self) -> Result<Rc<CodeBody>, VerifyError> {
        let body = CodeBody {
            name: self.name,
            sig: self.sig,
            is_static: self.is_static,
            max_stack: self.max_stack,
            locals: self.locals,
            code: self.code,
            refs: self.refs,
            handlers: self.handlers,
        };

        verify(&body)?;

        Ok(Rc::new(body))
    }
}

fn verify(body: &CodeBody) -> Result<(), VerifyError> {
    if body.code.is_empty() {
        return Err(VerifyError::Empty);
    }

    let instructions = Instructions::new(&body.code).collect::<Result<Vec<_>, _>>()?;
    let boundaries = instructions
        .iter()
        .map(|instr| instr.offset)
        .collect::<HashSet<_>>();

    for instr in &instructions {
        if let Some(target) = instr.branch_target()
            && (target < 0 || !boundaries.contains(&(target as usize)))
        {
            return Err(VerifyError::BadBranch {
                offset: instr.offset,
                target,
            });
        }

        if let Operand::Var(index) = instr.operand {
            let count = match instr.opcode {
                OpCode::LdArg | OpCode::StArg => body.arg_count(),
                _ => body.locals.len(),
            };
            if index as usize >= count {
                return Err(VerifyError::BadVariable {
                    offset: instr.offset,
                    opcode: instr.opcode.mnemonic(),
                    index,
                    count,
                });
            }
        }

        if let Operand::Token(index) = instr.operand
            && !reference_fits(instr, body.live_ref(index))
        {
            return Err(VerifyError::BadReference {
                offset: instr.offset,
                opcode: instr.opcode.mnemonic(),
            });
        }
    }

    // Region ends may sit one past the last instruction.
    let in_bounds = |offset: u32| {
        let offset = offset as usize;
        boundaries.contains(&offset) || offset == body.code.len()
    };

    for (index, handler) in body.handlers.iter().enumerate() {
        let valid = handler.try_start < handler.try_end
            && handler.handler_start < handler.handler_end
            && [
                handler.try_start,
                handler.try_end,
                handler.handler_start,
                handler.handler_end,
            ]
            .into_iter()
            .all(in_bounds);

        if !valid {
            return Err(VerifyError::BadRegion { index });
        }
    }

    Ok(())
}

fn reference_fits(instr: &Instruction, live_ref: Option<&LiveRef>) -> bool {
    match (instr.opcode, live_ref) {
        (OpCode::LdStr, Some(LiveRef::String(_))) => true,
        (OpCode::Call | OpCode::NewObj, Some(LiveRef::Function(_))) => true,
        (
            OpCode::LdFld | OpCode::StFld | OpCode::LdSFld | OpCode::StSFld,
            Some(LiveRef::Field(_)),
        ) => true,
        (OpCode::IsInst, Some(LiveRef::Type(_))) => true,
        _ => false,
    }
}
