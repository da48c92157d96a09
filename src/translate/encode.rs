//! Canonical encoding of function bodies.
//!
//! Two bodies encode to the same bytes exactly when they run the same instructions
//! against the same live references, locals, stack bound and exception regions. Image
//! bodies are encoded with their tokens resolved through a [`Linker`], linked bodies
//! through their own reference tables, so both sides agree however the references are
//! numbered.

use crate::{
    image::{DecodeError, Instructions, MethodBody, Operand, RegionKind, TypeSig},
    vm::{CodeBody, HandlerKind, LiveRef, LinkError, Linker},
};

const REF_TYPE: u8 = 1;
const REF_FUNCTION: u8 = 2;
const REF_FIELD: u8 = 3;
const REF_STRING: u8 = 4;
const REF_MISSING: u8 = 0xFF;

pub fn encode_image_body(linker: &Linker<'_>, body: &MethodBody) -> Result<Vec<u8>, LinkError> {
    let mut out = Vec::with_capacity(body.code.len() * 2);
    write_header(&mut out, body.max_stack, &body.locals, body.code.len());

    for instr in Instructions::new(&body.code) {
        let instr = instr?;
        match instr.token() {
            Some(token) => {
                out.push(instr.opcode as u8);
                write_ref(&mut out, Some(&linker.resolve(token)?));
            }
            None => out.extend_from_slice(&body.code[instr.offset..instr.next_offset()]),
        }
    }

    write_count(&mut out, body.regions.len());
    for region in &body.regions {
        let (tag, catch) = match region.kind {
            RegionKind::Catch(token) => (0, Some(linker.resolve_type(token)?.index() as u32)),
            RegionKind::Finally => (1, None),
            RegionKind::Fault => (2, None),
        };
        write_region(
            &mut out,
            tag,
            catch,
            [region.try_start, region.try_end, region.handler_start, region.handler_end],
        );
    }

    Ok(out)
}

pub fn encode_live_body(body: &CodeBody) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(body.code.len() * 2);
    write_header(&mut out, body.max_stack, &body.locals, body.code.len());

    for instr in Instructions::new(&body.code) {
        let instr = instr?;
        match instr.operand {
            Operand::Token(index) => {
                out.push(instr.opcode as u8);
                write_ref(&mut out, body.live_ref(index));
            }
            _ => out.extend_from_slice(&body.code[instr.offset..instr.next_offset()]),
        }
    }

    write_count(&mut out, body.handlers.len());
    for handler in &body.handlers {
        let (tag, catch) = match handler.kind {
            HandlerKind::Catch(ty) => (0, Some(ty.index() as u32)),
            HandlerKind::Finally => (1, None),
            HandlerKind::Fault => (2, None),
        };
        write_region(
            &mut out,
            tag,
            catch,
            [handler.try_start, handler.try_end, handler.handler_start, handler.handler_end],
        );
    }

    Ok(out)
}

fn write_header(out: &mut Vec<u8>, max_stack: u16, locals: &[TypeSig], code_len: usize) {
    out.extend_from_slice(&max_stack.to_le_bytes());
    write_count(out, locals.len());
    for local in locals {
        write_type_sig(out, local);
    }
    write_count(out, code_len);
}

fn write_count(out: &mut Vec<u8>, count: usize) {
    out.extend_from_slice(&(count as u32).to_le_bytes());
}

fn write_type_sig(out: &mut Vec<u8>, ty: &TypeSig) {
    match ty {
        TypeSig::Void => out.push(0),
        TypeSig::I32 => out.push(1),
        TypeSig::I64 => out.push(2),
        TypeSig::F64 => out.push(3),
        TypeSig::String => out.push(4),
        TypeSig::Object => out.push(5),
        TypeSig::Class(name) => {
            out.push(6);
            write_str(out, name);
        }
        TypeSig::Var(n) => {
            out.push(7);
            out.extend_from_slice(&n.to_le_bytes());
        }
        TypeSig::MVar(n) => {
            out.push(8);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn write_ref(out: &mut Vec<u8>, live_ref: Option<&LiveRef>) {
    match live_ref {
        Some(LiveRef::Type(id)) => write_id(out, REF_TYPE, id.index()),
        Some(LiveRef::Function(id)) => write_id(out, REF_FUNCTION, id.index()),
        Some(LiveRef::Field(id)) => write_id(out, REF_FIELD, id.index()),
        Some(LiveRef::String(s)) => {
            out.push(REF_STRING);
            write_str(out, s);
        }
        None => out.push(REF_MISSING),
    }
}

fn write_id(out: &mut Vec<u8>, tag: u8, index: usize) {
    out.push(tag);
    out.extend_from_slice(&(index as u32).to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_count(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

fn write_region(out: &mut Vec<u8>, tag: u8, catch: Option<u32>, bounds: [u32; 4]) {
    out.push(tag);
    if let Some(ty) = catch {
        out.extend_from_slice(&ty.to_le_bytes());
    }
    for bound in bounds {
        out.extend_from_slice(&bound.to_le_bytes());
    }
}
