use std::{cell::Cell, cmp::Ordering, rc::Rc};

use thiserror::Error;

use super::{CodeBody, FieldId, FunctionId, Handler, HandlerKind, LiveRef, Runtime, Value};
use crate::image::{DecodeError, Instruction, OpCode, Operand, TypeSig};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unhandled exception: {0}")]
    Thrown(Value),
    #[error("{0} has no body")]
    NoBody(String),
    #[error("{function} takes {expected} arguments, got {actual}")]
    ArgCount {
        function: String,
        expected: usize,
        actual: usize,
    },
    #[error("division by zero")]
    DivideByZero,
    #[error("null reference")]
    NullReference,
    #[error("operand type mismatch for {0}")]
    TypeMismatch(&'static str),
    #[error("invalid code at offset {0}")]
    InvalidCode(usize),
    #[error("maximum call depth exceeded")]
    CallDepth,
    #[error("evaluation stack overflow")]
    StackOverflow,
    #[error("evaluation stack underflow")]
    StackUnderflow,
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Runtime {
    /// Calls `function` through its entry slot. Instance functions take the receiver as
    /// the first argument.
    pub fn call(&self, function: FunctionId, args: Vec<Value>) -> Result<Value, VmError> {
        let body = self
            .function(function)
            .current_body()
            .ok_or_else(|| VmError::NoBody(self.describe(function)))?;

        self.invoke(&body, args)
    }

    fn invoke(&self, body: &Rc<CodeBody>, args: Vec<Value>) -> Result<Value, VmError> {
        if args.len() != body.arg_count() {
            return Err(VmError::ArgCount {
                function: body.name.clone(),
                expected: body.arg_count(),
                actual: args.len(),
            });
        }

        if self.depth.get() >= Self::MAX_CALL_DEPTH {
            return Err(VmError::CallDepth);
        }

        struct DepthGuard<'a>(&'a Cell<usize>);
        impl Drop for DepthGuard<'_> {
            fn drop(&mut self) {
                self.0.set(self.0.get() - 1);
            }
        }

        self.depth.set(self.depth.get() + 1);
        let _depth_guard = DepthGuard(&self.depth);

        let mut frame = Frame {
            runtime: self,
            body,
            args,
            locals: body.locals.iter().map(Value::default_for).collect(),
            stack: Vec::with_capacity(body.max_stack as usize),
        };

        match frame.run(0)? {
            Flow::Return(value) => Ok(value),
            Flow::EndFinally => Err(VmError::InvalidCode(0)),
        }
    }
}

enum Step {
    Next,
    Jump(usize),
    Leave(usize),
    Return(Value),
    EndFinally,
}

enum Flow {
    Return(Value),
    EndFinally,
}

struct Frame<'a> {
    runtime: &'a Runtime,
    body: &'a CodeBody,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
}

impl<'a> Frame<'a> {
    fn run(&mut self, start: usize) -> Result<Flow, VmError> {
        let mut pc = start;

        loop {
            let instr = Instruction::decode(&self.body.code, pc)?;

            let step = match self.step(&instr) {
                Ok(step) => step,
                Err(VmError::Thrown(exception)) => {
                    pc = self.unwind(pc, exception)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            pc = match step {
                Step::Next => instr.next_offset(),
                Step::Jump(target) => target,
                Step::Leave(target) => {
                    self.stack.clear();
                    self.run_finally_blocks(pc, target)?;
                    target
                }
                Step::Return(value) => return Ok(Flow::Return(value)),
                Step::EndFinally => return Ok(Flow::EndFinally),
            };
        }
    }

    /// Finds the handler for an exception raised at `pc`, running `finally` and `fault`
    /// blocks passed on the way. Returns the offset to resume at.
    fn unwind(&mut self, pc: usize, exception: Value) -> Result<usize, VmError> {
        let body = self.body;

        for handler in body.handlers.iter().filter(|h| h.protects(pc)) {
            match handler.kind {
                HandlerKind::Catch(ty) => {
                    let caught = exception
                        .object_type()
                        .is_some_and(|thrown| self.runtime.is_assignable(thrown, ty));

                    if caught {
                        self.stack.clear();
                        self.push(exception)?;
                        return Ok(handler.handler_start as usize);
                    }
                }
                HandlerKind::Finally | HandlerKind::Fault => self.run_handler(handler)?,
            }
        }

        Err(VmError::Thrown(exception))
    }

    /// Runs the `finally` blocks a `leave` from `from` to `target` exits, innermost first.
    fn run_finally_blocks(&mut self, from: usize, target: usize) -> Result<(), VmError> {
        let body = self.body;

        for handler in &body.handlers {
            if handler.kind == HandlerKind::Finally && handler.protects(from) && !handler.protects(target) {
                self.run_handler(handler)?;
            }
        }

        Ok(())
    }

    fn run_handler(&mut self, handler: &Handler) -> Result<(), VmError> {
        let saved = std::mem::take(&mut self.stack);

        match self.run(handler.handler_start as usize)? {
            Flow::EndFinally => {
                self.stack = saved;
                Ok(())
            }
            Flow::Return(_) => Err(VmError::InvalidCode(handler.handler_start as usize)),
        }
    }

    fn step(&mut self, instr: &Instruction) -> Result<Step, VmError> {
        let runtime = self.runtime;

        match instr.opcode {
            OpCode::Nop => {}
            OpCode::LdNull => self.push(Value::Null)?,
            OpCode::LdcI4 | OpCode::LdcI8 | OpCode::LdcR8 => {
                let value = match instr.operand {
                    Operand::I32(v) => Value::I32(v),
                    Operand::I64(v) => Value::I64(v),
                    Operand::F64(v) => Value::F64(v),
                    _ => return Err(VmError::InvalidCode(instr.offset)),
                };
                self.push(value)?;
            }
            OpCode::LdStr => match self.live_ref(instr)? {
                LiveRef::String(s) => {
                    let value = Value::Str(Rc::clone(s));
                    self.push(value)?;
                }
                _ => return Err(VmError::InvalidCode(instr.offset)),
            },

            OpCode::LdArg => {
                let value = self.variable(instr, false)?.clone();
                self.push(value)?;
            }
            OpCode::StArg => {
                let value = self.pop()?;
                *self.variable(instr, false)? = value;
            }
            OpCode::LdLoc => {
                let value = self.variable(instr, true)?.clone();
                self.push(value)?;
            }
            OpCode::StLoc => {
                let value = self.pop()?;
                *self.variable(instr, true)? = value;
            }
            OpCode::Dup => {
                let value = self.stack.last().cloned().ok_or(VmError::StackUnderflow)?;
                self.push(value)?;
            }
            OpCode::Pop => {
                let _ = self.pop()?;
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Rem => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(arith(instr.opcode, a, b)?)?;
            }
            OpCode::Neg => {
                let value = match self.pop()? {
                    Value::I32(v) => Value::I32(v.wrapping_neg()),
                    Value::I64(v) => Value::I64(v.wrapping_neg()),
                    Value::F64(v) => Value::F64(-v),
                    _ => return Err(VmError::TypeMismatch(instr.opcode.mnemonic())),
                };
                self.push(value)?;
            }
            OpCode::Ceq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::I32((a == b) as i32))?;
            }
            OpCode::Clt | OpCode::Cgt => {
                let b = self.pop()?;
                let a = self.pop()?;
                let ordering = compare(&a, &b).ok_or(VmError::TypeMismatch(instr.opcode.mnemonic()))?;
                let wanted = match instr.opcode {
                    OpCode::Clt => Ordering::Less,
                    _ => Ordering::Greater,
                };
                self.push(Value::I32((ordering == wanted) as i32))?;
            }

            OpCode::Br => return Ok(Step::Jump(branch_target(instr)?)),
            OpCode::BrTrue | OpCode::BrFalse => {
                let truthy = self.pop()?.is_truthy();
                if truthy == (instr.opcode == OpCode::BrTrue) {
                    return Ok(Step::Jump(branch_target(instr)?));
                }
            }
            OpCode::Leave => return Ok(Step::Leave(branch_target(instr)?)),

            OpCode::Call => {
                let callee = self.function_ref(instr)?;
                let function = runtime.function(callee);
                let count = function.sig.params.len() + usize::from(!function.is_static);
                let args = self.pop_args(count)?;

                let result = runtime.call(callee, args)?;
                if function.sig.ret != TypeSig::Void {
                    self.push(result)?;
                }
            }
            OpCode::NewObj => {
                let ctor = self.function_ref(instr)?;
                let function = runtime.function(ctor);
                if function.is_static {
                    return Err(VmError::InvalidCode(instr.offset));
                }

                let object = Value::new_object(function.owner);
                let mut args = self.pop_args(function.sig.params.len())?;
                args.insert(0, object.clone());

                let _ = runtime.call(ctor, args)?;
                self.push(object)?;
            }
            OpCode::Ret => {
                let value = match self.body.sig.ret {
                    TypeSig::Void => Value::Null,
                    _ => self.pop()?,
                };
                return Ok(Step::Return(value));
            }

            OpCode::LdFld => {
                let field = self.field_ref(instr)?;
                let value = match self.pop()? {
                    Value::Obj(object) => object
                        .borrow()
                        .fields
                        .get(&field)
                        .cloned()
                        .unwrap_or_else(|| Value::default_for(&runtime.field(field).ty)),
                    Value::Null => return Err(VmError::NullReference),
                    _ => return Err(VmError::TypeMismatch(instr.opcode.mnemonic())),
                };
                self.push(value)?;
            }
            OpCode::StFld => {
                let field = self.field_ref(instr)?;
                let value = self.pop()?;
                match self.pop()? {
                    Value::Obj(object) => {
                        let _ = object.borrow_mut().fields.insert(field, value);
                    }
                    Value::Null => return Err(VmError::NullReference),
                    _ => return Err(VmError::TypeMismatch(instr.opcode.mnemonic())),
                }
            }
            OpCode::LdSFld => {
                let field = self.field_ref(instr)?;
                let value = runtime
                    .static_value(field)
                    .unwrap_or_else(|| Value::default_for(&runtime.field(field).ty));
                self.push(value)?;
            }
            OpCode::StSFld => {
                let field = self.field_ref(instr)?;
                let value = self.pop()?;
                runtime.set_static_value(field, value);
            }

            OpCode::IsInst => {
                let target = match self.live_ref(instr)? {
                    LiveRef::Type(ty) => *ty,
                    _ => return Err(VmError::InvalidCode(instr.offset)),
                };
                let value = self.pop()?;
                let is_instance = value
                    .object_type()
                    .is_some_and(|ty| runtime.is_assignable(ty, target));
                self.push(if is_instance { value } else { Value::Null })?;
            }
            OpCode::Throw => match self.pop()? {
                Value::Null => return Err(VmError::NullReference),
                exception => return Err(VmError::Thrown(exception)),
            },
            OpCode::EndFinally => return Ok(Step::EndFinally),
        }

        Ok(Step::Next)
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= self.body.max_stack as usize {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        let split = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or(VmError::StackUnderflow)?;
        Ok(self.stack.split_off(split))
    }

    fn variable(&mut self, instr: &Instruction, local: bool) -> Result<&mut Value, VmError> {
        let Operand::Var(index) = instr.operand else {
            return Err(VmError::InvalidCode(instr.offset));
        };

        let slots = if local { &mut self.locals } else { &mut self.args };
        slots
            .get_mut(index as usize)
            .ok_or(VmError::InvalidCode(instr.offset))
    }

    fn live_ref(&self, instr: &Instruction) -> Result<&'a LiveRef, VmError> {
        let body = self.body;
        match instr.operand {
            Operand::Token(index) => body.live_ref(index),
            _ => None,
        }
        .ok_or(VmError::InvalidCode(instr.offset))
    }

    fn function_ref(&self, instr: &Instruction) -> Result<FunctionId, VmError> {
        match self.live_ref(instr)? {
            LiveRef::Function(function) => Ok(*function),
            _ => Err(VmError::InvalidCode(instr.offset)),
        }
    }

    fn field_ref(&self, instr: &Instruction) -> Result<FieldId, VmError> {
        match self.live_ref(instr)? {
            LiveRef::Field(field) => Ok(*field),
            _ => Err(VmError::InvalidCode(instr.offset)),
        }
    }
}

fn branch_target(instr: &Instruction) -> Result<usize, VmError> {
    instr
        .branch_target()
        .and_then(|target| usize::try_from(target).ok())
        .ok_or(VmError::InvalidCode(instr.offset))
}

macro_rules! int_arith {
    ($op:expr, $a:expr, $b:expr) => {
        match $op {
            OpCode::Add => $a.wrapping_add($b),
            OpCode::Sub => $a.wrapping_sub($b),
            OpCode::Mul => $a.wrapping_mul($b),
            OpCode::Div | OpCode::Rem if $b == 0 => return Err(VmError::DivideByZero),
            OpCode::Div => $a.wrapping_div($b),
            _ => $a.wrapping_rem($b),
        }
    };
}

fn arith(op: OpCode, a: Value, b: Value) -> Result<Value, VmError> {
    Ok(match (a, b) {
        (Value::I32(a), Value::I32(b)) => Value::I32(int_arith!(op, a, b)),
        (Value::I64(a), Value::I64(b)) => Value::I64(int_arith!(op, a, b)),
        (Value::F64(a), Value::F64(b)) => Value::F64(match op {
            OpCode::Add => a + b,
            OpCode::Sub => a - b,
            OpCode::Mul => a * b,
            OpCode::Div => a / b,
            _ => a % b,
        }),
        (Value::Str(a), b) if op == OpCode::Add => Value::Str(format!("{a}{b}").into()),
        _ => return Err(VmError::TypeMismatch(op.mnemonic())),
    })
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::I32(a), Value::I32(b)) => Some(a.cmp(b)),
        (Value::I64(a), Value::I64(b)) => Some(a.cmp(b)),
        (Value::F64(a), Value::F64(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
