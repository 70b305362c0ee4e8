//! Bytecode interpreter
//!
//! A stack machine with an explicit frame stack, so bytecode recursion never
//! consumes native stack and call depth is a plain length check. Locals of
//! every active frame live at the bottom of that frame's region of the shared
//! value stack, which makes the whole stack a precise root set for the
//! collector.

use super::gc::{Heap, ThreadRegistry};
use super::linker::LinkedImage;
use super::reactor::IoReactor;
use super::scheduler::CooperativeScheduler;
use super::value::{HostValue, Value, ValueKind};
use super::VmError;
use crate::bytecode::{Instruction, Opcode};
use std::cmp::Ordering;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
struct Frame {
    func: u32,
    ip: usize,
    /// First local slot
    base: usize,
    /// Operand stack starts here; popping below it is an underflow
    floor: usize,
}

/// Execution state borrowed from a [`Vm`](super::Vm) for one call
pub(crate) struct Interpreter<'vm> {
    image: &'vm LinkedImage,
    heap: &'vm mut Heap,
    statics: &'vm mut [Vec<Value>],
    scheduler: &'vm mut CooperativeScheduler,
    reactor: &'vm IoReactor,
    threads: &'vm ThreadRegistry,
    max_depth: usize,
    stack: Vec<Value>,
    frames: Vec<Frame>,
}

impl<'vm> Interpreter<'vm> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        image: &'vm LinkedImage,
        heap: &'vm mut Heap,
        statics: &'vm mut [Vec<Value>],
        scheduler: &'vm mut CooperativeScheduler,
        reactor: &'vm IoReactor,
        threads: &'vm ThreadRegistry,
        max_depth: usize,
    ) -> Self {
        Self {
            image,
            heap,
            statics,
            scheduler,
            reactor,
            threads,
            max_depth,
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(16),
        }
    }

    /// Run function `func` to completion
    pub fn run(mut self, func: u32, args: &[HostValue]) -> Result<HostValue, VmError> {
        let image = self.image;
        let callee = image
            .functions
            .get(func as usize)
            .ok_or_else(|| VmError::FunctionNotFound(format!("#{func}")))?;
        if args.len() != callee.params as usize {
            return Err(VmError::ArityMismatch {
                name: callee.name.clone(),
                expected: callee.params as usize,
                found: args.len(),
            });
        }
        for arg in args {
            let value = self.from_host(arg)?;
            self.stack.push(value);
        }
        self.enter(func)?;
        self.execute()
    }

    // ===== Frames =====

    fn enter(&mut self, func: u32) -> Result<(), VmError> {
        if self.frames.len() >= self.max_depth {
            return Err(self.exception(format!(
                "stack overflow: call depth exceeds {}",
                self.max_depth
            )));
        }
        let image = self.image;
        let callee = &image.functions[func as usize];
        let params = callee.params as usize;
        let floor = self.frames.last().map_or(0, |f| f.floor);
        if self.stack.len() < floor + params {
            return Err(self.exception("stack underflow in call".to_string()));
        }
        let base = self.stack.len() - params;
        self.stack
            .resize(base + callee.locals as usize, Value::Null);
        self.frames.push(Frame {
            func,
            ip: 0,
            base,
            floor: base + callee.locals as usize,
        });
        Ok(())
    }

    /// Build an exception carrying the current call trace, innermost first
    fn exception(&self, message: String) -> VmError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|f| self.image.functions[f.func as usize].name.clone())
            .collect();
        VmError::Exception { message, trace }
    }

    fn type_error(&self, op: Opcode, expected: &str, found: ValueKind) -> VmError {
        self.exception(format!("{}: expected {expected}, found {found}", op.name()))
    }

    // ===== Stack =====

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        let floor = self.frames.last().map_or(0, |f| f.floor);
        if self.stack.len() <= floor {
            return Err(self.exception("stack underflow".to_string()));
        }
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(self.exception("stack underflow".to_string())),
        }
    }

    fn pop_int(&mut self, op: Opcode) -> Result<i32, VmError> {
        match self.pop()? {
            Value::I32(v) => Ok(v),
            other => Err(self.type_error(op, "int", other.kind())),
        }
    }

    fn pop_number(&mut self, op: Opcode) -> Result<f64, VmError> {
        match self.pop()? {
            Value::I32(v) => Ok(v as f64),
            Value::F64(v) => Ok(v),
            other => Err(self.type_error(op, "number", other.kind())),
        }
    }

    // ===== Heap =====

    /// Allocate a string, collecting first if the heap asks for it
    fn alloc(&mut self, s: String) -> Value {
        if self.heap.should_collect() {
            self.collect();
        }
        Value::Str(self.heap.alloc(s))
    }

    fn collect(&mut self) {
        let heap = &mut *self.heap;
        let statics = &*self.statics;
        let stack = &self.stack;
        let result = self.threads.stop_the_world(|| {
            let roots = statics
                .iter()
                .flatten()
                .chain(stack.iter())
                .filter_map(Value::as_gc_ref);
            heap.collect(roots)
        });
        match result {
            Ok(freed) => tracing::debug!(freed, "collection at allocation safepoint"),
            Err(e) => tracing::warn!(error = %e, "collection skipped"),
        }
    }

    fn display(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::I32(i) => i.to_string(),
            Value::F64(x) => x.to_string(),
            Value::Str(r) => self.heap.get(r).unwrap_or_default().to_string(),
        }
    }

    fn from_host(&mut self, value: &HostValue) -> Result<Value, VmError> {
        Ok(match value {
            HostValue::Null => Value::Null,
            HostValue::Bool(b) => Value::Bool(*b),
            HostValue::Int(i) => Value::I32(*i),
            HostValue::Float(x) => Value::F64(*x),
            HostValue::Str(s) => self.alloc(s.clone()),
        })
    }

    fn to_host(&self, value: Value) -> HostValue {
        super::value_to_host(self.heap, value)
    }

    // ===== Comparison =====

    fn equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::I32(x), Value::I32(y)) => x == y,
            (Value::F64(x), Value::F64(y)) => x == y,
            (Value::I32(x), Value::F64(y)) | (Value::F64(y), Value::I32(x)) => x as f64 == y,
            (Value::Str(x), Value::Str(y)) => self.heap.get(x) == self.heap.get(y),
            _ => false,
        }
    }

    fn compare(&self, op: Opcode, a: Value, b: Value) -> Result<Option<Ordering>, VmError> {
        match (a, b) {
            (Value::I32(x), Value::I32(y)) => Ok(Some(x.cmp(&y))),
            (Value::I32(_) | Value::F64(_), Value::I32(_) | Value::F64(_)) => {
                let as_f64 = |v: Value| match v {
                    Value::I32(i) => i as f64,
                    Value::F64(f) => f,
                    _ => f64::NAN,
                };
                Ok(as_f64(a).partial_cmp(&as_f64(b)))
            }
            (Value::Str(x), Value::Str(y)) => Ok(self.heap.get(x).partial_cmp(&self.heap.get(y))),
            _ => Err(self.type_error(op, "numbers or strings", b.kind())),
        }
    }

    fn truthy(&self, op: Opcode, value: Value) -> Result<bool, VmError> {
        match value {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(self.type_error(op, "bool", other.kind())),
        }
    }

    // ===== Main loop =====

    fn execute(&mut self) -> Result<HostValue, VmError> {
        let image = self.image;
        loop {
            let Some(&Frame { func, ip, .. }) = self.frames.last() else {
                return Ok(HostValue::Null);
            };
            let Some(step) = image.functions[func as usize].code.get(ip).copied() else {
                return Err(self.exception("execution fell off end of function".to_string()));
            };
            if let Some(frame) = self.frames.last_mut() {
                frame.ip += 1;
            }

            match step.instr {
                Instruction::Op(op) => {
                    if let Some(result) = self.simple(op)? {
                        return Ok(result);
                    }
                }
                Instruction::ConstI32(v) => self.push(Value::I32(v)),
                Instruction::ConstF64(v) => self.push(Value::F64(v)),
                Instruction::ConstStr(idx) => {
                    let s = image.module.strings[idx as usize].clone();
                    let value = self.alloc(s);
                    self.push(value);
                }
                Instruction::LoadLocal(slot) => {
                    let base = self.frames.last().map_or(0, |f| f.base);
                    let value = self.stack[base + slot as usize];
                    self.push(value);
                }
                Instruction::StoreLocal(slot) => {
                    let value = self.pop()?;
                    let base = self.frames.last().map_or(0, |f| f.base);
                    self.stack[base + slot as usize] = value;
                }
                Instruction::LoadStatic { class, field } => {
                    let value = self.statics[class as usize][field as usize];
                    self.push(value);
                }
                Instruction::StoreStatic { class, field } => {
                    let value = self.pop()?;
                    let def = &image.classes[class as usize].fields[field as usize];
                    if let Some(kind) = def.kind {
                        if value.kind() != kind && value != Value::Null {
                            return Err(self.exception(format!(
                                "cannot store {} in static '{}.{}' of kind {kind}",
                                value.kind(),
                                image.classes[class as usize].name,
                                def.name
                            )));
                        }
                    }
                    self.statics[class as usize][field as usize] = value;
                }
                Instruction::Jump(op, _) => {
                    let taken = match op {
                        Opcode::Jmp => true,
                        Opcode::JmpIfFalse => {
                            let v = self.pop()?;
                            !self.truthy(op, v)?
                        }
                        _ => {
                            let v = self.pop()?;
                            self.truthy(op, v)?
                        }
                    };
                    if taken {
                        if let Some(frame) = self.frames.last_mut() {
                            frame.ip = step.target;
                        }
                    }
                }
                Instruction::Call(idx) => self.enter(idx)?,
                Instruction::CallNative { native, argc } => self.call_native(native, argc)?,
                Instruction::Intrinsic(op, callback) => self.intrinsic(op, callback)?,
            }
        }
    }

    /// Operand-less opcodes; returns `Some` when the outermost frame returned
    fn simple(&mut self, op: Opcode) -> Result<Option<HostValue>, VmError> {
        match op {
            Opcode::Nop => {}
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let v = self.pop()?;
                self.push(v);
                self.push(v);
            }
            Opcode::ConstNull => self.push(Value::Null),
            Opcode::ConstTrue => self.push(Value::Bool(true)),
            Opcode::ConstFalse => self.push(Value::Bool(false)),

            Opcode::Iadd | Opcode::Isub | Opcode::Imul | Opcode::Idiv | Opcode::Imod => {
                let b = self.pop_int(op)?;
                let a = self.pop_int(op)?;
                let result = match op {
                    Opcode::Iadd => a.wrapping_add(b),
                    Opcode::Isub => a.wrapping_sub(b),
                    Opcode::Imul => a.wrapping_mul(b),
                    _ if b == 0 => return Err(self.exception("division by zero".to_string())),
                    Opcode::Idiv => a.wrapping_div(b),
                    _ => a.wrapping_rem(b),
                };
                self.push(Value::I32(result));
            }
            Opcode::Ineg => {
                let a = self.pop_int(op)?;
                self.push(Value::I32(a.wrapping_neg()));
            }
            Opcode::Fadd | Opcode::Fsub | Opcode::Fmul | Opcode::Fdiv => {
                let b = self.pop_number(op)?;
                let a = self.pop_number(op)?;
                let result = match op {
                    Opcode::Fadd => a + b,
                    Opcode::Fsub => a - b,
                    Opcode::Fmul => a * b,
                    _ => a / b,
                };
                self.push(Value::F64(result));
            }
            Opcode::Fneg => {
                let a = self.pop_number(op)?;
                self.push(Value::F64(-a));
            }
            Opcode::ToF64 => {
                let a = self.pop_number(op)?;
                self.push(Value::F64(a));
            }
            Opcode::ToI32 => {
                let value = match self.pop()? {
                    Value::I32(i) => i,
                    // `as` saturates and maps NaN to 0
                    Value::F64(f) => f as i32,
                    other => return Err(self.type_error(op, "number", other.kind())),
                };
                self.push(Value::I32(value));
            }

            Opcode::Eq | Opcode::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = self.equal(a, b);
                self.push(Value::Bool(if op == Opcode::Eq { eq } else { !eq }));
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                let b = self.pop()?;
                let a = self.pop()?;
                let ord = self.compare(op, a, b)?;
                let result = match (op, ord) {
                    (_, None) => false,
                    (Opcode::Lt, Some(o)) => o == Ordering::Less,
                    (Opcode::Le, Some(o)) => o != Ordering::Greater,
                    (Opcode::Gt, Some(o)) => o == Ordering::Greater,
                    (_, Some(o)) => o != Ordering::Less,
                };
                self.push(Value::Bool(result));
            }
            Opcode::Not => {
                let v = self.pop()?;
                let b = self.truthy(op, v)?;
                self.push(Value::Bool(!b));
            }
            Opcode::Concat => {
                let b = self.pop()?;
                let a = self.pop()?;
                let joined = self.display(a) + &self.display(b);
                let value = self.alloc(joined);
                self.push(value);
            }

            Opcode::Return | Opcode::ReturnVoid => {
                let ret = if op == Opcode::Return {
                    self.pop()?
                } else {
                    Value::Null
                };
                let Some(frame) = self.frames.pop() else {
                    return Ok(Some(self.to_host(ret)));
                };
                self.stack.truncate(frame.base);
                if self.frames.is_empty() {
                    return Ok(Some(self.to_host(ret)));
                }
                self.push(ret);
            }
            Opcode::Throw => {
                let v = self.pop()?;
                let message = self.display(v);
                return Err(self.exception(message));
            }
            Opcode::TimerCancel => {
                let id = self.pop_int(op)?;
                let cancelled = id > 0 && self.scheduler.cancel(id as u32);
                self.push(Value::Bool(cancelled));
            }
            // Operand-carrying opcodes never decode to `Instruction::Op`
            _ => {
                return Err(self.exception(format!("malformed instruction {}", op.name())));
            }
        }
        Ok(None)
    }

    fn call_native(&mut self, native: u16, argc: u8) -> Result<(), VmError> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            let v = self.pop()?;
            args.push(self.to_host(v));
        }
        args.reverse();

        let image = self.image;
        let Some((name, handler)) = image.natives.get(native) else {
            return Err(self.exception(format!("unbound native #{native}")));
        };
        match handler(&args) {
            Ok(result) => {
                let value = self.from_host(&result)?;
                self.push(value);
                Ok(())
            }
            Err(message) => Err(self.exception(format!("native '{name}' failed: {message}"))),
        }
    }

    fn intrinsic(&mut self, op: Opcode, callback: u32) -> Result<(), VmError> {
        let image = self.image;
        let name = image.functions[callback as usize].name.as_str();
        match op {
            Opcode::TimerAdd | Opcode::TimerEvery => {
                let delay = self.pop_number(op)?;
                let id = self
                    .scheduler
                    .add_timer(name, delay, op == Opcode::TimerEvery);
                self.push(Value::I32(id as i32));
            }
            Opcode::MainLoopAdd => self.scheduler.add_main_loop(name),
            Opcode::AsyncRead => {
                let path = match self.pop()? {
                    Value::Str(r) => self.heap.get(r).unwrap_or_default().to_string(),
                    other => return Err(self.type_error(op, "string", other.kind())),
                };
                if let Err(e) = self.reactor.submit_read(PathBuf::from(path), name) {
                    return Err(self.exception(format!("async read failed to start: {e}")));
                }
            }
            _ => return Err(self.exception(format!("malformed instruction {}", op.name()))),
        }
        Ok(())
    }
}
