//! Module assembler
//!
//! [`ModuleBuilder`] is how tools, demos and tests produce bytecode without a
//! compiler. Functions are declared first (so they can reference each other and
//! be used as callbacks) and defined afterwards.
//!
//! ```rust,ignore
//! let mut m = ModuleBuilder::new("game");
//! let main = m.declare("main");
//! let game = m.class("Game").static_field("score", Constant::I32(0)).index();
//! m.define(main, 0, 0, |f| {
//!     f.const_i32(1);
//!     f.store_static(game, 0);
//!     f.ret_void();
//! });
//! m.entry(main);
//! let module = m.build()?;
//! ```

use super::encoder::BytecodeWriter;
use super::instruction::Instruction;
use super::module::{Class, Constant, Function, Method, Module, StaticField};
use super::opcode::Opcode;
use super::verify::{verify_module, VerifyError};
use rustc_hash::FxHashMap;

/// Errors produced by [`ModuleBuilder::build`]
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A declared function was never defined
    #[error("Function '{0}' declared but never defined")]
    UndefinedFunction(String),

    /// A jump references a label that was never bound
    #[error("Unbound label in function '{0}'")]
    UnboundLabel(String),

    /// The assembled module does not verify
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Jump destination inside a function under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Interned strings and native imports shared across functions
#[derive(Debug, Default)]
struct Pools {
    strings: Vec<String>,
    string_index: FxHashMap<String, u32>,
    natives: Vec<String>,
}

impl Pools {
    fn string(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.string_index.insert(value.to_string(), idx);
        idx
    }

    fn native(&mut self, name: &str) -> u16 {
        if let Some(idx) = self.natives.iter().position(|n| n == name) {
            return idx as u16;
        }
        self.natives.push(name.to_string());
        (self.natives.len() - 1) as u16
    }
}

/// Builds a [`Module`]
#[derive(Debug)]
pub struct ModuleBuilder {
    name: String,
    pools: Pools,
    functions: Vec<(String, Option<Function>)>,
    classes: Vec<Class>,
    unbound: Vec<String>,
    entry: u32,
    flags: u32,
}

impl ModuleBuilder {
    /// Start a new module
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pools: Pools::default(),
            functions: Vec::new(),
            classes: Vec::new(),
            unbound: Vec::new(),
            entry: 0,
            flags: 0,
        }
    }

    /// Set raw header flags
    pub fn flags(&mut self, flags: u32) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Declare a function and return its index
    ///
    /// Declaring the same name twice returns the existing index.
    pub fn declare(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.functions.iter().position(|(n, _)| n == name) {
            return idx as u32;
        }
        self.functions.push((name.to_string(), None));
        (self.functions.len() - 1) as u32
    }

    /// Define the body of a declared function
    ///
    /// # Panics
    ///
    /// Panics if `index` was not returned by [`declare`](Self::declare).
    pub fn define(
        &mut self,
        index: u32,
        params: u16,
        locals: u16,
        body: impl FnOnce(&mut FunctionBuilder<'_>),
    ) -> &mut Self {
        let (name, slot) = &mut self.functions[index as usize];
        let mut func = FunctionBuilder::new(name.clone(), &mut self.pools);
        body(&mut func);
        let code = func.finish_code();
        if func.unbound.is_some() {
            self.unbound.push(name.clone());
        }
        *slot = Some(Function {
            name: name.clone(),
            param_count: params,
            local_count: locals.max(params),
            code,
        });
        self
    }

    /// Add a class (or reopen an existing one) for static members
    pub fn class(&mut self, name: &str) -> ClassBuilder<'_> {
        let index = match self.classes.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.classes.push(Class {
                    name: name.to_string(),
                    statics: Vec::new(),
                    methods: Vec::new(),
                });
                self.classes.len() - 1
            }
        };
        ClassBuilder {
            class: &mut self.classes[index],
            index: index as u32,
        }
    }

    /// Intern a string in the module pool
    pub fn string(&mut self, value: &str) -> u32 {
        self.pools.string(value)
    }

    /// Import a host native by name
    pub fn native(&mut self, name: &str) -> u16 {
        self.pools.native(name)
    }

    /// Set the entry point
    pub fn entry(&mut self, index: u32) -> &mut Self {
        self.entry = index;
        self
    }

    /// Assemble and verify the module
    pub fn build(&self) -> Result<Module, BuildError> {
        if let Some(name) = self.unbound.first() {
            return Err(BuildError::UnboundLabel(name.clone()));
        }
        let mut functions = Vec::with_capacity(self.functions.len());
        for (name, body) in &self.functions {
            let func = body
                .clone()
                .ok_or_else(|| BuildError::UndefinedFunction(name.clone()))?;
            functions.push(func);
        }
        let module = Module {
            flags: self.flags,
            name: self.name.clone(),
            strings: self.pools.strings.clone(),
            functions,
            classes: self.classes.clone(),
            natives: self.pools.natives.clone(),
            entry: self.entry,
        };
        verify_module(&module)?;
        Ok(module)
    }
}

/// Adds static members to a class
pub struct ClassBuilder<'a> {
    class: &'a mut Class,
    index: u32,
}

impl ClassBuilder<'_> {
    /// Add a static field; the kind of `initial` becomes the field's declared kind
    pub fn static_field(&mut self, name: &str, initial: Constant) -> &mut Self {
        self.class.statics.push(StaticField {
            name: name.to_string(),
            initial,
        });
        self
    }

    /// Bind a static method to a function
    pub fn method(&mut self, name: &str, function: u32) -> &mut Self {
        self.class.methods.push(Method {
            name: name.to_string(),
            function,
        });
        self
    }

    /// Index of this class in the module
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Emits instructions for one function body
pub struct FunctionBuilder<'a> {
    name: String,
    pools: &'a mut Pools,
    writer: BytecodeWriter,
    labels: Vec<Option<usize>>,
    // (operand offset, label) pairs patched once labels are bound
    fixups: Vec<(usize, Label)>,
    unbound: Option<Label>,
}

impl<'a> FunctionBuilder<'a> {
    fn new(name: String, pools: &'a mut Pools) -> Self {
        Self {
            name,
            pools,
            writer: BytecodeWriter::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            unbound: None,
        }
    }

    fn emit(&mut self, instr: Instruction) -> &mut Self {
        instr.encode(&mut self.writer);
        self
    }

    fn op(&mut self, op: Opcode) -> &mut Self {
        self.emit(Instruction::Op(op))
    }

    fn finish_code(&mut self) -> Vec<u8> {
        for (operand, label) in std::mem::take(&mut self.fixups) {
            match self.labels[label.0] {
                // Relative to the end of the 4-byte operand
                Some(target) => {
                    let rel = target as i64 - (operand as i64 + 4);
                    self.writer.patch_i32(operand, rel as i32);
                }
                None => self.unbound = Some(label),
            }
        }
        std::mem::take(&mut self.writer).into_bytes()
    }

    /// Name of the function being built
    pub fn name(&self) -> &str {
        &self.name
    }

    // ===== Labels =====

    /// Create an unbound label
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current position
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.writer.offset());
        self
    }

    fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        self.writer.emit_u8(op.to_u8());
        let operand = self.writer.offset();
        self.writer.emit_i32(0);
        self.fixups.push((operand, label));
        self
    }

    /// Unconditional jump
    pub fn jmp(&mut self, label: Label) -> &mut Self {
        self.jump(Opcode::Jmp, label)
    }

    /// Pop and jump if false or null
    pub fn jmp_if_false(&mut self, label: Label) -> &mut Self {
        self.jump(Opcode::JmpIfFalse, label)
    }

    /// Pop and jump if true
    pub fn jmp_if_true(&mut self, label: Label) -> &mut Self {
        self.jump(Opcode::JmpIfTrue, label)
    }

    // ===== Constants and stack =====

    /// Push null
    pub fn const_null(&mut self) -> &mut Self {
        self.op(Opcode::ConstNull)
    }

    /// Push a boolean
    pub fn const_bool(&mut self, value: bool) -> &mut Self {
        self.op(if value {
            Opcode::ConstTrue
        } else {
            Opcode::ConstFalse
        })
    }

    /// Push an integer
    pub fn const_i32(&mut self, value: i32) -> &mut Self {
        self.emit(Instruction::ConstI32(value))
    }

    /// Push a float
    pub fn const_f64(&mut self, value: f64) -> &mut Self {
        self.emit(Instruction::ConstF64(value))
    }

    /// Push a string, interning it in the module pool
    pub fn const_str(&mut self, value: &str) -> &mut Self {
        let idx = self.pools.string(value);
        self.emit(Instruction::ConstStr(idx))
    }

    /// Pop and discard
    pub fn pop(&mut self) -> &mut Self {
        self.op(Opcode::Pop)
    }

    /// Duplicate top of stack
    pub fn dup(&mut self) -> &mut Self {
        self.op(Opcode::Dup)
    }

    // ===== Locals and statics =====

    /// Push a local
    pub fn load_local(&mut self, slot: u16) -> &mut Self {
        self.emit(Instruction::LoadLocal(slot))
    }

    /// Pop into a local
    pub fn store_local(&mut self, slot: u16) -> &mut Self {
        self.emit(Instruction::StoreLocal(slot))
    }

    /// Push a static field
    pub fn load_static(&mut self, class: u32, field: u16) -> &mut Self {
        self.emit(Instruction::LoadStatic { class, field })
    }

    /// Pop into a static field
    pub fn store_static(&mut self, class: u32, field: u16) -> &mut Self {
        self.emit(Instruction::StoreStatic { class, field })
    }

    /// Emit any operand-less opcode (arithmetic, comparison, `THROW`, ...)
    pub fn raw(&mut self, op: Opcode) -> &mut Self {
        debug_assert_eq!(op.operand_size(), 0, "{} takes operands", op.name());
        self.op(op)
    }

    // ===== Calls =====

    /// Call a function by index
    pub fn call(&mut self, function: u32) -> &mut Self {
        self.emit(Instruction::Call(function))
    }

    /// Call a host native, importing it by name
    pub fn call_native(&mut self, name: &str, argc: u8) -> &mut Self {
        let native = self.pools.native(name);
        self.emit(Instruction::CallNative { native, argc })
    }

    /// Return top of stack
    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Return)
    }

    /// Return null
    pub fn ret_void(&mut self) -> &mut Self {
        self.op(Opcode::ReturnVoid)
    }

    /// Throw the string as an exception
    pub fn throw_str(&mut self, message: &str) -> &mut Self {
        self.const_str(message);
        self.op(Opcode::Throw)
    }

    // ===== Scheduling and I/O =====

    /// Pop a delay, schedule `callback` once, push the timer id
    pub fn timer_add(&mut self, callback: u32) -> &mut Self {
        self.emit(Instruction::Intrinsic(Opcode::TimerAdd, callback))
    }

    /// Pop an interval, schedule `callback` repeatedly, push the timer id
    pub fn timer_every(&mut self, callback: u32) -> &mut Self {
        self.emit(Instruction::Intrinsic(Opcode::TimerEvery, callback))
    }

    /// Pop a timer id and cancel it, pushing whether it was pending
    pub fn timer_cancel(&mut self) -> &mut Self {
        self.op(Opcode::TimerCancel)
    }

    /// Run `callback` on every cooperative tick
    pub fn main_loop_add(&mut self, callback: u32) -> &mut Self {
        self.emit(Instruction::Intrinsic(Opcode::MainLoopAdd, callback))
    }

    /// Pop a path and read it in the background, then call `callback` with the contents
    pub fn async_read(&mut self, callback: u32) -> &mut Self {
        self.emit(Instruction::Intrinsic(Opcode::AsyncRead, callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instruction::decode_code;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut m = ModuleBuilder::new("loops");
        let main = m.declare("main");
        m.define(main, 0, 1, |f| {
            let top = f.label();
            let done = f.label();
            f.const_i32(0).store_local(0);
            f.bind(top);
            f.load_local(0).const_i32(3).raw(Opcode::Lt).jmp_if_false(done);
            f.load_local(0).const_i32(1).raw(Opcode::Iadd).store_local(0);
            f.jmp(top);
            f.bind(done);
            f.ret_void();
        });
        let module = m.build().unwrap();

        let code = decode_code(&module.functions[0].code).unwrap();
        let (jmp_offset, back) = code
            .iter()
            .find(|(_, i)| matches!(i, Instruction::Jump(Opcode::Jmp, _)))
            .copied()
            .unwrap();
        let Instruction::Jump(_, rel) = back else { unreachable!() };
        // Loop head is right after the two initialising instructions
        assert_eq!(jmp_offset as i64 + 5 + rel as i64, 8);
    }

    #[test]
    fn test_unbound_label_reported() {
        let mut m = ModuleBuilder::new("broken");
        let main = m.declare("main");
        m.define(main, 0, 0, |f| {
            let nowhere = f.label();
            f.jmp(nowhere);
        });
        assert!(matches!(m.build(), Err(BuildError::UnboundLabel(name)) if name == "main"));
    }

    #[test]
    fn test_declared_but_undefined() {
        let mut m = ModuleBuilder::new("partial");
        let main = m.declare("main");
        m.declare("helper");
        m.define(main, 0, 0, |f| {
            f.ret_void();
        });
        assert!(matches!(m.build(), Err(BuildError::UndefinedFunction(name)) if name == "helper"));
    }

    #[test]
    fn test_strings_and_natives_are_interned() {
        let mut m = ModuleBuilder::new("pools");
        let main = m.declare("main");
        m.define(main, 0, 0, |f| {
            f.const_str("hi").call_native("log", 1).pop();
            f.const_str("hi").call_native("log", 1).pop();
            f.ret_void();
        });
        let module = m.build().unwrap();
        assert_eq!(module.strings, vec!["hi".to_string()]);
        assert_eq!(module.natives, vec!["log".to_string()]);
    }

    #[test]
    fn test_class_reopen_keeps_index() {
        let mut m = ModuleBuilder::new("classes");
        let a = m.class("A").static_field("x", Constant::I32(1)).index();
        let b = m.class("B").index();
        let again = m.class("A").static_field("y", Constant::Bool(true)).index();
        assert_eq!((a, b, again), (0, 1, 0));

        let main = m.declare("main");
        m.define(main, 0, 0, |f| {
            f.ret_void();
        });
        let module = m.build().unwrap();
        assert_eq!(module.classes[0].statics.len(), 2);
    }
}
