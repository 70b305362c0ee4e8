//! Module linking
//!
//! Turns a verified [`Module`] into the image the interpreter runs: bodies
//! are pre-decoded with jumps resolved to instruction indices, classes and
//! functions get name indexes, native imports are bound to host handlers and
//! the module's event-loop capabilities are recorded.

use super::natives::{NativeRegistry, ResolvedNatives};
use super::value::ValueKind;
use crate::bytecode::{decode_code, Constant, DecodeError, Instruction, Module, Opcode};
use rustc_hash::FxHashMap;

/// Link failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// A native import has no registered handler
    #[error("Unresolved native '{0}'")]
    UnresolvedNative(String),

    /// A body failed to decode (the module was not verified)
    #[error("Function '{function}' failed to decode: {source}")]
    Decode {
        /// Function name
        function: String,
        /// Underlying error
        source: DecodeError,
    },

    /// A jump does not land on an instruction (the module was not verified)
    #[error("Function '{function}' jumps to offset {target}")]
    InvalidJump {
        /// Function name
        function: String,
        /// Target offset
        target: i64,
    },
}

/// Event-loop facilities a module uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Timers or main-loop callbacks
    pub cooperative: bool,
    /// Background file reads
    pub async_io: bool,
}

/// One pre-decoded instruction
#[derive(Debug, Clone, Copy)]
pub(crate) struct Step {
    pub instr: Instruction,
    /// Instruction index a jump lands on; unused for everything else
    pub target: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct LinkedFunction {
    pub name: String,
    pub params: u16,
    pub locals: u16,
    pub code: Vec<Step>,
}

#[derive(Debug, Clone)]
pub(crate) struct LinkedField {
    pub name: String,
    /// Declared kind; `None` means dynamically typed
    pub kind: Option<ValueKind>,
    pub initial: Constant,
}

#[derive(Debug, Clone)]
pub(crate) struct LinkedClass {
    pub name: String,
    pub fields: Vec<LinkedField>,
    pub methods: FxHashMap<String, u32>,
}

impl LinkedClass {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// A module ready to execute
#[derive(Debug, Clone)]
pub(crate) struct LinkedImage {
    pub module: Module,
    pub functions: Vec<LinkedFunction>,
    pub function_index: FxHashMap<String, u32>,
    pub classes: Vec<LinkedClass>,
    pub class_index: FxHashMap<String, u32>,
    pub natives: ResolvedNatives,
    pub capabilities: Capabilities,
}

impl LinkedImage {
    pub fn class(&self, name: &str) -> Option<(u32, &LinkedClass)> {
        let idx = *self.class_index.get(name)?;
        Some((idx, &self.classes[idx as usize]))
    }

    pub fn function(&self, name: &str) -> Option<(u32, &LinkedFunction)> {
        let idx = *self.function_index.get(name)?;
        Some((idx, &self.functions[idx as usize]))
    }

    pub fn entry(&self) -> u32 {
        self.module.entry
    }
}

/// Declared kind of a static, from its initial constant
pub(crate) fn declared_kind(initial: &Constant) -> Option<ValueKind> {
    match initial {
        Constant::Null => None,
        Constant::Bool(_) => Some(ValueKind::Bool),
        Constant::I32(_) => Some(ValueKind::Int),
        Constant::F64(_) => Some(ValueKind::Float),
        Constant::Str(_) => Some(ValueKind::String),
    }
}

/// Link a verified module against the host's natives
pub(crate) fn link(module: Module, registry: &NativeRegistry) -> Result<LinkedImage, LinkError> {
    let natives =
        ResolvedNatives::link(&module.natives, registry).map_err(LinkError::UnresolvedNative)?;

    let mut capabilities = Capabilities::default();
    let mut functions = Vec::with_capacity(module.functions.len());
    let mut function_index = FxHashMap::default();

    for (idx, func) in module.functions.iter().enumerate() {
        let decoded = decode_code(&func.code).map_err(|source| LinkError::Decode {
            function: func.name.clone(),
            source,
        })?;
        let index_of: FxHashMap<usize, usize> = decoded
            .iter()
            .enumerate()
            .map(|(i, (offset, _))| (*offset, i))
            .collect();

        let mut code = Vec::with_capacity(decoded.len());
        for (offset, instr) in &decoded {
            let mut target = 0;
            match *instr {
                Instruction::Jump(op, rel) => {
                    let next = *offset + 1 + op.operand_size();
                    let dest = next as i64 + rel as i64;
                    target = usize::try_from(dest)
                        .ok()
                        .and_then(|d| index_of.get(&d).copied())
                        .ok_or_else(|| LinkError::InvalidJump {
                            function: func.name.clone(),
                            target: dest,
                        })?;
                }
                Instruction::Intrinsic(Opcode::AsyncRead, _) => capabilities.async_io = true,
                Instruction::Intrinsic(..) | Instruction::Op(Opcode::TimerCancel) => {
                    capabilities.cooperative = true
                }
                _ => {}
            }
            code.push(Step {
                instr: *instr,
                target,
            });
        }

        function_index.insert(func.name.clone(), idx as u32);
        functions.push(LinkedFunction {
            name: func.name.clone(),
            params: func.param_count,
            locals: func.local_count,
            code,
        });
    }

    let mut classes = Vec::with_capacity(module.classes.len());
    let mut class_index = FxHashMap::default();
    for (idx, class) in module.classes.iter().enumerate() {
        class_index.insert(class.name.clone(), idx as u32);
        classes.push(LinkedClass {
            name: class.name.clone(),
            fields: class
                .statics
                .iter()
                .map(|f| LinkedField {
                    name: f.name.clone(),
                    kind: declared_kind(&f.initial),
                    initial: f.initial.clone(),
                })
                .collect(),
            methods: class
                .methods
                .iter()
                .map(|m| (m.name.clone(), m.function))
                .collect(),
        });
    }

    Ok(LinkedImage {
        module,
        functions,
        function_index,
        classes,
        class_index,
        natives,
        capabilities,
    })
}
