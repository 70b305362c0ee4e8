//! Bytecode verification
//!
//! Structural checks run on every module before it is linked: every operand
//! must reference something that exists, every jump must land on an
//! instruction boundary, and no function may run off the end of its code.

use super::encoder::DecodeError;
use super::instruction::{decode_code, Instruction};
use super::module::{Function, Module};
use super::opcode::Opcode;
use rustc_hash::FxHashSet;

/// Bytecode verification errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Function body could not be decoded
    #[error("In function '{function}': {source}")]
    Decode {
        /// Function name
        function: String,
        /// Underlying decode error
        source: DecodeError,
    },

    /// Invalid jump target
    #[error("In function '{function}': invalid jump target {target} at offset {offset}")]
    InvalidJumpTarget {
        /// Function name
        function: String,
        /// The invalid jump target
        target: i64,
        /// Offset of the jump instruction
        offset: usize,
    },

    /// Operand references something that does not exist
    #[error("In function '{function}': invalid {what} reference {index} at offset {offset}")]
    InvalidReference {
        /// Function name
        function: String,
        /// Kind of reference (local, string, function, class, static, native)
        what: &'static str,
        /// The referenced index
        index: u32,
        /// Offset of the instruction
        offset: usize,
    },

    /// Callback passed to an intrinsic has the wrong parameter count
    #[error("In function '{function}': callback '{callback}' must take {expected} parameter(s)")]
    CallbackArity {
        /// Function name
        function: String,
        /// Callback function name
        callback: String,
        /// Required parameter count
        expected: u16,
    },

    /// Execution falls off end
    #[error("Execution falls off end of function '{0}'")]
    FallOffEnd(String),

    /// Fewer local slots than parameters
    #[error("Function '{0}' declares fewer locals than parameters")]
    LocalsBelowParams(String),

    /// Two definitions share a name
    #[error("Duplicate {what} '{name}'")]
    Duplicate {
        /// Kind of definition
        what: &'static str,
        /// The repeated name
        name: String,
    },

    /// Static method bound to a missing function
    #[error("Method '{class}.{method}' refers to missing function {function}")]
    InvalidMethod {
        /// Class name
        class: String,
        /// Method name
        method: String,
        /// Function index
        function: u32,
    },

    /// Entry point missing or takes parameters
    #[error("Invalid entry point {0}")]
    InvalidEntryPoint(u32),
}

/// Verify a module
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    let mut seen = FxHashSet::default();
    for func in &module.functions {
        if !seen.insert(func.name.as_str()) {
            return Err(VerifyError::Duplicate {
                what: "function",
                name: func.name.clone(),
            });
        }
        if func.local_count < func.param_count {
            return Err(VerifyError::LocalsBelowParams(func.name.clone()));
        }
    }

    seen.clear();
    for class in &module.classes {
        if !seen.insert(class.name.as_str()) {
            return Err(VerifyError::Duplicate {
                what: "class",
                name: class.name.clone(),
            });
        }
        let mut members = FxHashSet::default();
        for field in &class.statics {
            if !members.insert(field.name.as_str()) {
                return Err(VerifyError::Duplicate {
                    what: "static field",
                    name: format!("{}.{}", class.name, field.name),
                });
            }
        }
        members.clear();
        for method in &class.methods {
            if !members.insert(method.name.as_str()) {
                return Err(VerifyError::Duplicate {
                    what: "method",
                    name: format!("{}.{}", class.name, method.name),
                });
            }
            if module.functions.get(method.function as usize).is_none() {
                return Err(VerifyError::InvalidMethod {
                    class: class.name.clone(),
                    method: method.name.clone(),
                    function: method.function,
                });
            }
        }
    }

    match module.entry_function() {
        Some(entry) if entry.param_count == 0 => {}
        _ => return Err(VerifyError::InvalidEntryPoint(module.entry)),
    }

    for func in &module.functions {
        verify_function(module, func)?;
    }
    Ok(())
}

fn verify_function(module: &Module, func: &Function) -> Result<(), VerifyError> {
    let decoded = decode_code(&func.code).map_err(|source| VerifyError::Decode {
        function: func.name.clone(),
        source,
    })?;

    let boundaries: FxHashSet<usize> = decoded.iter().map(|(offset, _)| *offset).collect();
    let invalid = |what: &'static str, index: u32, offset: usize| VerifyError::InvalidReference {
        function: func.name.clone(),
        what,
        index,
        offset,
    };

    for (offset, instr) in &decoded {
        let offset = *offset;
        let next = offset + 1 + instr.opcode().operand_size();
        match *instr {
            Instruction::ConstStr(idx) => {
                if idx as usize >= module.strings.len() {
                    return Err(invalid("string", idx, offset));
                }
            }
            Instruction::LoadLocal(slot) | Instruction::StoreLocal(slot) => {
                if slot >= func.local_count {
                    return Err(invalid("local", slot as u32, offset));
                }
            }
            Instruction::LoadStatic { class, field } | Instruction::StoreStatic { class, field } => {
                let Some(def) = module.classes.get(class as usize) else {
                    return Err(invalid("class", class, offset));
                };
                if field as usize >= def.statics.len() {
                    return Err(invalid("static", field as u32, offset));
                }
            }
            Instruction::Jump(_, rel) => {
                let target = next as i64 + rel as i64;
                if target < 0 || !boundaries.contains(&(target as usize)) {
                    return Err(VerifyError::InvalidJumpTarget {
                        function: func.name.clone(),
                        target,
                        offset,
                    });
                }
            }
            Instruction::Call(idx) => {
                if idx as usize >= module.functions.len() {
                    return Err(invalid("function", idx, offset));
                }
            }
            Instruction::CallNative { native, .. } => {
                if native as usize >= module.natives.len() {
                    return Err(invalid("native", native as u32, offset));
                }
            }
            Instruction::Intrinsic(op, idx) => {
                let Some(callback) = module.functions.get(idx as usize) else {
                    return Err(invalid("function", idx, offset));
                };
                let expected = if op == Opcode::AsyncRead { 1 } else { 0 };
                if callback.param_count != expected {
                    return Err(VerifyError::CallbackArity {
                        function: func.name.clone(),
                        callback: callback.name.clone(),
                        expected,
                    });
                }
            }
            Instruction::Op(_) | Instruction::ConstI32(_) | Instruction::ConstF64(_) => {}
        }
    }

    match decoded.last() {
        Some((_, instr)) if instr.opcode().is_terminator() => Ok(()),
        _ => Err(VerifyError::FallOffEnd(func.name.clone())),
    }
}
