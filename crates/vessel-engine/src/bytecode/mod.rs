//! Bytecode definitions
//!
//! Instruction set, module container format, verifier and an assembler-style
//! builder used by tools and tests to produce modules.

pub mod builder;
pub mod encoder;
pub mod instruction;
pub mod module;
pub mod opcode;
pub mod verify;

pub use builder::{BuildError, ClassBuilder, FunctionBuilder, Label, ModuleBuilder};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use instruction::{decode_code, Instruction};
pub use module::{flags, Class, Constant, Function, Method, Module, ModuleError, StaticField};
pub use opcode::Opcode;
pub use verify::{verify_module, VerifyError};

/// Decode and verify a module image in one step.
///
/// This is what loaders want: an image that decodes but fails verification is
/// just as unusable as one with a bad header.
pub fn load_module(bytes: &[u8]) -> Result<Module, LoadError> {
    let module = Module::decode(bytes)?;
    verify_module(&module)?;
    Ok(module)
}

/// Failure to accept a module image
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Header or payload could not be decoded
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Payload decoded but is not well formed
    #[error(transparent)]
    Verify(#[from] VerifyError),
}
