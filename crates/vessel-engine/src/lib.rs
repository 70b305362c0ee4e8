//! Vessel Engine
//!
//! The managed runtime that Vessel embeds into host applications:
//! - **Bytecode**: module format, encoder/decoder, verifier and builder (`bytecode` module)
//! - **VM**: interpreter, string heap and collector, thread registry, cooperative
//!   scheduler, async-I/O reactor, native bindings and module patching (`vm` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use vessel_engine::bytecode::{Constant, ModuleBuilder};
//! use vessel_engine::{Vm, VmOptions};
//!
//! let mut builder = ModuleBuilder::new("game");
//! let main = builder.declare("main");
//! builder.define(main, 0, 0, |f| {
//!     f.ret_void();
//! });
//! builder.class("Game").static_field("score", Constant::I32(0));
//! builder.entry(main);
//! let module = builder.build()?;
//!
//! let mut vm = Vm::new(VmOptions::default());
//! vm.load(module)?;
//! vm.call_entry()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bytecode;
pub mod vm;

pub use bytecode::{verify_module, Module, ModuleBuilder, ModuleError, VerifyError};
pub use vm::{
    Capabilities, ClassInfo, ExecutionMode, FieldInfo, GcStats, HostValue, NativeFn, PatchReport,
    ThreadError, ThreadRegistry, ValueKind, Vm, VmError, VmOptions,
};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
