//! Vessel VM core
//!
//! This module provides the virtual machine runtime including:
//! - Bytecode interpreter
//! - String heap and mark-sweep collector
//! - Thread registry with stop-the-world safepoints
//! - Cooperative timer/main-loop scheduler
//! - Async-I/O reactor
//! - Host natives and module patching

pub mod gc;
mod interpreter;
mod linker;
pub mod natives;
pub mod reactor;
pub mod scheduler;
pub mod value;

pub use gc::{GcRef, GcStats, Heap, ThreadError, ThreadRegistry};
pub use linker::{Capabilities, LinkError};
pub use natives::{NativeFn, NativeRegistry};
pub use value::{HostValue, Value, ValueKind};

use crate::bytecode::{verify_module, Constant, LoadError, Module};
use interpreter::Interpreter;
use linker::{link, LinkedImage};
use reactor::IoReactor;
use rustc_hash::FxHashMap;
use scheduler::CooperativeScheduler;
use std::sync::Arc;
use std::time::Duration;

/// VM errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// No module is loaded
    #[error("No module loaded")]
    NotLoaded,

    /// A module is already loaded; use [`Vm::patch`] to replace it
    #[error("A module is already loaded")]
    AlreadyLoaded,

    /// Module rejected by the decoder or verifier
    #[error("Invalid module: {0}")]
    Load(#[from] LoadError),

    /// Module could not be linked
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Unknown class
    #[error("Class '{0}' not found")]
    ClassNotFound(String),

    /// Unknown function
    #[error("Function '{0}' not found")]
    FunctionNotFound(String),

    /// Unknown static method
    #[error("Method '{class}.{method}' not found")]
    MethodNotFound {
        /// Class name
        class: String,
        /// Method name
        method: String,
    },

    /// Unknown static field
    #[error("Static field '{class}.{field}' not found")]
    FieldNotFound {
        /// Class name
        class: String,
        /// Field name
        field: String,
    },

    /// Wrong number of arguments
    #[error("'{name}' expects {expected} argument(s), got {found}")]
    ArityMismatch {
        /// Function name
        name: String,
        /// Declared parameter count
        expected: usize,
        /// Arguments supplied
        found: usize,
    },

    /// Value kind does not match the field's declared kind
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Declared kind
        expected: ValueKind,
        /// Supplied kind
        found: ValueKind,
    },

    /// Uncaught exception raised by bytecode
    #[error("Uncaught exception: {message}")]
    Exception {
        /// Exception message
        message: String,
        /// Function names from innermost to outermost
        trace: Vec<String>,
    },

    /// Replacement module is incompatible with the running state
    #[error("Patch rejected: {0}")]
    PatchRejected(String),

    /// Statically compiled code cannot be patched
    #[error("Patching is not supported in static execution mode")]
    PatchUnsupported,

    /// Collection could not stop the other threads
    #[error("Garbage collection stalled: {0}")]
    GcStalled(#[from] ThreadError),
}

/// How loaded code is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Dynamically linked; modules may be patched while running
    Jit,
    /// Statically compiled; the loaded module is final
    Static,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        if cfg!(feature = "jit") {
            ExecutionMode::Jit
        } else {
            ExecutionMode::Static
        }
    }
}

/// VM configuration
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Execution mode
    pub execution_mode: ExecutionMode,
    /// Bytes allocated between collections
    pub gc_threshold: usize,
    /// How long a collection waits for other threads to reach a safepoint
    pub gc_pause_timeout: Duration,
    /// Maximum bytecode call depth before a stack overflow exception
    pub max_call_depth: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            gc_threshold: 1024 * 1024,
            gc_pause_timeout: Duration::from_secs(1),
            max_call_depth: 1024,
        }
    }
}

/// Reflected static field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name
    pub name: String,
    /// Declared kind, `None` if dynamically typed
    pub kind: Option<ValueKind>,
}

/// Reflected class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    /// Class name
    pub name: String,
    /// Static fields in declaration order
    pub fields: Vec<FieldInfo>,
    /// Static method names
    pub methods: Vec<String>,
}

/// Outcome of [`Vm::patch`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Whether any function body, signature or method binding differs
    pub changed: bool,
    /// Functions only in the new module
    pub functions_added: usize,
    /// Functions only in the old module
    pub functions_removed: usize,
    /// Functions present in both whose code differs
    pub functions_changed: usize,
    /// Statics whose live value was carried over
    pub statics_preserved: usize,
    /// Statics initialised from the new module
    pub statics_added: usize,
}

pub(crate) fn value_to_host(heap: &Heap, value: Value) -> HostValue {
    match value {
        Value::Null => HostValue::Null,
        Value::Bool(b) => HostValue::Bool(b),
        Value::I32(i) => HostValue::Int(i),
        Value::F64(x) => HostValue::Float(x),
        Value::Str(r) => match heap.get(r) {
            Some(s) => HostValue::Str(s.to_string()),
            None => HostValue::Null,
        },
    }
}

/// Every `(class, method, function)` binding, sorted
fn method_bindings(image: &LinkedImage) -> Vec<(&str, &str, &str)> {
    let mut bindings: Vec<_> = image
        .classes
        .iter()
        .flat_map(|class| {
            class.methods.iter().map(move |(method, idx)| {
                (
                    class.name.as_str(),
                    method.as_str(),
                    image.functions[*idx as usize].name.as_str(),
                )
            })
        })
        .collect();
    bindings.sort_unstable();
    bindings
}

fn constant_value(heap: &mut Heap, constant: &Constant) -> Value {
    match constant {
        Constant::Null => Value::Null,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::I32(i) => Value::I32(*i),
        Constant::F64(x) => Value::F64(*x),
        Constant::Str(s) => Value::Str(heap.alloc(s.as_str())),
    }
}

/// The Vessel virtual machine
///
/// Owns the heap, the linked module and the event sources. It is `Send` but
/// not internally synchronised: the embedding layer decides which thread
/// drives it.
pub struct Vm {
    options: VmOptions,
    threads: Arc<ThreadRegistry>,
    natives: NativeRegistry,
    heap: Heap,
    image: Option<LinkedImage>,
    statics: Vec<Vec<Value>>,
    scheduler: CooperativeScheduler,
    reactor: IoReactor,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("options", &self.options)
            .field("module", &self.image.as_ref().map(|i| &i.module.name))
            .field("natives", &self.natives)
            .finish()
    }
}

impl Vm {
    /// Create a VM with its own thread registry
    pub fn new(options: VmOptions) -> Self {
        let threads = Arc::new(ThreadRegistry::new(options.gc_pause_timeout));
        Self::with_threads(options, threads)
    }

    /// Create a VM that coordinates collections through `threads`
    pub fn with_threads(options: VmOptions, threads: Arc<ThreadRegistry>) -> Self {
        Self {
            heap: Heap::new(options.gc_threshold),
            options,
            threads,
            natives: NativeRegistry::new(),
            image: None,
            statics: Vec::new(),
            scheduler: CooperativeScheduler::new(),
            reactor: IoReactor::new(),
        }
    }

    /// Options this VM was created with
    pub fn options(&self) -> &VmOptions {
        &self.options
    }

    /// Execution mode
    pub fn execution_mode(&self) -> ExecutionMode {
        self.options.execution_mode
    }

    /// Thread registry used for collector coordination
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    // ===== Loading =====

    /// Verify, link and initialise a module
    ///
    /// Static fields take their initial values. The entry point is not run.
    pub fn load(&mut self, module: Module) -> Result<(), VmError> {
        if self.image.is_some() {
            return Err(VmError::AlreadyLoaded);
        }
        verify_module(&module).map_err(LoadError::from)?;
        let image = link(module, &self.natives)?;

        let heap = &mut self.heap;
        self.statics = image
            .classes
            .iter()
            .map(|class| {
                class
                    .fields
                    .iter()
                    .map(|f| constant_value(heap, &f.initial))
                    .collect()
            })
            .collect();

        tracing::debug!(
            module = %image.module.name,
            functions = image.functions.len(),
            classes = image.classes.len(),
            "module linked"
        );
        self.image = Some(image);
        Ok(())
    }

    /// Whether a module is loaded
    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    /// The loaded module
    pub fn module(&self) -> Option<&Module> {
        self.image.as_ref().map(|i| &i.module)
    }

    /// Register or replace a host native
    ///
    /// Replacing a handler that the loaded module already imports rebinds it
    /// immediately.
    pub fn register_native(&mut self, name: &str, handler: NativeFn) {
        if let Some(image) = self.image.as_mut() {
            image.natives.rebind(name, &handler);
        }
        self.natives.insert(name, handler);
    }

    // ===== Calls =====

    fn run(&mut self, func: u32, args: &[HostValue]) -> Result<HostValue, VmError> {
        let image = self.image.as_ref().ok_or(VmError::NotLoaded)?;
        Interpreter::new(
            image,
            &mut self.heap,
            &mut self.statics,
            &mut self.scheduler,
            &self.reactor,
            &self.threads,
            self.options.max_call_depth,
        )
        .run(func, args)
    }

    /// Run the module's entry point
    pub fn call_entry(&mut self) -> Result<HostValue, VmError> {
        let entry = self.image.as_ref().ok_or(VmError::NotLoaded)?.entry();
        self.run(entry, &[])
    }

    /// Call a function by name
    pub fn call_function(&mut self, name: &str, args: &[HostValue]) -> Result<HostValue, VmError> {
        let image = self.image.as_ref().ok_or(VmError::NotLoaded)?;
        let (idx, _) = image
            .function(name)
            .ok_or_else(|| VmError::FunctionNotFound(name.to_string()))?;
        self.run(idx, args)
    }

    /// Call a static method
    pub fn call_static(
        &mut self,
        class: &str,
        method: &str,
        args: &[HostValue],
    ) -> Result<HostValue, VmError> {
        let image = self.image.as_ref().ok_or(VmError::NotLoaded)?;
        let (_, def) = image
            .class(class)
            .ok_or_else(|| VmError::ClassNotFound(class.to_string()))?;
        let func = *def
            .methods
            .get(method)
            .ok_or_else(|| VmError::MethodNotFound {
                class: class.to_string(),
                method: method.to_string(),
            })?;
        self.run(func, args)
    }

    // ===== Statics =====

    fn static_slot(&self, class: &str, field: &str) -> Result<(usize, usize), VmError> {
        let image = self.image.as_ref().ok_or(VmError::NotLoaded)?;
        let (ci, def) = image
            .class(class)
            .ok_or_else(|| VmError::ClassNotFound(class.to_string()))?;
        let fi = def.field_index(field).ok_or_else(|| VmError::FieldNotFound {
            class: class.to_string(),
            field: field.to_string(),
        })?;
        Ok((ci as usize, fi))
    }

    /// Read a static field
    pub fn get_static(&self, class: &str, field: &str) -> Result<HostValue, VmError> {
        let (ci, fi) = self.static_slot(class, field)?;
        Ok(value_to_host(&self.heap, self.statics[ci][fi]))
    }

    /// Write a static field
    ///
    /// Typed fields accept values of their declared kind, or null.
    pub fn set_static(&mut self, class: &str, field: &str, value: HostValue) -> Result<(), VmError> {
        let (ci, fi) = self.static_slot(class, field)?;
        let declared = self
            .image
            .as_ref()
            .and_then(|i| i.classes[ci].fields[fi].kind);
        if let Some(expected) = declared {
            let found = value.kind();
            if found != expected && found != ValueKind::Null {
                return Err(VmError::TypeMismatch { expected, found });
            }
        }
        let value = match value {
            HostValue::Null => Value::Null,
            HostValue::Bool(b) => Value::Bool(b),
            HostValue::Int(i) => Value::I32(i),
            HostValue::Float(x) => Value::F64(x),
            HostValue::Str(s) => Value::Str(self.heap.alloc(s)),
        };
        self.statics[ci][fi] = value;
        Ok(())
    }

    /// Reflect every class of the loaded module
    pub fn classes(&self) -> Vec<ClassInfo> {
        let Some(image) = self.image.as_ref() else {
            return Vec::new();
        };
        image
            .classes
            .iter()
            .map(|class| {
                let mut methods: Vec<String> = class.methods.keys().cloned().collect();
                methods.sort();
                ClassInfo {
                    name: class.name.clone(),
                    fields: class
                        .fields
                        .iter()
                        .map(|f| FieldInfo {
                            name: f.name.clone(),
                            kind: f.kind,
                        })
                        .collect(),
                    methods,
                }
            })
            .collect()
    }

    /// Reflect one class
    pub fn class_info(&self, name: &str) -> Option<ClassInfo> {
        self.classes().into_iter().find(|c| c.name == name)
    }

    // ===== Event sources =====

    /// Event-loop facilities in use: those the module was linked with, plus
    /// any that currently have live registrations
    pub fn capabilities(&self) -> Capabilities {
        let linked = self
            .image
            .as_ref()
            .map(|i| i.capabilities)
            .unwrap_or_default();
        Capabilities {
            cooperative: linked.cooperative || self.scheduler.is_active(),
            async_io: linked.async_io || self.reactor.in_flight() > 0 || self.reactor.has_ready(),
        }
    }

    /// Whether a cooperative tick taken now (or `hint` seconds from now) would run anything
    pub fn has_pending_cooperative(&self, hint: Option<f64>) -> bool {
        self.scheduler.has_pending(hint)
    }

    /// Advance the virtual clock and run everything due
    ///
    /// Stops at the first uncaught exception; callbacks that were due but did
    /// not get to run stay scheduled. Returns the number of callbacks run.
    pub fn drain_cooperative(&mut self, hint: Option<f64>) -> Result<usize, VmError> {
        if self.image.is_none() {
            return Ok(0);
        }
        self.scheduler.advance(hint);
        let mut due = self.scheduler.take_due().into_iter();
        let mut ran = 0;
        while let Some(cb) = due.next() {
            let Some(idx) = self.function_index(&cb.callback) else {
                tracing::warn!(callback = %cb.callback, "scheduled callback no longer exists");
                continue;
            };
            if let Err(e) = self.run(idx, &[]) {
                self.scheduler.defer(due);
                return Err(e);
            }
            ran += 1;
        }
        Ok(ran)
    }

    /// Whether async-I/O completions are waiting
    pub fn has_pending_async_io(&self) -> bool {
        self.reactor.has_ready()
    }

    /// Async-I/O requests still running in the background
    pub fn async_io_in_flight(&self) -> usize {
        self.reactor.in_flight()
    }

    /// Dispatch the async-I/O completions ready right now
    pub fn drain_async_io(&mut self) -> Result<usize, VmError> {
        if self.image.is_none() {
            return Ok(0);
        }
        let mut ready = self.reactor.take_ready().into_iter();
        let mut ran = 0;
        while let Some(completion) = ready.next() {
            self.reactor.dispatched(completion.id);
            let Some(idx) = self.function_index(&completion.callback) else {
                tracing::warn!(callback = %completion.callback, "I/O callback no longer exists");
                continue;
            };
            let arg = match &completion.result {
                Ok(contents) => HostValue::Str(contents.clone()),
                Err(e) => {
                    tracing::warn!(callback = %completion.callback, error = %e, "async read failed");
                    HostValue::Null
                }
            };
            if let Err(e) = self.run(idx, &[arg]) {
                self.reactor.defer(ready);
                return Err(e);
            }
            ran += 1;
        }
        Ok(ran)
    }

    fn function_index(&self, name: &str) -> Option<u32> {
        self.image
            .as_ref()
            .and_then(|i| i.function_index.get(name).copied())
    }

    // ===== Collection =====

    /// Collect garbage now, rooted at the static fields
    pub fn collect_garbage(&mut self) -> Result<GcStats, VmError> {
        let heap = &mut self.heap;
        let statics = &self.statics;
        let freed = self.threads.stop_the_world(|| {
            heap.collect(statics.iter().flatten().filter_map(Value::as_gc_ref))
        })?;
        tracing::debug!(freed, "explicit collection");
        Ok(self.gc_stats())
    }

    /// Collector statistics
    pub fn gc_stats(&self) -> GcStats {
        GcStats {
            stalled_pauses: self.threads.stalled_pauses(),
            ..self.heap.stats()
        }
    }

    // ===== Patching =====

    /// Replace the loaded module while keeping the heap
    ///
    /// The new module is verified and linked aside. Static fields present in
    /// both modules keep their live values; new ones take their initial
    /// values. The swap happens only if every check passes: a static whose
    /// declared kind changed, or a scheduled callback that no longer exists,
    /// rejects the patch and leaves the running module untouched.
    pub fn patch(&mut self, module: Module) -> Result<PatchReport, VmError> {
        if self.options.execution_mode == ExecutionMode::Static {
            return Err(VmError::PatchUnsupported);
        }
        let old = self.image.as_ref().ok_or(VmError::NotLoaded)?;
        verify_module(&module).map_err(LoadError::from)?;
        let image = link(module, &self.natives)?;

        let mut report = PatchReport::default();
        let mut statics: Vec<Vec<Value>> = Vec::with_capacity(image.classes.len());
        let mut fresh = Vec::new();
        for (ci, class) in image.classes.iter().enumerate() {
            let old_class = old.class(&class.name);
            let mut values = Vec::with_capacity(class.fields.len());
            for (fi, field) in class.fields.iter().enumerate() {
                let carried = old_class.and_then(|(oci, oc)| {
                    oc.field_index(&field.name)
                        .map(|ofi| (self.statics[oci as usize][ofi], oc.fields[ofi].kind))
                });
                let Some((live, old_kind)) = carried else {
                    fresh.push((ci, fi));
                    values.push(Value::Null);
                    report.statics_added += 1;
                    continue;
                };
                if let (Some(new_kind), Some(old_kind)) = (field.kind, old_kind) {
                    if new_kind != old_kind {
                        return Err(VmError::PatchRejected(format!(
                            "static '{}.{}' changed kind from {old_kind} to {new_kind}",
                            class.name, field.name
                        )));
                    }
                }
                if let Some(new_kind) = field.kind {
                    if live.kind() != new_kind && live != Value::Null {
                        return Err(VmError::PatchRejected(format!(
                            "static '{}.{}' holds a {} but is now declared {new_kind}",
                            class.name,
                            field.name,
                            live.kind()
                        )));
                    }
                }
                values.push(live);
                report.statics_preserved += 1;
            }
            statics.push(values);
        }

        let io_callbacks = self.reactor.pending_callbacks();
        let pending = self
            .scheduler
            .callback_names()
            .chain(io_callbacks.iter().map(String::as_str));
        for name in pending {
            if image.function(name).is_none() {
                return Err(VmError::PatchRejected(format!(
                    "scheduled callback '{name}' is missing from the new module"
                )));
            }
        }

        let old_functions: FxHashMap<&str, _> = old
            .module
            .functions
            .iter()
            .map(|f| (f.name.as_str(), f))
            .collect();
        for func in &image.module.functions {
            match old_functions.get(func.name.as_str()) {
                Some(prev) if *prev == func => {}
                Some(_) => report.functions_changed += 1,
                None => report.functions_added += 1,
            }
        }
        report.functions_removed = old
            .module
            .functions
            .iter()
            .filter(|f| image.function(&f.name).is_none())
            .count();
        let methods_changed = method_bindings(old) != method_bindings(&image);
        report.changed = report.functions_added > 0
            || report.functions_removed > 0
            || report.functions_changed > 0
            || methods_changed;

        for (ci, fi) in fresh {
            statics[ci][fi] = constant_value(&mut self.heap, &image.classes[ci].fields[fi].initial);
        }

        tracing::info!(
            module = %image.module.name,
            changed = report.changed,
            preserved = report.statics_preserved,
            added = report.statics_added,
            "module patched"
        );
        self.image = Some(image);
        self.statics = statics;
        Ok(report)
    }
}
