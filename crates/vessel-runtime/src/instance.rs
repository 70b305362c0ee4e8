//! The VM instance and its lifecycle
//!
//! [`Vessel`] is a cheap, cloneable handle to the single process-wide
//! instance. The handle owns the embedded [`Vm`], the lifecycle state machine
//! and the last-error slot; the integration mode, event multiplexer,
//! threaded engine, hot reload and guard operations live in their own
//! modules as further `impl Vessel` blocks.

use crate::config::VesselConfig;
use crate::error::{ErrorCode, VesselError, VesselResult};
use crate::events::Multiplexer;
use crate::lifecycle::LifecycleState;
use crate::mode::IntegrationMode;
use crate::registry::ProcessRegistry;
use crate::reload::{FileSignature, ReloadCallback};
use crate::threaded::Engine;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use vessel_engine::bytecode::load_module;
use vessel_engine::{HostValue, ThreadRegistry, Vm};

/// Lifecycle-level state, guarded by one lock
pub(crate) struct Core {
    pub state: LifecycleState,
    pub mode: IntegrationMode,
    /// Thread that called `init`
    pub init_thread: Option<ThreadId>,
    /// VM thread while the threaded engine owns the VM
    pub vm_thread: Option<ThreadId>,
    pub args: Vec<String>,
    pub hot_reload: bool,
    pub loaded_file: Option<PathBuf>,
    pub signature: Option<FileSignature>,
}

pub(crate) struct Inner {
    pub config: VesselConfig,
    pub threads: Arc<ThreadRegistry>,
    pub core: Mutex<Core>,
    pub vm: Mutex<Option<Vm>>,
    /// Thread inside `with_vm`, to tell re-entry from contention
    pub vm_owner: Mutex<Option<ThreadId>>,
    pub error: Mutex<Option<(ErrorCode, String)>>,
    pub engine: Mutex<Engine>,
    pub sources: Mutex<Multiplexer>,
    pub reload_callback: Mutex<Option<ReloadCallback>>,
}

/// Handle to the process-wide VM instance
///
/// Clones refer to the same instance. Every fallible operation returns a
/// [`VesselError`] and also records it as the instance's last error.
#[derive(Clone)]
pub struct Vessel {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Vessel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Vessel")
            .field("state", &core.state)
            .field("mode", &core.mode)
            .field("hot_reload", &core.hot_reload)
            .finish()
    }
}

impl Vessel {
    // ===== Creation =====

    /// Create the process-wide instance with configuration from the environment
    ///
    /// Fails with `AlreadyInitialized` if an instance was ever created in
    /// this process; the existing instance is left untouched.
    pub fn create() -> VesselResult<Self> {
        let config = VesselConfig::from_env().map_err(|e| VesselError::InitFailed(e.to_string()))?;
        Self::create_in(ProcessRegistry::global(), config)
    }

    /// Create the process-wide instance with explicit configuration
    pub fn create_with_config(config: VesselConfig) -> VesselResult<Self> {
        Self::create_in(ProcessRegistry::global(), config)
    }

    /// Create an instance claimed in `registry`
    pub fn create_in(registry: &ProcessRegistry, config: VesselConfig) -> VesselResult<Self> {
        let threads = Arc::new(ThreadRegistry::new(config.vm_options().gc_pause_timeout));
        let inner = Arc::new(Inner {
            threads,
            core: Mutex::new(Core {
                state: LifecycleState::Uninitialized,
                mode: IntegrationMode::NonThreaded,
                init_thread: None,
                vm_thread: None,
                args: Vec::new(),
                hot_reload: config.hot_reload.enabled,
                loaded_file: None,
                signature: None,
            }),
            config,
            vm: Mutex::new(None),
            vm_owner: Mutex::new(None),
            error: Mutex::new(None),
            engine: Mutex::new(Engine::new()),
            sources: Mutex::new(Multiplexer::new()),
            reload_callback: Mutex::new(None),
        });
        if !registry.claim(&inner) {
            return Err(VesselError::AlreadyInitialized(
                "a VM instance already exists in this process".to_string(),
            ));
        }
        tracing::debug!("instance created");
        Ok(Self { inner })
    }

    /// The instance created in this process, if any handle to it is still alive
    pub fn current() -> Option<Self> {
        ProcessRegistry::global()
            .current()
            .map(|inner| Self { inner })
    }

    /// Configuration this instance was created with
    pub fn config(&self) -> &VesselConfig {
        &self.inner.config
    }

    // ===== Error state =====

    /// Record the error of a failed operation
    pub(crate) fn tracked<T>(&self, op: impl FnOnce() -> VesselResult<T>) -> VesselResult<T> {
        let result = op();
        if let Err(err) = &result {
            self.record(err);
        }
        result
    }

    pub(crate) fn record(&self, err: &VesselError) {
        tracing::debug!(code = %err.code(), error = %err, "operation failed");
        *self.inner.error.lock() = Some((err.code(), err.to_string()));
    }

    /// Record a failure detected by a binding layer (bad arguments, bad encodings)
    ///
    /// Returns the code it was recorded under.
    pub fn record_error(&self, err: &VesselError) -> ErrorCode {
        self.record(err);
        err.code()
    }

    /// Code and message of the most recent failure
    ///
    /// Successful operations do not clear it.
    pub fn last_error(&self) -> Option<(ErrorCode, String)> {
        self.inner.error.lock().clone()
    }

    /// Code of the most recent failure, `ErrorCode::Ok` if none
    pub fn error_code(&self) -> ErrorCode {
        self.inner
            .error
            .lock()
            .as_ref()
            .map_or(ErrorCode::Ok, |(code, _)| *code)
    }

    /// Message of the most recent failure, empty if none
    pub fn error_message(&self) -> String {
        self.inner
            .error
            .lock()
            .as_ref()
            .map(|(_, message)| message.clone())
            .unwrap_or_default()
    }

    /// Forget the recorded failure
    pub fn clear_error(&self) {
        *self.inner.error.lock() = None;
    }

    // ===== Thread affinity =====

    /// Check that the calling thread may touch the VM
    ///
    /// Non-threaded: the thread that called `init` and threads registered
    /// with `worker_register`. Threaded: the VM thread while it runs, the
    /// same set as non-threaded while it is stopped.
    pub(crate) fn check_affinity(&self, core: &Core) -> VesselResult<()> {
        let me = thread::current().id();
        match (core.mode, core.vm_thread) {
            (IntegrationMode::Threaded, Some(vm_thread)) if vm_thread != me => {
                Err(VesselError::WrongThread(
                    "the VM thread owns the instance; use call_sync or call_async".to_string(),
                ))
            }
            (IntegrationMode::Threaded, Some(_)) => Ok(()),
            _ if core.init_thread == Some(me) => Ok(()),
            _ if core.init_thread.is_some() && self.inner.threads.is_registered(me) => Ok(()),
            _ => Err(VesselError::WrongThread(
                "only the init thread and registered workers may touch the VM".to_string(),
            )),
        }
    }

    fn require_live(core: &Core) -> VesselResult<()> {
        match core.state {
            LifecycleState::Destroyed => {
                Err(VesselError::NotInitialized("instance destroyed".to_string()))
            }
            LifecycleState::Uninitialized => {
                Err(VesselError::NotInitialized("init has not been called".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Run `f` on the VM after the lifecycle and affinity checks
    pub(crate) fn with_vm<T>(&self, f: impl FnOnce(&mut Vm) -> VesselResult<T>) -> VesselResult<T> {
        {
            let core = self.inner.core.lock();
            Self::require_live(&core)?;
            self.check_affinity(&core)?;
        }
        let me = thread::current().id();
        let mut guard = match self.inner.vm.try_lock() {
            Some(guard) => guard,
            None if *self.inner.vm_owner.lock() == Some(me) => {
                return Err(VesselError::CallFailed(
                    "re-entrant call into the instance from a native".to_string(),
                ))
            }
            None => {
                // Another admitted thread is inside; wait where a collection can't see us
                let bracketed = self.inner.threads.blocking_begin().is_ok();
                let guard = self.inner.vm.lock();
                if bracketed {
                    self.inner.threads.blocking_end()?;
                }
                guard
            }
        };
        let vm = guard
            .as_mut()
            .ok_or_else(|| VesselError::NotInitialized("runtime not built".to_string()))?;
        let _owner = OwnerMark::set(&self.inner.vm_owner, me);
        f(vm)
    }

    /// [`with_vm`](Self::with_vm), additionally requiring a linked module
    pub(crate) fn with_loaded_vm<T>(
        &self,
        f: impl FnOnce(&mut Vm) -> VesselResult<T>,
    ) -> VesselResult<T> {
        if !self.inner.core.lock().state.has_module() {
            return Err(VesselError::NotInitialized("no module loaded".to_string()));
        }
        self.with_vm(f)
    }

    // ===== Lifecycle =====

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.inner.core.lock().state
    }

    /// Build the runtime and register the calling thread with the collector
    ///
    /// `args` is kept for the embedded program's introspection.
    pub fn init(&self, args: &[String]) -> VesselResult<()> {
        self.tracked(|| {
            let mut core = self.inner.core.lock();
            match core.state {
                LifecycleState::Uninitialized => {}
                LifecycleState::Destroyed => {
                    return Err(VesselError::NotInitialized("instance destroyed".to_string()))
                }
                _ => {
                    return Err(VesselError::AlreadyInitialized(
                        "init was already called".to_string(),
                    ))
                }
            }

            let vm = Vm::with_threads(self.inner.config.vm_options(), self.inner.threads.clone());
            let mode = vm.execution_mode();
            *self.inner.vm.lock() = Some(vm);
            self.inner.threads.register_current();

            core.init_thread = Some(thread::current().id());
            core.args = args.to_vec();
            core.state = LifecycleState::Created;
            tracing::info!(execution = ?mode, args = args.len(), "VM initialized");
            Ok(())
        })
    }

    /// Arguments passed to `init`
    pub fn args(&self) -> Vec<String> {
        self.inner.core.lock().args.clone()
    }

    /// Load a bytecode file
    pub fn load_file(&self, path: impl AsRef<Path>) -> VesselResult<()> {
        let path = path.as_ref();
        self.tracked(|| {
            let bytes = std::fs::read(path).map_err(|e| VesselError::FileNotFound {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            self.load_bytes(&bytes, Some(path))
        })
    }

    /// Load bytecode from memory
    ///
    /// The buffer is decoded before returning and not retained.
    pub fn load_memory(&self, bytes: &[u8]) -> VesselResult<()> {
        self.tracked(|| self.load_bytes(bytes, None))
    }

    fn load_bytes(&self, bytes: &[u8], path: Option<&Path>) -> VesselResult<()> {
        {
            let core = self.inner.core.lock();
            Self::require_live(&core)?;
            if core.state >= LifecycleState::ModuleLoaded {
                return Err(VesselError::AlreadyInitialized(
                    "a module is already loaded; use hot reload to replace it".to_string(),
                ));
            }
            self.check_affinity(&core)?;
        }

        let module = load_module(bytes).map_err(|e| VesselError::InvalidBytecode(e.to_string()))?;
        let name = module.name.clone();
        self.inner.core.lock().state = LifecycleState::Initialized;

        self.with_vm(|vm| {
            vm.load(module)
                .map_err(|e| VesselError::ModuleLoadFailed(e.to_string()))
        })?;

        let signature = path.and_then(FileSignature::of);
        let mut core = self.inner.core.lock();
        core.state = LifecycleState::ModuleLoaded;
        core.loaded_file = path.map(Path::to_path_buf);
        core.signature = signature;
        tracing::info!(module = %name, path = ?path, "module loaded");
        Ok(())
    }

    /// Run the module's entry point, exactly once
    ///
    /// An uncaught exception fails with `ExceptionThrown` and leaves the
    /// instance in `ModuleLoaded`. In threaded mode the VM thread calls this
    /// itself when it starts; other threads get `WrongThread`.
    pub fn call_entry(&self) -> VesselResult<()> {
        self.tracked(|| {
            {
                let core = self.inner.core.lock();
                Self::require_live(&core)?;
                match core.state {
                    LifecycleState::ModuleLoaded => {}
                    LifecycleState::EntryRan => {
                        return Err(VesselError::AlreadyInitialized(
                            "the entry point already ran".to_string(),
                        ))
                    }
                    _ => {
                        return Err(VesselError::NotInitialized("no module loaded".to_string()))
                    }
                }
                if core.mode == IntegrationMode::Threaded
                    && core.vm_thread != Some(thread::current().id())
                {
                    return Err(VesselError::WrongThread(
                        "in threaded mode the VM thread runs the entry point".to_string(),
                    ));
                }
            }

            let result = self.with_vm(|vm| vm.call_entry().map_err(VesselError::from));
            match result {
                Ok(_) => {
                    self.inner.core.lock().state = LifecycleState::EntryRan;
                    tracing::info!("entry point ran");
                    Ok(())
                }
                Err(err) => {
                    tracing::error!(error = %err, "entry point failed");
                    Err(err)
                }
            }
        })
    }

    /// Tear the instance down
    ///
    /// Always ends in `Destroyed`. Stops the VM thread with the bounded stop
    /// policy; if that or releasing the runtime fails the error is reported as
    /// `DestroyFailed`, but teardown still completes. Every later operation
    /// fails with `NotInitialized`, and no replacement instance can be created.
    pub fn destroy(&self) -> VesselResult<()> {
        self.tracked(|| {
            if self.inner.core.lock().state == LifecycleState::Destroyed {
                return Err(VesselError::NotInitialized(
                    "instance already destroyed".to_string(),
                ));
            }

            let mut problems = Vec::new();
            if let Err(e) = self.shutdown_engine() {
                problems.push(e.to_string());
            }

            match self.inner.vm.try_lock() {
                Some(mut vm) => drop(vm.take()),
                None => problems.push("runtime is busy and was not released".to_string()),
            }

            let mut core = self.inner.core.lock();
            if core.init_thread == Some(thread::current().id())
                && self.inner.threads.is_registered(thread::current().id())
            {
                let _ = self.inner.threads.unregister_current();
            }
            core.state = LifecycleState::Destroyed;
            drop(core);
            tracing::info!("VM destroyed");

            if problems.is_empty() {
                Ok(())
            } else {
                Err(VesselError::DestroyFailed(problems.join("; ")))
            }
        })
    }

    // ===== Introspection =====

    /// Version of this embedding layer
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Version of the embedded runtime
    pub fn runtime_version() -> &'static str {
        vessel_engine::VERSION
    }

    /// Whether loaded code is dynamically linked (and so can be hot reloaded)
    pub fn is_jit_mode(&self) -> bool {
        self.inner.config.vm_options().execution_mode == vessel_engine::ExecutionMode::Jit
    }

    /// Name of the loaded module
    pub fn module_name(&self) -> Option<String> {
        self.inner
            .vm
            .try_lock()
            .and_then(|vm| vm.as_ref()?.module().map(|m| m.name.clone()))
    }

    /// Call any function of the loaded module by name
    pub fn call_function(&self, name: &str, args: &[HostValue]) -> VesselResult<HostValue> {
        self.tracked(|| {
            self.with_loaded_vm(|vm| vm.call_function(name, args).map_err(VesselError::from))
        })
    }
}

/// Marks the `with_vm` owner until dropped
struct OwnerMark<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> OwnerMark<'a> {
    fn set(slot: &'a Mutex<Option<ThreadId>>, id: ThreadId) -> Self {
        *slot.lock() = Some(id);
        Self(slot)
    }
}

impl Drop for OwnerMark<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}
