//! C FFI bindings for the Vessel VM
//!
//! This module provides a C-compatible API for embedding the Vessel VM in a
//! host application. The API follows these principles:
//! - ABI-stable (uses only C-compatible types)
//! - Every fallible call returns a `VesselErrorCode`; details via `vessel_get_error`
//! - Opaque pointers for VM objects, freed by their matching `_free` function
//! - No panic crosses the boundary
//!
//! Enumerations arriving from C (`mode`, `kind`) are passed as `int` and
//! validated; enumerations returned to C use the `#[repr(C)]` types.

use libc::{c_char, c_int, c_void, size_t};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use vessel_engine::{ClassInfo, HostValue, ValueKind};
use vessel_runtime::{
    CallOutcome, EngineStatus, ErrorCode, EventLoopKind, IntegrationMode, LifecycleState, Vessel,
    VesselConfig, VesselError, VesselResult,
};

// ============================================================================
// Opaque Types
// ============================================================================

/// Opaque handle to the VM instance
#[repr(C)]
pub struct VesselVm {
    _private: [u8; 0],
}

/// Opaque handle to a reflected type
#[repr(C)]
pub struct VesselType {
    _private: [u8; 0],
}

/// Opaque handle to a value
#[repr(C)]
pub struct VesselValue {
    _private: [u8; 0],
}

/// Kind of a `VesselValue`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VesselValueKind {
    /// Null
    Null = 0,
    /// Boolean
    Bool = 1,
    /// 32-bit integer
    Int = 2,
    /// 64-bit float
    Float = 3,
    /// String
    String = 4,
}

impl From<ValueKind> for VesselValueKind {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Null => VesselValueKind::Null,
            ValueKind::Bool => VesselValueKind::Bool,
            ValueKind::Int => VesselValueKind::Int,
            ValueKind::Float => VesselValueKind::Float,
            ValueKind::String => VesselValueKind::String,
        }
    }
}

/// Work run on the VM thread by `vessel_thread_call_sync` / `_async`
pub type VesselThreadFn = extern "C" fn(vm: *mut VesselVm, ctx: *mut c_void);

/// Completion of `vessel_thread_call_async`, run on the VM thread
pub type VesselCompletionFn = extern "C" fn(vm: *mut VesselVm, ctx: *mut c_void, status: ErrorCode);

/// Reload outcome notification
pub type VesselReloadFn = extern "C" fn(success: bool, ctx: *mut c_void);

/// Host function callable from bytecode
///
/// `args` are borrowed for the duration of the call. The returned value is
/// owned by the VM; return NULL for null.
pub type VesselNativeFn =
    extern "C" fn(args: *const *const VesselValue, argc: size_t, ctx: *mut c_void) -> *mut VesselValue;

// Internal representation of the VM handle (not exposed to C)
struct VmHandle {
    vessel: Vessel,
    /// Backing store for the last `vessel_get_error` result
    message: Mutex<CString>,
}

// Internal representation of a value (not exposed to C)
struct ValueHandle {
    value: HostValue,
    /// NUL-terminated copy of a string payload
    text: Option<CString>,
}

impl ValueHandle {
    fn new(value: HostValue) -> Self {
        let text = value.as_str().and_then(|s| CString::new(s).ok());
        Self { value, text }
    }
}

// Internal representation of a reflected type (not exposed to C)
struct TypeHandle {
    name: CString,
    fields: Vec<CString>,
    methods: Vec<CString>,
}

impl TypeHandle {
    fn new(info: ClassInfo) -> Self {
        let c = |s: &str| CString::new(s).unwrap_or_default();
        Self {
            name: c(&info.name),
            fields: info.fields.iter().map(|f| c(f.name.as_str())).collect(),
            methods: info.methods.iter().map(|m| c(m.as_str())).collect(),
        }
    }
}

/// Raw pointer handed to the VM thread
///
/// The C caller guarantees the pointee outlives the call it was passed to.
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    fn get(self) -> *mut c_void {
        self.0
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn ffi_guard(f: impl FnOnce() -> ErrorCode) -> ErrorCode {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!("panic caught at the C boundary");
        ErrorCode::Unknown
    })
}

fn status<T>(result: VesselResult<T>) -> ErrorCode {
    match result {
        Ok(_) => ErrorCode::Ok,
        Err(e) => e.code(),
    }
}

fn into_handle(vessel: Vessel) -> *mut VesselVm {
    let handle = Box::new(VmHandle {
        vessel,
        message: Mutex::new(CString::default()),
    });
    Box::into_raw(handle) as *mut VesselVm
}

unsafe fn handle<'a>(vm: *mut VesselVm) -> Option<&'a VmHandle> {
    (vm as *const VmHandle).as_ref()
}

/// Run `f` on a valid handle; NULL handles fail with `InvalidArgument`
unsafe fn with_handle(vm: *mut VesselVm, f: impl FnOnce(&VmHandle) -> ErrorCode) -> ErrorCode {
    match handle(vm) {
        Some(h) => ffi_guard(|| f(h)),
        None => ErrorCode::InvalidArgument,
    }
}

fn invalid(vessel: &Vessel, message: String) -> ErrorCode {
    vessel.record_error(&VesselError::InvalidArgument(message))
}

unsafe fn c_str<'a>(vessel: &Vessel, s: *const c_char, what: &str) -> Result<&'a str, ErrorCode> {
    if s.is_null() {
        return Err(invalid(vessel, format!("{what} is NULL")));
    }
    CStr::from_ptr(s)
        .to_str()
        .map_err(|_| invalid(vessel, format!("{what} is not valid UTF-8")))
}

unsafe fn byte_slice<'a>(
    vessel: &Vessel,
    data: *const u8,
    size: size_t,
) -> Result<&'a [u8], ErrorCode> {
    if data.is_null() {
        return if size == 0 {
            Ok(&[])
        } else {
            Err(invalid(vessel, "bytecode pointer is NULL".to_string()))
        };
    }
    Ok(std::slice::from_raw_parts(data, size))
}

fn event_kind(vessel: &Vessel, kind: c_int) -> Result<EventLoopKind, ErrorCode> {
    match kind {
        0 => Ok(EventLoopKind::AsyncIo),
        1 => Ok(EventLoopKind::Cooperative),
        2 => Ok(EventLoopKind::All),
        other => Err(invalid(vessel, format!("unknown event loop kind {other}"))),
    }
}

fn into_value(value: HostValue) -> *mut VesselValue {
    Box::into_raw(Box::new(ValueHandle::new(value))) as *mut VesselValue
}

unsafe fn value_ref<'a>(value: *const VesselValue) -> Option<&'a ValueHandle> {
    (value as *const ValueHandle).as_ref()
}

unsafe fn write_out<T>(out: *mut T, value: T) {
    if !out.is_null() {
        *out = value;
    }
}

fn create_handle(config: Result<VesselConfig, String>, out_vm: *mut *mut VesselVm) -> ErrorCode {
    let config = match config {
        Ok(config) => config,
        Err(reason) => {
            tracing::warn!(%reason, "invalid configuration");
            return ErrorCode::InitFailed;
        }
    };
    vessel_runtime::logging::init_logging(&config.logging.level);
    match Vessel::create_with_config(config) {
        Ok(vessel) => {
            unsafe { *out_vm = into_handle(vessel) };
            ErrorCode::Ok
        }
        Err(e) => e.code(),
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Create the process-wide VM instance, configured from `VESSEL_*` variables
///
/// Fails with `AlreadyInitialized` if an instance was ever created in this
/// process.
///
/// # Safety
/// `out_vm` must be a valid pointer. The handle must be released with
/// `vessel_free()`.
///
/// # Example (C)
/// ```c
/// VesselVm* vm = NULL;
/// if (vessel_create(&vm) != VESSEL_OK) return 1;
/// vessel_init(vm, argc, argv);
/// vessel_load_file(vm, "game.vbc");
/// vessel_call_entry(vm);
/// while (running) vessel_update(vm, 0.016);
/// vessel_destroy(vm);
/// vessel_free(vm);
/// ```
#[no_mangle]
pub unsafe extern "C" fn vessel_create(out_vm: *mut *mut VesselVm) -> ErrorCode {
    if out_vm.is_null() {
        return ErrorCode::InvalidArgument;
    }
    *out_vm = ptr::null_mut();
    ffi_guard(|| create_handle(VesselConfig::from_env().map_err(|e| e.to_string()), out_vm))
}

/// Create the process-wide VM instance from a TOML configuration file
///
/// # Safety
/// `config_path` must be a valid NUL-terminated string and `out_vm` a valid
/// pointer.
#[no_mangle]
pub unsafe extern "C" fn vessel_create_with_config(
    config_path: *const c_char,
    out_vm: *mut *mut VesselVm,
) -> ErrorCode {
    if out_vm.is_null() || config_path.is_null() {
        return ErrorCode::InvalidArgument;
    }
    *out_vm = ptr::null_mut();
    let path = match CStr::from_ptr(config_path).to_str() {
        Ok(path) => path,
        Err(_) => return ErrorCode::InvalidArgument,
    };
    ffi_guard(|| create_handle(VesselConfig::from_file(path).map_err(|e| e.to_string()), out_vm))
}

/// Build the runtime and register the calling thread
///
/// # Safety
/// `argv` must hold `argc` pointers, each NULL or a NUL-terminated string.
/// It may be NULL when `argc` is 0.
#[no_mangle]
pub unsafe extern "C" fn vessel_init(
    vm: *mut VesselVm,
    argc: c_int,
    argv: *const *const c_char,
) -> ErrorCode {
    with_handle(vm, |h| {
        if argc < 0 || (argc > 0 && argv.is_null()) {
            return invalid(&h.vessel, "argc/argv mismatch".to_string());
        }
        let args: Vec<String> = (0..argc as usize)
            .map(|i| *argv.add(i))
            .filter(|arg| !arg.is_null())
            .map(|arg| CStr::from_ptr(arg).to_string_lossy().into_owned())
            .collect();
        status(h.vessel.init(&args))
    })
}

/// Load a bytecode file
///
/// # Safety
/// `path` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn vessel_load_file(vm: *mut VesselVm, path: *const c_char) -> ErrorCode {
    with_handle(vm, |h| match c_str(&h.vessel, path, "path") {
        Ok(path) => status(h.vessel.load_file(path)),
        Err(code) => code,
    })
}

/// Load bytecode from memory; the buffer is not retained
///
/// # Safety
/// `data` must be valid for `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn vessel_load_memory(
    vm: *mut VesselVm,
    data: *const u8,
    size: size_t,
) -> ErrorCode {
    with_handle(vm, |h| match byte_slice(&h.vessel, data, size) {
        Ok(bytes) => status(h.vessel.load_memory(bytes)),
        Err(code) => code,
    })
}

/// Run the module's entry point
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_call_entry(vm: *mut VesselVm) -> ErrorCode {
    with_handle(vm, |h| status(h.vessel.call_entry()))
}

/// Tear the instance down
///
/// Later calls on the handle fail with `NotInitialized`; release it with
/// `vessel_free()`.
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_destroy(vm: *mut VesselVm) -> ErrorCode {
    with_handle(vm, |h| status(h.vessel.destroy()))
}

/// Release a handle, destroying the instance first if needed
///
/// If the VM thread could not be stopped the handle is leaked, since queued
/// work may still receive it.
///
/// # Safety
/// `vm` must be NULL or a handle from `vessel_create()`, and must not be used
/// after this call.
#[no_mangle]
pub unsafe extern "C" fn vessel_free(vm: *mut VesselVm) {
    let Some(h) = handle(vm) else { return };
    ffi_guard(|| {
        if h.vessel.state() != LifecycleState::Destroyed {
            let _ = h.vessel.destroy();
        }
        ErrorCode::Ok
    });
    if h.vessel.engine_status() != EngineStatus::Stopped {
        tracing::warn!("VM thread still running; leaking the handle");
        return;
    }
    drop(Box::from_raw(vm as *mut VmHandle));
}

/// Message of the most recent failure, empty if none
///
/// # Safety
/// The returned string is owned by the handle and valid until the next
/// `vessel_get_error()` call on it or `vessel_free()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_get_error(vm: *mut VesselVm) -> *const c_char {
    let Some(h) = handle(vm) else {
        return ptr::null();
    };
    let message = CString::new(h.vessel.error_message()).unwrap_or_default();
    let mut slot = h.message.lock();
    *slot = message;
    slot.as_ptr()
}

/// Code of the most recent failure, `Ok` if none
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_get_error_code(vm: *mut VesselVm) -> ErrorCode {
    match handle(vm) {
        Some(h) => h.vessel.error_code(),
        None => ErrorCode::InvalidArgument,
    }
}

/// Forget the recorded failure
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_clear_error(vm: *mut VesselVm) {
    if let Some(h) = handle(vm) {
        h.vessel.clear_error();
    }
}

// ============================================================================
// Integration Mode and Event Loop
// ============================================================================

/// Select the integration mode: 0 = non-threaded, 1 = threaded
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_set_mode(vm: *mut VesselVm, mode: c_int) -> ErrorCode {
    with_handle(vm, |h| {
        let mode = match mode {
            0 => IntegrationMode::NonThreaded,
            1 => IntegrationMode::Threaded,
            other => return invalid(&h.vessel, format!("unknown integration mode {other}")),
        };
        status(h.vessel.set_mode(mode))
    })
}

/// Current integration mode
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_get_mode(vm: *mut VesselVm) -> IntegrationMode {
    handle(vm).map_or(IntegrationMode::NonThreaded, |h| h.vessel.mode())
}

/// Per-frame update: process every event source with a `delta_time` hint
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_update(vm: *mut VesselVm, delta_time: f64) -> ErrorCode {
    with_handle(vm, |h| status(h.vessel.update(delta_time)))
}

/// Whether `vessel_update()` has anything to do
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_has_pending_work(vm: *mut VesselVm) -> bool {
    handle(vm).is_some_and(|h| h.vessel.has_pending_work())
}

/// Drain pending events of `kind` (0 = async I/O, 1 = cooperative, 2 = all)
///
/// # Safety
/// `out_count` may be NULL; otherwise it receives the number of callbacks run.
#[no_mangle]
pub unsafe extern "C" fn vessel_process_events(
    vm: *mut VesselVm,
    kind: c_int,
    out_count: *mut size_t,
) -> ErrorCode {
    with_handle(vm, |h| {
        let kind = match event_kind(&h.vessel, kind) {
            Ok(kind) => kind,
            Err(code) => return code,
        };
        match h.vessel.process(kind) {
            Ok(count) => {
                write_out(out_count, count);
                ErrorCode::Ok
            }
            Err(e) => e.code(),
        }
    })
}

/// Whether events of `kind` are pending
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_has_pending_events(vm: *mut VesselVm, kind: c_int) -> bool {
    let Some(h) = handle(vm) else { return false };
    match event_kind(&h.vessel, kind) {
        Ok(kind) => h.vessel.has_pending(kind),
        Err(_) => false,
    }
}

// ============================================================================
// Threaded Engine
// ============================================================================

/// Start the VM thread (threaded mode only)
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_thread_start(vm: *mut VesselVm) -> ErrorCode {
    with_handle(vm, |h| status(h.vessel.start()))
}

/// Stop the VM thread after it finishes queued work
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_thread_stop(vm: *mut VesselVm) -> ErrorCode {
    with_handle(vm, |h| status(h.vessel.stop()))
}

/// Whether the VM thread is serving calls
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_thread_is_running(vm: *mut VesselVm) -> bool {
    handle(vm).is_some_and(|h| h.vessel.is_running())
}

/// Run `f(vm, ctx)` on the VM thread and wait for it
///
/// # Safety
/// `ctx` must stay valid until `f` has run. `f` may call back into this API
/// with the handle it receives, except `vessel_thread_call_sync`.
#[no_mangle]
pub unsafe extern "C" fn vessel_thread_call_sync(
    vm: *mut VesselVm,
    f: Option<VesselThreadFn>,
    ctx: *mut c_void,
) -> ErrorCode {
    with_handle(vm, |h| {
        let Some(f) = f else {
            return invalid(&h.vessel, "callback is NULL".to_string());
        };
        let vm_ptr = SendPtr(vm as *mut c_void);
        let ctx = SendPtr(ctx);
        status(h.vessel.call_sync(move || f(vm_ptr.get() as *mut VesselVm, ctx.get())))
    })
}

/// Queue `f(vm, ctx)` on the VM thread and return immediately
///
/// `on_complete(vm, ctx, status)` runs on the VM thread afterwards.
///
/// # Safety
/// `ctx` must stay valid until `on_complete` (or `f`, without one) has run.
#[no_mangle]
pub unsafe extern "C" fn vessel_thread_call_async(
    vm: *mut VesselVm,
    f: Option<VesselThreadFn>,
    on_complete: Option<VesselCompletionFn>,
    ctx: *mut c_void,
) -> ErrorCode {
    with_handle(vm, |h| {
        let Some(f) = f else {
            return invalid(&h.vessel, "callback is NULL".to_string());
        };
        let vm_ptr = SendPtr(vm as *mut c_void);
        let ctx = SendPtr(ctx);
        status(h.vessel.call_async_with(
            move || f(vm_ptr.get() as *mut VesselVm, ctx.get()),
            move |outcome: CallOutcome<()>| {
                if let Some(done) = on_complete {
                    done(vm_ptr.get() as *mut VesselVm, ctx.get(), status(outcome));
                }
            },
        ))
    })
}

// ============================================================================
// Hot Reload
// ============================================================================

/// Enable or disable hot reload (before the entry point runs)
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_enable_hot_reload(vm: *mut VesselVm, enable: bool) -> ErrorCode {
    with_handle(vm, |h| status(h.vessel.enable_hot_reload(enable)))
}

/// Whether hot reload is enabled
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_is_hot_reload_enabled(vm: *mut VesselVm) -> bool {
    handle(vm).is_some_and(|h| h.vessel.is_hot_reload_enabled())
}

/// Reload from `path`, or from the originally loaded file when `path` is NULL
///
/// # Safety
/// `path` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn vessel_reload_module(vm: *mut VesselVm, path: *const c_char) -> ErrorCode {
    with_handle(vm, |h| {
        if path.is_null() {
            return status(h.vessel.reload_current());
        }
        match c_str(&h.vessel, path, "path") {
            Ok(path) => status(h.vessel.reload_from_file(path)),
            Err(code) => code,
        }
    })
}

/// Reload from bytecode in memory
///
/// # Safety
/// `data` must be valid for `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn vessel_reload_module_memory(
    vm: *mut VesselVm,
    data: *const u8,
    size: size_t,
) -> ErrorCode {
    with_handle(vm, |h| match byte_slice(&h.vessel, data, size) {
        Ok(bytes) => status(h.vessel.reload_from_memory(bytes)),
        Err(code) => code,
    })
}

/// Set (or clear, with NULL) the reload outcome callback
///
/// # Safety
/// `ctx` must stay valid until the callback is replaced or the handle freed.
#[no_mangle]
pub unsafe extern "C" fn vessel_set_reload_callback(
    vm: *mut VesselVm,
    callback: Option<VesselReloadFn>,
    ctx: *mut c_void,
) -> ErrorCode {
    with_handle(vm, |h| {
        let ctx = SendPtr(ctx);
        match callback {
            Some(cb) => h.vessel.set_reload_callback(Some(move |ok: bool| cb(ok, ctx.get()))),
            None => h.vessel.set_reload_callback(None::<fn(bool)>),
        }
        ErrorCode::Ok
    })
}

/// Reload if the loaded file changed on disk
///
/// Returns 1 if a reload happened, 0 if not, -1 on failure.
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_check_reload(vm: *mut VesselVm) -> c_int {
    let Some(h) = handle(vm) else { return -1 };
    let mut reloaded = false;
    let code = ffi_guard(|| match h.vessel.check_reload() {
        Ok(r) => {
            reloaded = r;
            ErrorCode::Ok
        }
        Err(e) => e.code(),
    });
    match (code, reloaded) {
        (ErrorCode::Ok, true) => 1,
        (ErrorCode::Ok, false) => 0,
        _ => -1,
    }
}

// ============================================================================
// GC Guards (process-wide instance)
// ============================================================================

fn on_current(f: impl FnOnce(&Vessel) -> ErrorCode) -> ErrorCode {
    ffi_guard(|| match Vessel::current() {
        Some(vessel) => f(&vessel),
        None => ErrorCode::NotInitialized,
    })
}

/// Register the calling thread with the collector
#[no_mangle]
pub extern "C" fn vessel_worker_register() -> ErrorCode {
    on_current(|v| status(v.worker_register()))
}

/// Undo one `vessel_worker_register()` of the calling thread
#[no_mangle]
pub extern "C" fn vessel_worker_unregister() -> ErrorCode {
    on_current(|v| status(v.worker_unregister()))
}

/// Enter a blocking bracket on the calling thread
#[no_mangle]
pub extern "C" fn vessel_blocking_begin() -> ErrorCode {
    on_current(|v| status(v.blocking_begin()))
}

/// Leave a blocking bracket on the calling thread
#[no_mangle]
pub extern "C" fn vessel_blocking_end() -> ErrorCode {
    on_current(|v| status(v.blocking_end()))
}

// ============================================================================
// Version Information
// ============================================================================

/// Version of this library
///
/// # Safety
/// The returned string is static and must not be freed.
#[no_mangle]
pub extern "C" fn vessel_get_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

/// Version of the embedded runtime
///
/// # Safety
/// The returned string is static and must not be freed.
#[no_mangle]
pub extern "C" fn vessel_get_runtime_version() -> *const c_char {
    static VERSION: Lazy<CString> =
        Lazy::new(|| CString::new(Vessel::runtime_version()).unwrap_or_default());
    VERSION.as_ptr()
}

/// Whether loaded code is dynamically linked (hot reload capable)
///
/// # Safety
/// `vm` must be a handle from `vessel_create()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_is_jit_mode(vm: *mut VesselVm) -> bool {
    handle(vm).is_some_and(|h| h.vessel.is_jit_mode())
}

// ============================================================================
// Values
// ============================================================================

/// Create a null value
///
/// # Safety
/// The returned value must be freed with `vessel_value_free()`.
#[no_mangle]
pub extern "C" fn vessel_value_null() -> *mut VesselValue {
    into_value(HostValue::Null)
}

/// Create a boolean value
#[no_mangle]
pub extern "C" fn vessel_value_bool(value: bool) -> *mut VesselValue {
    into_value(HostValue::Bool(value))
}

/// Create an integer value
#[no_mangle]
pub extern "C" fn vessel_value_int(value: i32) -> *mut VesselValue {
    into_value(HostValue::Int(value))
}

/// Create a float value
#[no_mangle]
pub extern "C" fn vessel_value_float(value: f64) -> *mut VesselValue {
    into_value(HostValue::Float(value))
}

/// Create a string value (copied); NULL if `value` is NULL or not UTF-8
///
/// # Safety
/// `value` must be NULL or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn vessel_value_string(value: *const c_char) -> *mut VesselValue {
    if value.is_null() {
        return ptr::null_mut();
    }
    match CStr::from_ptr(value).to_str() {
        Ok(s) => into_value(HostValue::Str(s.to_string())),
        Err(_) => ptr::null_mut(),
    }
}

/// Free a value
///
/// # Safety
/// `value` must be NULL or a value from this API, not used afterwards.
#[no_mangle]
pub unsafe extern "C" fn vessel_value_free(value: *mut VesselValue) {
    if value.is_null() {
        return;
    }
    drop(Box::from_raw(value as *mut ValueHandle));
}

/// Kind of a value; NULL pointers report `Null`
///
/// # Safety
/// `value` must be NULL or a value from this API.
#[no_mangle]
pub unsafe extern "C" fn vessel_value_kind(value: *const VesselValue) -> VesselValueKind {
    value_ref(value).map_or(VesselValueKind::Null, |v| v.value.kind().into())
}

unsafe fn scalar<T>(
    value: *const VesselValue,
    out: *mut T,
    expected: ValueKind,
    extract: impl FnOnce(&HostValue) -> Option<T>,
) -> ErrorCode {
    let Some(v) = value_ref(value) else {
        return ErrorCode::InvalidArgument;
    };
    if out.is_null() {
        return ErrorCode::InvalidArgument;
    }
    match v.value.kind() {
        ValueKind::Null => ErrorCode::NullValue,
        kind if kind != expected => ErrorCode::TypeMismatch,
        _ => match extract(&v.value) {
            Some(x) => {
                *out = x;
                ErrorCode::Ok
            }
            None => ErrorCode::TypeMismatch,
        },
    }
}

/// Read an integer value
///
/// # Safety
/// `value` must be a value from this API and `out` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn vessel_value_as_int(value: *const VesselValue, out: *mut i32) -> ErrorCode {
    scalar(value, out, ValueKind::Int, HostValue::as_int)
}

/// Read a float value
///
/// # Safety
/// `value` must be a value from this API and `out` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn vessel_value_as_float(value: *const VesselValue, out: *mut f64) -> ErrorCode {
    scalar(value, out, ValueKind::Float, HostValue::as_float)
}

/// Read a boolean value
///
/// # Safety
/// `value` must be a value from this API and `out` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn vessel_value_as_bool(value: *const VesselValue, out: *mut bool) -> ErrorCode {
    scalar(value, out, ValueKind::Bool, HostValue::as_bool)
}

/// String payload; NULL unless the value is a string
///
/// # Safety
/// The returned string is owned by `value` and valid until it is freed.
#[no_mangle]
pub unsafe extern "C" fn vessel_value_as_string(value: *const VesselValue) -> *const c_char {
    value_ref(value)
        .and_then(|v| v.text.as_ref())
        .map_or(ptr::null(), |text| text.as_ptr())
}

// ============================================================================
// Static Fields, Calls and Reflection
// ============================================================================

/// Read a static field into a new value
///
/// # Safety
/// `class` and `field` must be valid NUL-terminated strings and `out_value` a
/// valid pointer. The value must be freed with `vessel_value_free()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_get_static(
    vm: *mut VesselVm,
    class: *const c_char,
    field: *const c_char,
    out_value: *mut *mut VesselValue,
) -> ErrorCode {
    with_handle(vm, |h| {
        if out_value.is_null() {
            return invalid(&h.vessel, "out_value is NULL".to_string());
        }
        let (class, field) = match (c_str(&h.vessel, class, "class"), c_str(&h.vessel, field, "field")) {
            (Ok(c), Ok(f)) => (c, f),
            (Err(code), _) | (_, Err(code)) => return code,
        };
        match h.vessel.get_static(class, field) {
            Ok(value) => {
                *out_value = into_value(value);
                ErrorCode::Ok
            }
            Err(e) => e.code(),
        }
    })
}

/// Write a static field
///
/// # Safety
/// `class` and `field` must be valid NUL-terminated strings; `value` must be
/// a value from this API (it is copied, not consumed).
#[no_mangle]
pub unsafe extern "C" fn vessel_set_static(
    vm: *mut VesselVm,
    class: *const c_char,
    field: *const c_char,
    value: *const VesselValue,
) -> ErrorCode {
    with_handle(vm, |h| {
        let (class, field) = match (c_str(&h.vessel, class, "class"), c_str(&h.vessel, field, "field")) {
            (Ok(c), Ok(f)) => (c, f),
            (Err(code), _) | (_, Err(code)) => return code,
        };
        let Some(value) = value_ref(value) else {
            return invalid(&h.vessel, "value is NULL".to_string());
        };
        status(h.vessel.set_static(class, field, value.value.clone()))
    })
}

/// Read an integer static field
///
/// # Safety
/// `class` and `field` must be valid NUL-terminated strings and `out` a
/// valid pointer.
#[no_mangle]
pub unsafe extern "C" fn vessel_get_static_int(
    vm: *mut VesselVm,
    class: *const c_char,
    field: *const c_char,
    out: *mut i32,
) -> ErrorCode {
    with_handle(vm, |h| {
        if out.is_null() {
            return invalid(&h.vessel, "out is NULL".to_string());
        }
        let (class, field) = match (c_str(&h.vessel, class, "class"), c_str(&h.vessel, field, "field")) {
            (Ok(c), Ok(f)) => (c, f),
            (Err(code), _) | (_, Err(code)) => return code,
        };
        match h.vessel.get_static_int(class, field) {
            Ok(value) => {
                *out = value;
                ErrorCode::Ok
            }
            Err(e) => e.code(),
        }
    })
}

/// Write an integer static field
///
/// # Safety
/// `class` and `field` must be valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn vessel_set_static_int(
    vm: *mut VesselVm,
    class: *const c_char,
    field: *const c_char,
    value: i32,
) -> ErrorCode {
    with_handle(vm, |h| {
        let (class, field) = match (c_str(&h.vessel, class, "class"), c_str(&h.vessel, field, "field")) {
            (Ok(c), Ok(f)) => (c, f),
            (Err(code), _) | (_, Err(code)) => return code,
        };
        status(h.vessel.set_static_int(class, field, value))
    })
}

/// Call a static method
///
/// # Safety
/// `args` must hold `argc` values from this API (copied, not consumed).
/// `out_result` may be NULL; otherwise it receives a value to be freed with
/// `vessel_value_free()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_call_static(
    vm: *mut VesselVm,
    class: *const c_char,
    method: *const c_char,
    args: *const *const VesselValue,
    argc: size_t,
    out_result: *mut *mut VesselValue,
) -> ErrorCode {
    with_handle(vm, |h| {
        let (class, method) = match (c_str(&h.vessel, class, "class"), c_str(&h.vessel, method, "method")) {
            (Ok(c), Ok(m)) => (c, m),
            (Err(code), _) | (_, Err(code)) => return code,
        };
        if argc > 0 && args.is_null() {
            return invalid(&h.vessel, "args is NULL".to_string());
        }
        let mut values = Vec::with_capacity(argc);
        for i in 0..argc {
            match value_ref(*args.add(i)) {
                Some(v) => values.push(v.value.clone()),
                None => return invalid(&h.vessel, format!("argument {i} is NULL")),
            }
        }
        match h.vessel.call_static(class, method, &values) {
            Ok(result) => {
                write_out(out_result, into_value(result));
                ErrorCode::Ok
            }
            Err(e) => e.code(),
        }
    })
}

/// Look up a type by name
///
/// # Safety
/// `name` must be a valid NUL-terminated string and `out_type` a valid
/// pointer. The type must be freed with `vessel_type_free()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_find_type(
    vm: *mut VesselVm,
    name: *const c_char,
    out_type: *mut *mut VesselType,
) -> ErrorCode {
    with_handle(vm, |h| {
        if out_type.is_null() {
            return invalid(&h.vessel, "out_type is NULL".to_string());
        }
        let name = match c_str(&h.vessel, name, "name") {
            Ok(name) => name,
            Err(code) => return code,
        };
        match h.vessel.find_type(name) {
            Ok(info) => {
                *out_type = Box::into_raw(Box::new(TypeHandle::new(info))) as *mut VesselType;
                ErrorCode::Ok
            }
            Err(e) => e.code(),
        }
    })
}

unsafe fn type_ref<'a>(ty: *const VesselType) -> Option<&'a TypeHandle> {
    (ty as *const TypeHandle).as_ref()
}

/// Name of a type
///
/// # Safety
/// The returned string is owned by `ty` and valid until it is freed.
#[no_mangle]
pub unsafe extern "C" fn vessel_type_name(ty: *const VesselType) -> *const c_char {
    type_ref(ty).map_or(ptr::null(), |t| t.name.as_ptr())
}

/// Number of static fields of a type
///
/// # Safety
/// `ty` must be NULL or a type from `vessel_find_type()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_type_field_count(ty: *const VesselType) -> size_t {
    type_ref(ty).map_or(0, |t| t.fields.len())
}

/// Name of the static field at `index`, NULL if out of range
///
/// # Safety
/// The returned string is owned by `ty` and valid until it is freed.
#[no_mangle]
pub unsafe extern "C" fn vessel_type_field_name(ty: *const VesselType, index: size_t) -> *const c_char {
    type_ref(ty)
        .and_then(|t| t.fields.get(index))
        .map_or(ptr::null(), |name| name.as_ptr())
}

/// Number of static methods of a type
///
/// # Safety
/// `ty` must be NULL or a type from `vessel_find_type()`.
#[no_mangle]
pub unsafe extern "C" fn vessel_type_method_count(ty: *const VesselType) -> size_t {
    type_ref(ty).map_or(0, |t| t.methods.len())
}

/// Name of the static method at `index` (sorted), NULL if out of range
///
/// # Safety
/// The returned string is owned by `ty` and valid until it is freed.
#[no_mangle]
pub unsafe extern "C" fn vessel_type_method_name(ty: *const VesselType, index: size_t) -> *const c_char {
    type_ref(ty)
        .and_then(|t| t.methods.get(index))
        .map_or(ptr::null(), |name| name.as_ptr())
}

/// Free a type
///
/// # Safety
/// `ty` must be NULL or a type from `vessel_find_type()`, not used afterwards.
#[no_mangle]
pub unsafe extern "C" fn vessel_type_free(ty: *mut VesselType) {
    if ty.is_null() {
        return;
    }
    drop(Box::from_raw(ty as *mut TypeHandle));
}

/// Register a host function callable from bytecode as `name`
///
/// Register natives before loading the module that imports them.
///
/// # Safety
/// `name` must be a valid NUL-terminated string; `ctx` must stay valid for
/// the lifetime of the instance. The callback must not call into this API.
#[no_mangle]
pub unsafe extern "C" fn vessel_register_callback(
    vm: *mut VesselVm,
    name: *const c_char,
    callback: Option<VesselNativeFn>,
    ctx: *mut c_void,
) -> ErrorCode {
    with_handle(vm, |h| {
        let name = match c_str(&h.vessel, name, "name") {
            Ok(name) => name,
            Err(code) => return code,
        };
        let Some(callback) = callback else {
            return invalid(&h.vessel, "callback is NULL".to_string());
        };
        let ctx = SendPtr(ctx);
        status(h.vessel.register_native(name, move |args: &[HostValue]| {
            let handles: Vec<ValueHandle> = args.iter().cloned().map(ValueHandle::new).collect();
            let ptrs: Vec<*const VesselValue> = handles
                .iter()
                .map(|v| v as *const ValueHandle as *const VesselValue)
                .collect();
            let ret = callback(ptrs.as_ptr(), ptrs.len(), ctx.get());
            if ret.is_null() {
                return Ok(HostValue::Null);
            }
            // SAFETY: the callback hands over a value created by this API
            let owned = unsafe { Box::from_raw(ret as *mut ValueHandle) };
            Ok(owned.value)
        }))
    })
}

// ============================================================================
// Tests
// ============================================================================
