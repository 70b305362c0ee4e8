//! Runtime error types.
//!
//! Every fallible operation returns [`VesselError`]; each variant maps to a
//! stable [`ErrorCode`] that is also what the C boundary reports.

use std::path::PathBuf;
use vessel_engine::{ThreadError, ValueKind, VmError};

/// Stable error codes
///
/// The numbering is part of the C ABI: values are never reused or reordered.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error
    Ok = 0,

    // Lifecycle
    /// An instance already exists, or the operation was already performed
    AlreadyInitialized = 1,
    /// The instance is not in a state that allows the operation
    NotInitialized = 2,
    /// Runtime construction failed
    InitFailed = 3,
    /// Teardown reported a problem (it still completed)
    DestroyFailed = 4,

    // Loading
    /// Bytecode file does not exist or cannot be read
    FileNotFound = 10,
    /// Bytecode failed to decode or verify
    InvalidBytecode = 11,
    /// Bytecode could not be linked or initialised
    ModuleLoadFailed = 12,

    // Calls
    /// The module has no usable entry point
    EntryPointNotFound = 20,
    /// Unknown class
    TypeNotFound = 21,
    /// Unknown method or function
    MethodNotFound = 22,
    /// Unknown field
    FieldNotFound = 23,
    /// A call could not be carried out
    CallFailed = 24,

    // Embedded faults
    /// Uncaught exception raised by code running inside the VM
    ExceptionThrown = 30,

    // Types
    /// Value kind does not match
    TypeMismatch = 40,
    /// Value is null where a scalar was required
    NullValue = 41,

    // Hot reload
    /// The execution mode cannot swap code
    ReloadNotSupported = 50,
    /// Hot reload is disabled
    ReloadNotEnabled = 51,
    /// The replacement module was rejected
    ReloadFailed = 52,
    /// Operation is only valid on one side of the entry point call
    RequiresPriorEntry = 53,

    // Threading
    /// The VM thread is not running
    ThreadNotStarted = 60,
    /// The VM thread is already running
    ThreadAlreadyRunning = 61,
    /// The VM thread could not be spawned
    ThreadStartFailed = 62,
    /// The VM thread did not stop in time
    ThreadStopFailed = 63,
    /// Called from a thread that may not touch the VM
    WrongThread = 64,
    /// A bounded wait expired
    Timeout = 65,
    /// Unmatched guard release
    UnbalancedGuard = 66,

    // Event loop
    /// An event source failed
    EventLoopFailed = 70,

    // Residual
    /// Allocation failure
    OutOfMemory = 90,
    /// Invalid argument or mode
    InvalidArgument = 91,
    /// Not implemented
    NotImplemented = 92,
    /// Anything else
    Unknown = 99,
}

impl ErrorCode {
    /// Short stable name, e.g. `"WrongThread"`
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Ok",
            ErrorCode::AlreadyInitialized => "AlreadyInitialized",
            ErrorCode::NotInitialized => "NotInitialized",
            ErrorCode::InitFailed => "InitFailed",
            ErrorCode::DestroyFailed => "DestroyFailed",
            ErrorCode::FileNotFound => "FileNotFound",
            ErrorCode::InvalidBytecode => "InvalidBytecode",
            ErrorCode::ModuleLoadFailed => "ModuleLoadFailed",
            ErrorCode::EntryPointNotFound => "EntryPointNotFound",
            ErrorCode::TypeNotFound => "TypeNotFound",
            ErrorCode::MethodNotFound => "MethodNotFound",
            ErrorCode::FieldNotFound => "FieldNotFound",
            ErrorCode::CallFailed => "CallFailed",
            ErrorCode::ExceptionThrown => "ExceptionThrown",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::NullValue => "NullValue",
            ErrorCode::ReloadNotSupported => "ReloadNotSupported",
            ErrorCode::ReloadNotEnabled => "ReloadNotEnabled",
            ErrorCode::ReloadFailed => "ReloadFailed",
            ErrorCode::RequiresPriorEntry => "RequiresPriorEntry",
            ErrorCode::ThreadNotStarted => "ThreadNotStarted",
            ErrorCode::ThreadAlreadyRunning => "ThreadAlreadyRunning",
            ErrorCode::ThreadStartFailed => "ThreadStartFailed",
            ErrorCode::ThreadStopFailed => "ThreadStopFailed",
            ErrorCode::WrongThread => "WrongThread",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::UnbalancedGuard => "UnbalancedGuard",
            ErrorCode::EventLoopFailed => "EventLoopFailed",
            ErrorCode::OutOfMemory => "OutOfMemory",
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors returned by [`Vessel`](crate::Vessel) operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VesselError {
    /// An instance already exists, or the operation was already performed
    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    /// The instance is not in a state that allows the operation
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Runtime construction failed
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// Teardown reported a problem
    #[error("Destroy failed: {0}")]
    DestroyFailed(String),

    /// Bytecode file missing or unreadable
    #[error("Bytecode file not found: {path}: {reason}")]
    FileNotFound {
        /// Requested path
        path: PathBuf,
        /// I/O error text
        reason: String,
    },

    /// Bytecode failed to decode or verify
    #[error("Invalid bytecode: {0}")]
    InvalidBytecode(String),

    /// Bytecode could not be linked
    #[error("Module load failed: {0}")]
    ModuleLoadFailed(String),

    /// The module has no usable entry point
    #[error("Entry point not found: {0}")]
    EntryPointNotFound(String),

    /// Unknown class
    #[error("Type '{0}' not found")]
    TypeNotFound(String),

    /// Unknown method or function
    #[error("Method '{0}' not found")]
    MethodNotFound(String),

    /// Unknown static field
    #[error("Field '{0}' not found")]
    FieldNotFound(String),

    /// A call could not be carried out
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// Uncaught exception inside the VM
    #[error("Uncaught exception: {message}")]
    ExceptionThrown {
        /// Exception message
        message: String,
        /// Function names, innermost first
        trace: Vec<String>,
    },

    /// Value kind does not match
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Required kind
        expected: ValueKind,
        /// Actual kind
        found: ValueKind,
    },

    /// Null where a scalar was required
    #[error("Null value: {0}")]
    NullValue(String),

    /// Execution mode cannot swap code
    #[error("Hot reload is not supported in static execution mode")]
    ReloadNotSupported,

    /// Hot reload disabled
    #[error("Hot reload is not enabled")]
    ReloadNotEnabled,

    /// Replacement module rejected
    #[error("Reload failed: {0}")]
    ReloadFailed(String),

    /// Operation is only valid on one side of the entry point call
    #[error("{0}")]
    RequiresPriorEntry(String),

    /// VM thread not running
    #[error("VM thread is not running")]
    ThreadNotStarted,

    /// VM thread already running
    #[error("VM thread is already running")]
    ThreadAlreadyRunning,

    /// VM thread could not be spawned
    #[error("Failed to start VM thread: {0}")]
    ThreadStartFailed(String),

    /// VM thread did not stop in time
    #[error("Failed to stop VM thread: {0}")]
    ThreadStopFailed(String),

    /// Called from a thread that may not touch the VM
    #[error("Wrong thread: {0}")]
    WrongThread(String),

    /// Bounded wait expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Unmatched guard release
    #[error("Unbalanced guard: {0}")]
    UnbalancedGuard(String),

    /// An event source failed
    #[error("Event loop failed: {0}")]
    EventLoopFailed(String),

    /// Allocation failure
    #[error("Out of memory")]
    OutOfMemory,

    /// Invalid argument or mode
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not implemented
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// Anything else
    #[error("{0}")]
    Unknown(String),
}

impl VesselError {
    /// Stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            VesselError::AlreadyInitialized(_) => ErrorCode::AlreadyInitialized,
            VesselError::NotInitialized(_) => ErrorCode::NotInitialized,
            VesselError::InitFailed(_) => ErrorCode::InitFailed,
            VesselError::DestroyFailed(_) => ErrorCode::DestroyFailed,
            VesselError::FileNotFound { .. } => ErrorCode::FileNotFound,
            VesselError::InvalidBytecode(_) => ErrorCode::InvalidBytecode,
            VesselError::ModuleLoadFailed(_) => ErrorCode::ModuleLoadFailed,
            VesselError::EntryPointNotFound(_) => ErrorCode::EntryPointNotFound,
            VesselError::TypeNotFound(_) => ErrorCode::TypeNotFound,
            VesselError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            VesselError::FieldNotFound(_) => ErrorCode::FieldNotFound,
            VesselError::CallFailed(_) => ErrorCode::CallFailed,
            VesselError::ExceptionThrown { .. } => ErrorCode::ExceptionThrown,
            VesselError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
            VesselError::NullValue(_) => ErrorCode::NullValue,
            VesselError::ReloadNotSupported => ErrorCode::ReloadNotSupported,
            VesselError::ReloadNotEnabled => ErrorCode::ReloadNotEnabled,
            VesselError::ReloadFailed(_) => ErrorCode::ReloadFailed,
            VesselError::RequiresPriorEntry(_) => ErrorCode::RequiresPriorEntry,
            VesselError::ThreadNotStarted => ErrorCode::ThreadNotStarted,
            VesselError::ThreadAlreadyRunning => ErrorCode::ThreadAlreadyRunning,
            VesselError::ThreadStartFailed(_) => ErrorCode::ThreadStartFailed,
            VesselError::ThreadStopFailed(_) => ErrorCode::ThreadStopFailed,
            VesselError::WrongThread(_) => ErrorCode::WrongThread,
            VesselError::Timeout(_) => ErrorCode::Timeout,
            VesselError::UnbalancedGuard(_) => ErrorCode::UnbalancedGuard,
            VesselError::EventLoopFailed(_) => ErrorCode::EventLoopFailed,
            VesselError::OutOfMemory => ErrorCode::OutOfMemory,
            VesselError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            VesselError::NotImplemented(_) => ErrorCode::NotImplemented,
            VesselError::Unknown(_) => ErrorCode::Unknown,
        }
    }
}

impl From<VmError> for VesselError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::NotLoaded => VesselError::NotInitialized("no module loaded".to_string()),
            VmError::AlreadyLoaded => {
                VesselError::AlreadyInitialized("a module is already loaded".to_string())
            }
            VmError::Load(e) => VesselError::InvalidBytecode(e.to_string()),
            VmError::Link(e) => VesselError::ModuleLoadFailed(e.to_string()),
            VmError::ClassNotFound(name) => VesselError::TypeNotFound(name),
            VmError::FunctionNotFound(name) => VesselError::MethodNotFound(name),
            VmError::MethodNotFound { class, method } => {
                VesselError::MethodNotFound(format!("{class}.{method}"))
            }
            VmError::FieldNotFound { class, field } => {
                VesselError::FieldNotFound(format!("{class}.{field}"))
            }
            e @ VmError::ArityMismatch { .. } => VesselError::InvalidArgument(e.to_string()),
            VmError::TypeMismatch { expected, found } => {
                VesselError::TypeMismatch { expected, found }
            }
            VmError::Exception { message, trace } => {
                VesselError::ExceptionThrown { message, trace }
            }
            VmError::PatchRejected(reason) => VesselError::ReloadFailed(reason),
            VmError::PatchUnsupported => VesselError::ReloadNotSupported,
            VmError::GcStalled(e) => VesselError::Timeout(e.to_string()),
        }
    }
}

impl From<ThreadError> for VesselError {
    fn from(err: ThreadError) -> Self {
        match err {
            ThreadError::NotRegistered => VesselError::WrongThread(
                "thread is not registered with the collector".to_string(),
            ),
            ThreadError::Unbalanced => VesselError::UnbalancedGuard(err.to_string()),
            ThreadError::PauseTimeout { .. } => VesselError::Timeout(err.to_string()),
        }
    }
}

/// Result alias for runtime operations
pub type VesselResult<T> = Result<T, VesselError>;
