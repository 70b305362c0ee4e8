//! Vessel Runtime
//!
//! Embeds the Vessel VM into a host application:
//! - **Lifecycle**: one instance per process, `create → init → load → call_entry → destroy`
//! - **Integration modes**: host-driven (`update()` per frame) or a dedicated VM thread
//!   fed through `call_sync` / `call_async`
//! - **Event loops**: timers, main-loop callbacks and background I/O, probed per call
//! - **Hot reload**: swap functions in place while static state survives
//! - **GC guards**: worker registration and blocking brackets for foreign threads
//!
//! Every fallible operation returns a [`VesselError`], which maps onto a stable
//! [`ErrorCode`] and is also kept as the instance's last error.
//!
//! # Example
//!
//! ```rust,ignore
//! use vessel_runtime::{Vessel, VesselConfig};
//!
//! let vm = Vessel::create_with_config(VesselConfig::from_file("vessel.toml")?)?;
//! vm.init(&std::env::args().collect::<Vec<_>>())?;
//! vm.load_file("game.vbc")?;
//! vm.call_entry()?;
//! while vm.has_pending_work() {
//!     vm.update(1.0 / 60.0)?;
//! }
//! vm.destroy()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod access;
pub mod config;
pub mod error;
pub mod events;
mod guards;
mod instance;
pub mod lifecycle;
pub mod logging;
mod mode;
mod registry;
mod reload;
mod threaded;

pub use config::{ConfigError, ExecutionSetting, VesselConfig};
pub use error::{ErrorCode, VesselError, VesselResult};
pub use events::{EventLoopKind, EventSource};
pub use guards::{BlockingGuard, WorkerGuard};
pub use instance::Vessel;
pub use lifecycle::LifecycleState;
pub use mode::IntegrationMode;
pub use registry::ProcessRegistry;
pub use reload::{ReloadCallback, ReloadReport};
pub use threaded::{CallOutcome, EngineStatus};

pub use vessel_engine::{ClassInfo, FieldInfo, GcStats, HostValue, ValueKind};
