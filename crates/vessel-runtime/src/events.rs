//! Event loop multiplexer
//!
//! The embedded program may or may not use timers, main-loop callbacks or
//! background I/O. Instead of assuming either, each event source is probed on
//! every multiplex call: a source that is not present contributes zero pending
//! events. Hosts can register their own sources next to the built-in ones.

use crate::error::{VesselError, VesselResult};
use crate::Vessel;
use vessel_engine::{Vm, VmError};

/// Which event sources an operation targets
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventLoopKind {
    /// Background I/O completions
    AsyncIo = 0,
    /// Timers and main-loop callbacks
    Cooperative = 1,
    /// Every source
    All = 2,
}

impl EventLoopKind {
    /// Whether a source of kind `source` is selected by `self`
    pub fn selects(self, source: EventLoopKind) -> bool {
        self == EventLoopKind::All || self == source
    }
}

/// A pollable source of VM callbacks
///
/// Implementations must not block: `has_pending` only looks, `drain` runs
/// what is ready now and returns.
pub trait EventSource: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Category this source belongs to (`AsyncIo` or `Cooperative`)
    fn kind(&self) -> EventLoopKind;

    /// Capability probe: whether the source exists for the loaded program
    fn is_present(&self, vm: &Vm) -> bool;

    /// Whether a drain now would run anything
    fn has_pending(&self, vm: &Vm, hint: Option<f64>) -> bool;

    /// Run everything ready now; returns the number of callbacks run
    ///
    /// `hint` is the host's frame delta in seconds, `None` to follow the
    /// wall clock.
    fn drain(&mut self, vm: &mut Vm, hint: Option<f64>) -> Result<usize, VmError>;
}

/// Timers and main-loop callbacks scheduled by the program
#[derive(Debug, Default)]
pub struct CooperativeSource;

impl EventSource for CooperativeSource {
    fn name(&self) -> &str {
        "cooperative"
    }

    fn kind(&self) -> EventLoopKind {
        EventLoopKind::Cooperative
    }

    fn is_present(&self, vm: &Vm) -> bool {
        vm.capabilities().cooperative
    }

    fn has_pending(&self, vm: &Vm, hint: Option<f64>) -> bool {
        vm.has_pending_cooperative(hint)
    }

    fn drain(&mut self, vm: &mut Vm, hint: Option<f64>) -> Result<usize, VmError> {
        vm.drain_cooperative(hint)
    }
}

/// Completions of background reads started by the program
#[derive(Debug, Default)]
pub struct AsyncIoSource;

impl EventSource for AsyncIoSource {
    fn name(&self) -> &str {
        "async-io"
    }

    fn kind(&self) -> EventLoopKind {
        EventLoopKind::AsyncIo
    }

    fn is_present(&self, vm: &Vm) -> bool {
        vm.capabilities().async_io
    }

    fn has_pending(&self, vm: &Vm, _hint: Option<f64>) -> bool {
        vm.has_pending_async_io()
    }

    fn drain(&mut self, vm: &mut Vm, _hint: Option<f64>) -> Result<usize, VmError> {
        vm.drain_async_io()
    }
}

/// Ordered set of event sources
pub(crate) struct Multiplexer {
    sources: Vec<Box<dyn EventSource>>,
}

impl Multiplexer {
    /// Built-in sources: I/O completions first, then cooperative callbacks
    pub fn new() -> Self {
        Self {
            sources: vec![Box::new(AsyncIoSource), Box::new(CooperativeSource)],
        }
    }

    pub fn register(&mut self, source: Box<dyn EventSource>) {
        self.sources.push(source);
    }

    pub fn has_pending(&self, kind: EventLoopKind, vm: &Vm, hint: Option<f64>) -> bool {
        self.sources
            .iter()
            .filter(|s| kind.selects(s.kind()) && s.is_present(vm))
            .any(|s| s.has_pending(vm, hint))
    }

    /// Drain every selected, present source once
    ///
    /// Stops at the first failing source; the others keep their events for
    /// the next call.
    pub fn process(&mut self, kind: EventLoopKind, vm: &mut Vm, hint: Option<f64>) -> VesselResult<usize> {
        let mut total = 0;
        for source in self.sources.iter_mut() {
            if !kind.selects(source.kind()) || !source.is_present(vm) {
                continue;
            }
            let ran = source.drain(vm, hint).map_err(|e| match e {
                e @ VmError::Exception { .. } => VesselError::from(e),
                other => VesselError::EventLoopFailed(format!("{}: {other}", source.name())),
            })?;
            if ran > 0 {
                tracing::debug!(source = source.name(), ran, "events processed");
            }
            total += ran;
        }
        Ok(total)
    }
}

impl Vessel {
    /// Add a host-provided event source
    pub fn register_event_source(&self, source: Box<dyn EventSource>) {
        tracing::debug!(source = source.name(), "event source registered");
        self.inner.sources.lock().register(source);
    }

    fn pump(&self, kind: EventLoopKind, hint: Option<f64>) -> VesselResult<usize> {
        self.with_vm(|vm| {
            if !vm.is_loaded() {
                return Ok(0);
            }
            self.inner.sources.lock().process(kind, vm, hint)
        })
    }

    /// Drain pending events of `kind` without blocking
    ///
    /// Returns the number of callbacks run. Absent sources count as having
    /// nothing pending.
    pub fn process(&self, kind: EventLoopKind) -> VesselResult<usize> {
        self.tracked(|| self.pump(kind, None))
    }

    /// Whether `process(kind)` would run anything now
    ///
    /// Returns `false` when the calling thread may not touch the VM.
    pub fn has_pending(&self, kind: EventLoopKind) -> bool {
        self.with_vm(|vm| {
            Ok(vm.is_loaded() && self.inner.sources.lock().has_pending(kind, vm, None))
        })
        .unwrap_or(false)
    }

    /// Per-frame update for hosts driving the VM from their own loop
    ///
    /// Processes every source once, advancing cooperative timers by
    /// `delta_time` seconds. With nothing pending this changes nothing.
    pub fn update(&self, delta_time: f64) -> VesselResult<()> {
        self.tracked(|| {
            if !delta_time.is_finite() || delta_time < 0.0 {
                return Err(VesselError::InvalidArgument(format!(
                    "delta time must be a non-negative number, got {delta_time}"
                )));
            }
            self.pump(EventLoopKind::All, Some(delta_time)).map(|_| ())
        })
    }

    /// Whether `update()` has anything to do
    pub fn has_pending_work(&self) -> bool {
        self.has_pending(EventLoopKind::All)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_selection() {
        assert!(EventLoopKind::All.selects(EventLoopKind::AsyncIo));
        assert!(EventLoopKind::All.selects(EventLoopKind::Cooperative));
        assert!(EventLoopKind::Cooperative.selects(EventLoopKind::Cooperative));
        assert!(!EventLoopKind::AsyncIo.selects(EventLoopKind::Cooperative));
    }

    #[test]
    fn test_absent_sources_are_quiet() {
        let mut vm = Vm::new(Default::default());
        let mut mux = Multiplexer::new();
        assert!(!mux.has_pending(EventLoopKind::All, &vm, Some(1.0)));
        assert_eq!(mux.process(EventLoopKind::All, &mut vm, Some(1.0)).unwrap(), 0);
    }
}
