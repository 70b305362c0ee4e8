//! Integration mode controller

use crate::error::{VesselError, VesselResult};
use crate::lifecycle::LifecycleState;
use crate::Vessel;

/// How the host drives the VM
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IntegrationMode {
    /// The host thread runs everything and pumps events with `update()`
    #[default]
    NonThreaded = 0,
    /// A dedicated VM thread runs everything; other threads enqueue calls
    Threaded = 1,
}

impl Vessel {
    /// Select the integration mode
    ///
    /// Only valid before the entry point runs and while the VM thread is
    /// stopped.
    pub fn set_mode(&self, mode: IntegrationMode) -> VesselResult<()> {
        self.tracked(|| {
            let mut core = self.inner.core.lock();
            if core.state == LifecycleState::Destroyed {
                return Err(VesselError::NotInitialized("instance destroyed".to_string()));
            }
            if core.state >= LifecycleState::EntryRan || core.vm_thread.is_some() {
                return Err(VesselError::InvalidArgument(
                    "integration mode is locked once the entry point has run".to_string(),
                ));
            }
            if core.mode != mode {
                tracing::debug!(?mode, "integration mode selected");
                core.mode = mode;
            }
            Ok(())
        })
    }

    /// Current integration mode
    pub fn mode(&self) -> IntegrationMode {
        self.inner.core.lock().mode
    }
}
