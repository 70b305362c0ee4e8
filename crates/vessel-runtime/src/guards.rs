//! GC safety guards
//!
//! Threads other than the VM-affine one must register before touching
//! managed memory; once registered they may use the instance directly in
//! non-threaded mode, waiting their turn for the VM. Any registered thread
//! that is about to block outside the VM (I/O, sleeps, host locks) must
//! bracket the wait so collector pauses do not wait for it. The scoped guards release on every exit path.

use crate::error::{VesselError, VesselResult};
use crate::Vessel;
use std::marker::PhantomData;

impl Vessel {
    fn require_not_destroyed(&self) -> VesselResult<()> {
        if self.state() == crate::LifecycleState::Destroyed {
            return Err(VesselError::NotInitialized("instance destroyed".to_string()));
        }
        Ok(())
    }

    /// Register the calling thread with the collector
    ///
    /// Nests: returns the registration depth of the calling thread.
    pub fn worker_register(&self) -> VesselResult<usize> {
        self.tracked(|| {
            self.require_not_destroyed()?;
            let depth = self.inner.threads.register_current();
            tracing::debug!(depth, "worker registered");
            Ok(depth)
        })
    }

    /// Undo one `worker_register` of the calling thread
    pub fn worker_unregister(&self) -> VesselResult<usize> {
        self.tracked(|| {
            let remaining = self.inner.threads.unregister_current().map_err(|_| {
                VesselError::UnbalancedGuard(
                    "worker_unregister without a matching worker_register".to_string(),
                )
            })?;
            tracing::debug!(remaining, "worker unregistered");
            Ok(remaining)
        })
    }

    /// Enter a blocking bracket; the calling thread must be registered
    pub fn blocking_begin(&self) -> VesselResult<usize> {
        self.tracked(|| {
            self.require_not_destroyed()?;
            Ok(self.inner.threads.blocking_begin()?)
        })
    }

    /// Leave a blocking bracket
    ///
    /// Waits while a collection is in progress. Fails with `UnbalancedGuard`
    /// without a matching `blocking_begin`.
    pub fn blocking_end(&self) -> VesselResult<usize> {
        self.tracked(|| Ok(self.inner.threads.blocking_end()?))
    }

    /// Blocking brackets open across all threads
    pub fn outstanding_blocking(&self) -> usize {
        self.inner.threads.outstanding_blocking()
    }

    /// Park here if a collection is waiting for this thread
    pub fn safepoint(&self) {
        self.inner.threads.poll();
    }

    /// Register the calling thread for the guard's lifetime
    pub fn worker_guard(&self) -> VesselResult<WorkerGuard> {
        self.worker_register()?;
        Ok(WorkerGuard {
            vessel: self.clone(),
            _not_send: PhantomData,
        })
    }

    /// Bracket a blocking section for the guard's lifetime
    pub fn blocking_guard(&self) -> VesselResult<BlockingGuard> {
        self.blocking_begin()?;
        Ok(BlockingGuard {
            vessel: self.clone(),
            _not_send: PhantomData,
        })
    }
}

/// Scoped worker registration
///
/// Tied to the thread that created it, since registration is per thread.
#[must_use = "the thread is unregistered when the guard is dropped"]
pub struct WorkerGuard {
    vessel: Vessel,
    _not_send: PhantomData<*const ()>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Err(e) = self.vessel.worker_unregister() {
            tracing::warn!(error = %e, "worker guard release failed");
        }
    }
}

impl std::fmt::Debug for WorkerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGuard").finish_non_exhaustive()
    }
}

/// Scoped blocking bracket
#[must_use = "the bracket closes when the guard is dropped"]
pub struct BlockingGuard {
    vessel: Vessel,
    _not_send: PhantomData<*const ()>,
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        if let Err(e) = self.vessel.blocking_end() {
            tracing::warn!(error = %e, "blocking guard release failed");
        }
    }
}

impl std::fmt::Debug for BlockingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingGuard").finish_non_exhaustive()
    }
}
