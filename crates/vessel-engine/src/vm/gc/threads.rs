//! Thread registry and stop-the-world coordination
//!
//! Any OS thread that may touch managed memory must be registered. Before the
//! collector sweeps, every registered thread other than the collecting one has
//! to be in one of two states:
//!
//! - **parked** at a safepoint ([`ThreadRegistry::poll`]), or
//! - **blocking**: inside a blocking bracket, promising not to touch managed
//!   memory until it leaves the bracket.
//!
//! Leaving a blocking bracket while a pause is in progress waits for the pause
//! to end, which is what makes the promise hold.
//!
//! An owner can also **hold** a thread it knows is kept away from managed
//! memory ([`ThreadRegistry::hold`]). A hold is separate from the thread's
//! own brackets, so the thread cannot close it by mistake.
//!
//! ## Stalls
//!
//! A registered thread that neither polls nor brackets its blocking calls would
//! hold the collector forever. Establishing a pause is therefore bounded by
//! `pause_timeout`; on timeout the pause is abandoned, counted as stalled and
//! the collection is skipped. The heap grows instead of the VM hanging.

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Thread registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    /// The thread is not registered
    #[error("Thread is not registered with the VM")]
    NotRegistered,

    /// `blocking_end` without a matching `blocking_begin`
    #[error("blocking_end without a matching blocking_begin")]
    Unbalanced,

    /// A stop-the-world pause could not be established in time
    #[error("Pause not established after {waited:?}: {unresponsive} thread(s) never reached a safepoint")]
    PauseTimeout {
        /// How long the collector waited
        waited: Duration,
        /// Threads that were neither parked nor blocking
        unresponsive: usize,
    },
}

#[derive(Debug, Default)]
struct ThreadSlot {
    registrations: usize,
    blocking_depth: usize,
    parked: bool,
    held: bool,
}

impl ThreadSlot {
    fn is_quiescent(&self) -> bool {
        self.parked || self.held || self.blocking_depth > 0
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    threads: FxHashMap<ThreadId, ThreadSlot>,
    /// Thread currently running a stop-the-world operation
    collector: Option<ThreadId>,
    outstanding_blocking: usize,
    stalled_pauses: u64,
}

impl RegistryState {
    fn pause_blocks(&self, me: ThreadId) -> bool {
        matches!(self.collector, Some(c) if c != me)
    }
}

/// Registry of threads allowed to touch managed memory
#[derive(Debug)]
pub struct ThreadRegistry {
    state: Mutex<RegistryState>,
    changed: Condvar,
    /// Fast-path flag mirrored from `state.collector`
    pause_pending: AtomicBool,
    pause_timeout: Duration,
}

impl ThreadRegistry {
    /// Create a registry whose pauses give up after `pause_timeout`
    pub fn new(pause_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            changed: Condvar::new(),
            pause_pending: AtomicBool::new(false),
            pause_timeout,
        }
    }

    // ===== Registration =====

    /// Register the calling thread
    ///
    /// Registering an already registered thread nests: it takes the same
    /// number of [`unregister_current`](Self::unregister_current) calls to
    /// leave. Returns the new nesting depth. Waits if a pause is in progress.
    pub fn register_current(&self) -> usize {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.pause_blocks(me) && !state.threads.contains_key(&me) {
            self.changed.wait(&mut state);
        }
        let slot = state.threads.entry(me).or_default();
        slot.registrations += 1;
        slot.registrations
    }

    /// Undo one registration of the calling thread
    pub fn unregister_current(&self) -> Result<usize, ThreadError> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let slot = state.threads.get_mut(&me).ok_or(ThreadError::NotRegistered)?;
        slot.registrations -= 1;
        let remaining = slot.registrations;
        if remaining == 0 {
            if let Some(slot) = state.threads.remove(&me) {
                state.outstanding_blocking -= slot.blocking_depth;
            }
            // A collector may have been waiting on this thread
            self.changed.notify_all();
        }
        Ok(remaining)
    }

    /// Whether `id` is registered
    pub fn is_registered(&self, id: ThreadId) -> bool {
        self.state.lock().threads.contains_key(&id)
    }

    /// Number of registered threads
    pub fn registered_count(&self) -> usize {
        self.state.lock().threads.len()
    }

    // ===== Blocking brackets =====

    /// Enter a blocking bracket on the calling thread
    pub fn blocking_begin(&self) -> Result<usize, ThreadError> {
        self.blocking_begin_for(thread::current().id())
    }

    /// Leave a blocking bracket on the calling thread
    pub fn blocking_end(&self) -> Result<usize, ThreadError> {
        self.blocking_end_for(thread::current().id())
    }

    /// Enter a blocking bracket on behalf of `id`
    ///
    /// Returns the new bracket depth for that thread.
    pub fn blocking_begin_for(&self, id: ThreadId) -> Result<usize, ThreadError> {
        let mut state = self.state.lock();
        let slot = state.threads.get_mut(&id).ok_or(ThreadError::NotRegistered)?;
        slot.blocking_depth += 1;
        let depth = slot.blocking_depth;
        state.outstanding_blocking += 1;
        self.changed.notify_all();
        Ok(depth)
    }

    /// Leave a blocking bracket on behalf of `id`
    ///
    /// Leaving the outermost bracket waits while a pause is in progress.
    pub fn blocking_end_for(&self, id: ThreadId) -> Result<usize, ThreadError> {
        let mut state = self.state.lock();
        loop {
            let slot = state.threads.get(&id).ok_or(ThreadError::NotRegistered)?;
            if slot.blocking_depth == 0 {
                return Err(ThreadError::Unbalanced);
            }
            if slot.blocking_depth > 1 || !state.pause_blocks(id) {
                break;
            }
            self.changed.wait(&mut state);
        }
        let slot = state.threads.get_mut(&id).ok_or(ThreadError::NotRegistered)?;
        slot.blocking_depth -= 1;
        let depth = slot.blocking_depth;
        state.outstanding_blocking -= 1;
        Ok(depth)
    }

    /// Blocking brackets currently open across all threads
    pub fn outstanding_blocking(&self) -> usize {
        self.state.lock().outstanding_blocking
    }

    // ===== Holds =====

    /// Keep `id` out of pauses until [`release`](Self::release)
    ///
    /// Fails with `Unbalanced` if `id` is already held.
    pub fn hold(&self, id: ThreadId) -> Result<(), ThreadError> {
        let mut state = self.state.lock();
        let slot = state.threads.get_mut(&id).ok_or(ThreadError::NotRegistered)?;
        if slot.held {
            return Err(ThreadError::Unbalanced);
        }
        slot.held = true;
        self.changed.notify_all();
        Ok(())
    }

    /// End the hold on `id`
    ///
    /// Waits while a pause is in progress unless `id` is still inside a
    /// bracket of its own.
    pub fn release(&self, id: ThreadId) -> Result<(), ThreadError> {
        let mut state = self.state.lock();
        loop {
            let slot = state.threads.get(&id).ok_or(ThreadError::NotRegistered)?;
            if !slot.held {
                return Err(ThreadError::Unbalanced);
            }
            if slot.blocking_depth > 0 || !state.pause_blocks(id) {
                break;
            }
            self.changed.wait(&mut state);
        }
        if let Some(slot) = state.threads.get_mut(&id) {
            slot.held = false;
        }
        Ok(())
    }

    /// Whether `id` is held
    pub fn is_held(&self, id: ThreadId) -> bool {
        self.state.lock().threads.get(&id).map_or(false, |slot| slot.held)
    }

    // ===== Safepoints =====

    /// Safepoint poll
    ///
    /// Single atomic load when no pause is pending. Otherwise parks the calling
    /// thread until the pause ends. Unregistered threads return immediately.
    #[inline]
    pub fn poll(&self) {
        if self.pause_pending.load(Ordering::Acquire) {
            self.park();
        }
    }

    #[cold]
    #[inline(never)]
    fn park(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if !state.pause_blocks(me) {
            return;
        }
        match state.threads.get_mut(&me) {
            Some(slot) => slot.parked = true,
            None => return,
        }
        self.changed.notify_all();
        while state.pause_blocks(me) {
            self.changed.wait(&mut state);
        }
        if let Some(slot) = state.threads.get_mut(&me) {
            slot.parked = false;
        }
    }

    /// Whether a pause is in progress
    pub fn pause_pending(&self) -> bool {
        self.pause_pending.load(Ordering::Acquire)
    }

    /// Pauses abandoned because some thread never became quiescent
    pub fn stalled_pauses(&self) -> u64 {
        self.state.lock().stalled_pauses
    }

    /// Run `f` with every other registered thread parked or blocking
    pub fn stop_the_world<R>(&self, f: impl FnOnce() -> R) -> Result<R, ThreadError> {
        let me = thread::current().id();
        let start = Instant::now();
        let deadline = start + self.pause_timeout;

        let mut state = self.state.lock();
        // One pause at a time
        while state.pause_blocks(me) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                state.stalled_pauses += 1;
                return Err(ThreadError::PauseTimeout {
                    waited: start.elapsed(),
                    unresponsive: 0,
                });
            }
        }
        state.collector = Some(me);
        self.pause_pending.store(true, Ordering::Release);

        loop {
            let unresponsive = state
                .threads
                .iter()
                .filter(|(id, slot)| **id != me && !slot.is_quiescent())
                .count();
            if unresponsive == 0 {
                break;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                let unresponsive = state
                    .threads
                    .iter()
                    .filter(|(id, slot)| **id != me && !slot.is_quiescent())
                    .count();
                if unresponsive == 0 {
                    break;
                }
                state.collector = None;
                state.stalled_pauses += 1;
                self.pause_pending.store(false, Ordering::Release);
                self.changed.notify_all();
                tracing::warn!(
                    unresponsive,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "stop-the-world pause abandoned"
                );
                return Err(ThreadError::PauseTimeout {
                    waited: start.elapsed(),
                    unresponsive,
                });
            }
        }
        drop(state);

        let result = f();

        let mut state = self.state.lock();
        state.collector = None;
        self.pause_pending.store(false, Ordering::Release);
        self.changed.notify_all();
        Ok(result)
    }
}
