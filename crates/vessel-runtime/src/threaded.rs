//! Threaded execution engine
//!
//! In threaded mode a dedicated VM thread owns the instance: it runs the entry
//! point, then serves a FIFO call queue that any thread may feed. Between
//! requests it pumps the event multiplexer every `tick_interval`, so timers
//! and background I/O keep progressing without a host frame loop.
//!
//! Waiting is bounded by configuration: `stop()` by `threading.stop_timeout_ms`
//! and `call_sync` by `threading.call_timeout_ms` (`0` means unbounded).

use crate::error::{VesselError, VesselResult};
use crate::events::EventLoopKind;
use crate::instance::Inner;
use crate::lifecycle::LifecycleState;
use crate::mode::IntegrationMode;
use crate::Vessel;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use vessel_engine::ThreadRegistry;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result delivered to an async completion callback
pub type CallOutcome<R> = Result<R, VesselError>;

/// State of the VM thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// No VM thread
    Stopped,
    /// VM thread serving calls
    Running,
    /// Stop requested; the thread has not exited yet
    Stopping,
}

// ===== Call queue =====

struct QueueState {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct CallQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

enum Next {
    Job(Job),
    Idle,
    Stop,
}

impl CallQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                stopping: false,
            }),
            available: Condvar::new(),
        }
    }

    fn push(&self, job: Job) -> usize {
        let mut state = self.state.lock();
        state.jobs.push_back(job);
        let depth = state.jobs.len();
        self.available.notify_one();
        depth
    }

    fn stop(&self) {
        self.state.lock().stopping = true;
        self.available.notify_all();
    }

    /// Next job; queued jobs are always served before a stop takes effect
    fn next(&self, idle: Duration) -> Next {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Next::Job(job);
            }
            if state.stopping {
                return Next::Stop;
            }
            if self.available.wait_for(&mut state, idle).timed_out() {
                return match state.jobs.pop_front() {
                    Some(job) => Next::Job(job),
                    None if state.stopping => Next::Stop,
                    None => Next::Idle,
                };
            }
        }
    }
}

/// Set by the VM thread as its very last action
struct ExitSignal {
    done: Mutex<bool>,
    changed: Condvar,
}

impl ExitSignal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            changed: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.done.lock() = true;
        self.changed.notify_all();
    }

    /// Wait for the exit; `false` on timeout
    fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.done.lock();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*done {
                    if self.changed.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                true
            }
            None => {
                while !*done {
                    self.changed.wait(&mut done);
                }
                true
            }
        }
    }
}

struct SignalOnExit(Arc<ExitSignal>);

impl Drop for SignalOnExit {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// Completion slot of one `call_sync`
struct CallSlot<R> {
    result: Mutex<Option<thread::Result<R>>>,
    done: Condvar,
}

impl<R> CallSlot<R> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: thread::Result<R>) {
        *self.result.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<thread::Result<R>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut result = self.result.lock();
        while result.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut result, deadline).timed_out() {
                        break;
                    }
                }
                None => self.done.wait(&mut result),
            }
        }
        result.take()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("call panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("call panicked: {s}")
    } else {
        "call panicked".to_string()
    }
}

// ===== Engine state =====

pub(crate) struct Engine {
    status: EngineStatus,
    queue: Arc<CallQueue>,
    exit: Arc<ExitSignal>,
    handle: Option<JoinHandle<()>>,
    /// Host thread held out of collector pauses while the VM thread runs
    host_hold: Option<ThreadId>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            status: EngineStatus::Stopped,
            queue: Arc::new(CallQueue::new()),
            exit: Arc::new(ExitSignal::new()),
            handle: None,
            host_hold: None,
        }
    }
}

fn vm_thread_main(
    inner: Weak<Inner>,
    threads: Arc<ThreadRegistry>,
    queue: Arc<CallQueue>,
    exit: Arc<ExitSignal>,
    tick: Duration,
) {
    let _exit = SignalOnExit(exit);

    // start() publishes this thread as the VM thread while holding the core lock
    match inner.upgrade() {
        Some(strong) => drop(strong.core.lock()),
        None => return,
    }
    threads.register_current();
    tracing::debug!("VM thread started");

    if let Some(strong) = inner.upgrade() {
        let vessel = Vessel { inner: strong };
        if vessel.state() == LifecycleState::ModuleLoaded {
            if let Err(e) = vessel.call_entry() {
                tracing::error!(error = %e, "entry point failed on the VM thread");
            }
        }
    }

    let mut last_pump = Instant::now();
    loop {
        match queue.next(tick) {
            Next::Job(job) => job(),
            Next::Stop => break,
            Next::Idle => {}
        }
        if last_pump.elapsed() >= tick {
            let Some(strong) = inner.upgrade() else { break };
            let vessel = Vessel { inner: strong };
            if vessel.state().has_module() {
                if let Err(e) = vessel.process(EventLoopKind::All) {
                    tracing::warn!(error = %e, "event processing failed on the VM thread");
                }
            }
            last_pump = Instant::now();
        }
        threads.poll();
    }

    if let Err(e) = threads.unregister_current() {
        tracing::warn!(error = %e, "VM thread was not registered at exit");
    }
    tracing::debug!("VM thread exiting");
}

impl Vessel {
    /// Start the VM thread
    ///
    /// Requires threaded mode and a loaded module. The thread runs the entry
    /// point first if it has not run yet.
    pub fn start(&self) -> VesselResult<()> {
        self.tracked(|| {
            let mut core = self.inner.core.lock();
            match core.state {
                LifecycleState::Destroyed | LifecycleState::Uninitialized => {
                    return Err(VesselError::NotInitialized("instance not initialized".to_string()))
                }
                s if !s.has_module() => {
                    return Err(VesselError::NotInitialized("no module loaded".to_string()))
                }
                _ => {}
            }
            if core.mode != IntegrationMode::Threaded {
                return Err(VesselError::InvalidArgument(
                    "the VM thread requires threaded mode".to_string(),
                ));
            }

            let mut engine = self.inner.engine.lock();
            match engine.status {
                EngineStatus::Running => return Err(VesselError::ThreadAlreadyRunning),
                EngineStatus::Stopping => return Err(VesselError::ThreadAlreadyRunning),
                EngineStatus::Stopped => {}
            }

            let queue = Arc::new(CallQueue::new());
            let exit = Arc::new(ExitSignal::new());
            let threads = self.inner.threads.clone();

            // The host thread stops touching the VM; keep it out of collector pauses
            let host_hold = core.init_thread.filter(|host| threads.hold(*host).is_ok());

            let spawned = thread::Builder::new().name("vessel-vm".to_string()).spawn({
                let inner = Arc::downgrade(&self.inner);
                let threads = threads.clone();
                let queue = queue.clone();
                let exit = exit.clone();
                let tick = self.inner.config.tick_interval();
                move || vm_thread_main(inner, threads, queue, exit, tick)
            });
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    if let Some(host) = host_hold {
                        if let Err(err) = threads.release(host) {
                            tracing::warn!(error = %err, "host thread hold was not released");
                        }
                    }
                    return Err(VesselError::ThreadStartFailed(e.to_string()));
                }
            };

            core.vm_thread = Some(handle.thread().id());
            *engine = Engine {
                status: EngineStatus::Running,
                queue,
                exit,
                handle: Some(handle),
                host_hold,
            };
            tracing::info!("VM thread started");
            Ok(())
        })
    }

    /// Stop the VM thread after it finishes the queued work
    ///
    /// No-op when already stopped. Fails with `ThreadStopFailed` if the thread
    /// does not exit within the stop timeout; it is then detached and keeps
    /// the instance, and a later `stop()` waits for it again.
    pub fn stop(&self) -> VesselResult<()> {
        self.tracked(|| self.shutdown_engine())
    }

    pub(crate) fn shutdown_engine(&self) -> VesselResult<()> {
        let vm_thread = self.inner.core.lock().vm_thread;
        let (queue, exit, handle) = {
            let mut engine = self.inner.engine.lock();
            if engine.status == EngineStatus::Stopped {
                return Ok(());
            }
            engine.status = EngineStatus::Stopping;
            (engine.queue.clone(), engine.exit.clone(), engine.handle.take())
        };
        queue.stop();

        if vm_thread == Some(thread::current().id()) {
            // Joining ourselves would deadlock; the loop exits after this job
            return Err(VesselError::WrongThread(
                "the VM thread cannot wait for itself to stop".to_string(),
            ));
        }

        let timeout = self.inner.config.stop_timeout();
        if !exit.wait(timeout) {
            tracing::warn!(?timeout, "VM thread did not stop in time; detaching");
            return Err(VesselError::ThreadStopFailed(format!(
                "VM thread did not exit within {timeout:?}"
            )));
        }
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("VM thread panicked");
            }
        }

        let host_hold = {
            let mut engine = self.inner.engine.lock();
            engine.status = EngineStatus::Stopped;
            engine.host_hold.take()
        };
        self.inner.core.lock().vm_thread = None;
        tracing::info!("VM thread stopped");
        if let Some(host) = host_hold {
            self.inner.threads.release(host)?;
        }
        Ok(())
    }

    /// Whether the VM thread is serving calls
    pub fn is_running(&self) -> bool {
        self.inner.engine.lock().status == EngineStatus::Running
    }

    /// State of the VM thread
    pub fn engine_status(&self) -> EngineStatus {
        self.inner.engine.lock().status
    }

    /// Whether the calling thread is the VM thread
    pub fn is_vm_thread(&self) -> bool {
        self.inner.core.lock().vm_thread == Some(thread::current().id())
    }

    fn admit_call(&self, sync: bool) -> VesselResult<Arc<CallQueue>> {
        let (state, vm_thread) = {
            let core = self.inner.core.lock();
            (core.state, core.vm_thread)
        };
        if state == LifecycleState::Destroyed {
            return Err(VesselError::NotInitialized("instance destroyed".to_string()));
        }
        if sync && vm_thread == Some(thread::current().id()) {
            return Err(VesselError::WrongThread(
                "call_sync from the VM thread would wait on itself".to_string(),
            ));
        }
        let engine = self.inner.engine.lock();
        if engine.status != EngineStatus::Running {
            return Err(VesselError::ThreadNotStarted);
        }
        Ok(engine.queue.clone())
    }

    /// Run `f` on the VM thread and wait for its result
    ///
    /// Calls from one thread run in the order they were made. A panic in `f`
    /// is caught on the VM thread and reported as `CallFailed`. If the wait
    /// exceeds the call timeout this fails with `Timeout`; `f` still runs
    /// later.
    pub fn call_sync<R, F>(&self, f: F) -> VesselResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.tracked(|| {
            let queue = self.admit_call(true)?;
            let slot = Arc::new(CallSlot::new());
            let job_slot = slot.clone();
            let depth = queue.push(Box::new(move || {
                job_slot.complete(panic::catch_unwind(AssertUnwindSafe(f)));
            }));
            tracing::debug!(depth, "sync call queued");

            // A registered caller must not hold up collections while it waits
            let threads = &self.inner.threads;
            let bracketed = threads.blocking_begin().is_ok();
            let timeout = self.inner.config.call_timeout();
            let outcome = slot.wait(timeout);
            if bracketed {
                if let Err(err) = threads.blocking_end() {
                    tracing::warn!(error = %err, "sync call bracket was not closed");
                }
            }

            match outcome {
                Some(Ok(value)) => Ok(value),
                Some(Err(payload)) => Err(VesselError::CallFailed(panic_message(&*payload))),
                None => {
                    tracing::warn!(?timeout, "sync call timed out");
                    Err(VesselError::Timeout(format!(
                        "call_sync did not complete within {timeout:?}"
                    )))
                }
            }
        })
    }

    /// Queue `f` on the VM thread and return immediately
    pub fn call_async<R, F>(&self, f: F) -> VesselResult<()>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.call_async_with(f, |_: CallOutcome<R>| {})
    }

    /// Queue `f`; `on_complete` runs on the VM thread with its outcome
    pub fn call_async_with<R, F, C>(&self, f: F, on_complete: C) -> VesselResult<()>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
        C: FnOnce(CallOutcome<R>) + Send + 'static,
    {
        self.tracked(|| {
            let queue = self.admit_call(false)?;
            let depth = queue.push(Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(f))
                    .map_err(|payload| VesselError::CallFailed(panic_message(&*payload)));
                if let Err(e) = &outcome {
                    tracing::warn!(error = %e, "async call failed");
                }
                if panic::catch_unwind(AssertUnwindSafe(|| on_complete(outcome))).is_err() {
                    tracing::warn!("async completion callback panicked");
                }
            }));
            tracing::debug!(depth, "async call queued");
            Ok(())
        })
    }
}
