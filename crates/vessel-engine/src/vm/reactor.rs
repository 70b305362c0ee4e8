//! Async-I/O reactor
//!
//! Blocking file reads run on short-lived background threads. Completions come
//! back over a crossbeam channel and are dispatched as VM callbacks when the
//! host drains the async-I/O event source. Background threads never touch the
//! VM: they only produce owned strings.
//!
//! Every request is tracked by id from submission until its callback is
//! dispatched, wherever it currently is (running, on the channel, deferred).

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// A finished I/O request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCompletion {
    /// Request id
    pub id: u64,
    /// Callback function name
    pub callback: String,
    /// File contents, or the error message
    pub result: Result<String, String>,
}

/// Background I/O with completion queue
#[derive(Debug)]
pub struct IoReactor {
    tx: Sender<IoCompletion>,
    rx: Receiver<IoCompletion>,
    /// Completions taken off the channel but not yet dispatched
    deferred: VecDeque<IoCompletion>,
    in_flight: Arc<AtomicUsize>,
    next_id: AtomicU64,
    /// Callback of every request not yet dispatched, by id
    outstanding: Mutex<FxHashMap<u64, String>>,
}

impl Default for IoReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl IoReactor {
    /// Create an idle reactor
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            tx,
            rx,
            deferred: VecDeque::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
            outstanding: Mutex::new(FxHashMap::default()),
        }
    }

    /// Start reading `path` in the background
    pub fn submit_read(&self, path: PathBuf, callback: &str) -> std::io::Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let in_flight = self.in_flight.clone();
        let callback = callback.to_string();

        self.outstanding.lock().insert(id, callback.clone());
        in_flight.fetch_add(1, Ordering::AcqRel);
        let spawned = thread::Builder::new()
            .name(format!("vessel-io-{id}"))
            .spawn(move || {
                let result = std::fs::read_to_string(&path).map_err(|e| e.to_string());
                let _ = tx.send(IoCompletion { id, callback, result });
                // Decrement after sending: in_flight == 0 implies the completion is queued
                in_flight.fetch_sub(1, Ordering::AcqRel);
            });
        if let Err(e) = spawned {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.outstanding.lock().remove(&id);
            return Err(e);
        }
        tracing::debug!(id, "async read submitted");
        Ok(())
    }

    /// Whether completions are waiting to be dispatched
    pub fn has_ready(&self) -> bool {
        !self.deferred.is_empty() || !self.rx.is_empty()
    }

    /// Requests still running in the background
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take the completions ready right now
    ///
    /// Completions that arrive while the caller dispatches these are left for
    /// the next call.
    pub fn take_ready(&mut self) -> Vec<IoCompletion> {
        let mut ready: Vec<IoCompletion> = self.deferred.drain(..).collect();
        let queued = self.rx.len();
        ready.extend(self.rx.try_iter().take(queued));
        ready
    }

    /// Put back completions that were taken but not dispatched
    pub fn defer(&mut self, completions: impl IntoIterator<Item = IoCompletion>) {
        let completions: Vec<_> = completions.into_iter().collect();
        for completion in completions.into_iter().rev() {
            self.deferred.push_front(completion);
        }
    }

    /// Stop tracking a completion taken for dispatch
    pub fn dispatched(&self, id: u64) {
        self.outstanding.lock().remove(&id);
    }

    /// Callback names of every request not yet dispatched
    pub fn pending_callbacks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.outstanding.lock().values().cloned().collect();
        names.sort();
        names.dedup();
        names
    }
}
