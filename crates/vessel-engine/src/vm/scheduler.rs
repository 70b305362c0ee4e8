//! Cooperative timer and main-loop scheduler
//!
//! Time is a virtual clock in seconds. The host either advances it explicitly
//! (a frame delta) or lets it follow the wall clock. The two can be mixed: a
//! wall-clock advance only adds the wall time that frame deltas since the
//! previous wall-clock advance did not already cover. Callbacks are stored by
//! function *name*, so a patched module picks up the new bodies without the
//! scheduler noticing.

use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Entry in the timer heap
#[derive(Debug, Clone)]
struct TimerEntry {
    /// Virtual time at which the callback is due
    due: f64,
    /// Insertion order, so equal due times run FIFO
    seq: u64,
    id: u32,
    callback: String,
    /// Re-arm interval for repeating timers
    interval: Option<f64>,
}

// Reverse ordering for min-heap (earliest due time first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .total_cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// A callback taken off the scheduler, ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueCallback {
    /// Function name
    pub callback: String,
    /// Timer id, or `None` for main-loop callbacks
    pub timer: Option<u32>,
}

/// Cooperative scheduler state
#[derive(Debug)]
pub struct CooperativeScheduler {
    clock: f64,
    /// Baseline of the last wall-clock advance
    last_wall: Instant,
    /// Frame deltas added since `last_wall`
    hinted_since_wall: f64,
    timers: BinaryHeap<TimerEntry>,
    cancelled: FxHashSet<u32>,
    main_loop: Vec<String>,
    next_id: u32,
    seq: u64,
}

impl Default for CooperativeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CooperativeScheduler {
    /// Create an empty scheduler at virtual time zero
    pub fn new() -> Self {
        Self {
            clock: 0.0,
            last_wall: Instant::now(),
            hinted_since_wall: 0.0,
            timers: BinaryHeap::new(),
            cancelled: FxHashSet::default(),
            main_loop: Vec::new(),
            next_id: 1,
            seq: 0,
        }
    }

    /// Current virtual time in seconds
    pub fn now(&self) -> f64 {
        self.clock
    }

    fn push(&mut self, id: u32, callback: String, due: f64, interval: Option<f64>) {
        self.seq += 1;
        self.timers.push(TimerEntry {
            due,
            seq: self.seq,
            id,
            callback,
            interval,
        });
    }

    /// Schedule `callback` after `delay` seconds; repeating timers re-arm every `delay`
    pub fn add_timer(&mut self, callback: &str, delay: f64, repeat: bool) -> u32 {
        let delay = if delay.is_finite() { delay.max(0.0) } else { 0.0 };
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let interval = repeat.then_some(delay);
        self.push(id, callback.to_string(), self.clock + delay, interval);
        id
    }

    /// Cancel a pending timer; returns whether it was pending
    pub fn cancel(&mut self, id: u32) -> bool {
        let pending = self
            .timers
            .iter()
            .any(|t| t.id == id && !self.cancelled.contains(&t.id));
        if pending {
            self.cancelled.insert(id);
        }
        pending
    }

    /// Run `callback` on every tick from now on
    pub fn add_main_loop(&mut self, callback: &str) {
        self.main_loop.push(callback.to_string());
    }

    /// Advance the clock: by `hint` seconds, or to follow the wall clock
    pub fn advance(&mut self, hint: Option<f64>) {
        match hint {
            Some(dt) => {
                let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
                self.clock += dt;
                self.hinted_since_wall += dt;
            }
            None => {
                self.clock += self.uncovered_wall_time();
                self.last_wall = Instant::now();
                self.hinted_since_wall = 0.0;
            }
        }
    }

    /// Wall time since the last wall-clock advance not yet added as frame deltas
    fn uncovered_wall_time(&self) -> f64 {
        (self.last_wall.elapsed().as_secs_f64() - self.hinted_since_wall).max(0.0)
    }

    /// Whether anything would run on a tick taken now
    ///
    /// With `hint`, the clock is projected forward by that many seconds;
    /// without, by the wall time a wall-clock advance would add.
    pub fn has_pending(&self, hint: Option<f64>) -> bool {
        if !self.main_loop.is_empty() {
            return true;
        }
        let projected = self.clock
            + match hint {
                Some(dt) => dt.max(0.0),
                None => self.uncovered_wall_time(),
            };
        self.timers
            .iter()
            .any(|t| t.due <= projected && !self.cancelled.contains(&t.id))
    }

    /// Whether any timer or main-loop callback is registered at all
    pub fn is_active(&self) -> bool {
        !self.main_loop.is_empty() || self.timers.len() > self.cancelled.len()
    }

    /// Take everything due at the current clock
    ///
    /// Only entries due *now* are taken; repeating timers are re-armed after
    /// the sweep, so a zero-interval timer runs once per sweep, not forever.
    /// Main-loop callbacks come last.
    pub fn take_due(&mut self) -> Vec<DueCallback> {
        let mut due = Vec::new();
        let mut rearm = Vec::new();
        while let Some(top) = self.timers.peek() {
            if top.due > self.clock {
                break;
            }
            let Some(entry) = self.timers.pop() else { break };
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            due.push(DueCallback {
                callback: entry.callback.clone(),
                timer: Some(entry.id),
            });
            if let Some(interval) = entry.interval {
                let next_due = (entry.due + interval).max(self.clock);
                rearm.push(TimerEntry {
                    due: next_due,
                    ..entry
                });
            }
        }
        for entry in rearm {
            self.push(entry.id, entry.callback, entry.due, entry.interval);
        }
        due.extend(self.main_loop.iter().map(|cb| DueCallback {
            callback: cb.clone(),
            timer: None,
        }));
        due
    }

    /// Put back timer callbacks that were taken but not run
    ///
    /// They become due immediately, keeping their relative order.
    pub fn defer(&mut self, callbacks: impl IntoIterator<Item = DueCallback>) {
        for cb in callbacks {
            if let Some(id) = cb.timer {
                let due = self.clock;
                self.push(id, cb.callback, due, None);
            }
        }
    }

    /// Names of every callback the scheduler may still invoke
    pub fn callback_names(&self) -> impl Iterator<Item = &str> {
        self.timers
            .iter()
            .filter(|t| !self.cancelled.contains(&t.id))
            .map(|t| t.callback.as_str())
            .chain(self.main_loop.iter().map(String::as_str))
    }

    /// Number of pending (uncancelled) timers
    pub fn pending_timers(&self) -> usize {
        self.timers
            .iter()
            .filter(|t| !self.cancelled.contains(&t.id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(due: &[DueCallback]) -> Vec<&str> {
        due.iter().map(|d| d.callback.as_str()).collect()
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let mut s = CooperativeScheduler::new();
        s.add_timer("late", 0.5, false);
        s.add_timer("early", 0.1, false);
        s.add_timer("early_too", 0.1, false);

        s.advance(Some(0.2));
        assert_eq!(names(&s.take_due()), vec!["early", "early_too"]);
        s.advance(Some(0.2));
        assert!(s.take_due().is_empty());
        s.advance(Some(0.2));
        assert_eq!(names(&s.take_due()), vec!["late"]);
        assert_eq!(s.pending_timers(), 0);
    }

    #[test]
    fn test_repeating_timer_rearms() {
        let mut s = CooperativeScheduler::new();
        s.add_timer("tick", 0.25, true);
        let mut fired = 0;
        for _ in 0..8 {
            s.advance(Some(0.125));
            fired += s.take_due().len();
        }
        assert_eq!(fired, 4);
        assert_eq!(s.pending_timers(), 1);
    }

    #[test]
    fn test_zero_interval_runs_once_per_tick() {
        let mut s = CooperativeScheduler::new();
        s.add_timer("spin", 0.0, true);
        let first = s.take_due();
        assert_eq!(first.len(), 1);
        // The re-armed entry waits for the next sweep instead of looping
        assert_eq!(s.pending_timers(), 1);
        assert_eq!(s.take_due().len(), 1);
    }

    #[test]
    fn test_cancel() {
        let mut s = CooperativeScheduler::new();
        let id = s.add_timer("never", 0.1, false);
        assert!(s.cancel(id));
        assert!(!s.cancel(id));
        assert!(!s.has_pending(Some(1.0)));
        s.advance(Some(1.0));
        assert!(s.take_due().is_empty());
    }

    #[test]
    fn test_main_loop_always_pending() {
        let mut s = CooperativeScheduler::new();
        assert!(!s.has_pending(Some(0.0)));
        s.add_main_loop("frame");
        assert!(s.has_pending(Some(0.0)));
        assert_eq!(names(&s.take_due()), vec!["frame"]);
        assert_eq!(names(&s.take_due()), vec!["frame"]);
    }

    #[test]
    fn test_has_pending_projects_hint() {
        let mut s = CooperativeScheduler::new();
        s.add_timer("soon", 0.016, false);
        assert!(!s.has_pending(Some(0.0)));
        assert!(s.has_pending(Some(0.016)));
        // Projection does not move the clock
        assert_eq!(s.now(), 0.0);
    }

    #[test]
    fn test_wall_advance_skips_time_covered_by_frames() {
        let mut s = CooperativeScheduler::new();
        s.advance(Some(10.0));
        s.advance(None);
        assert_eq!(s.now(), 10.0);

        std::thread::sleep(std::time::Duration::from_millis(20));
        s.advance(None);
        assert!(s.now() > 10.0 && s.now() < 11.0, "{}", s.now());
    }

    #[test]
    fn test_defer_puts_back_unrun_timers() {
        let mut s = CooperativeScheduler::new();
        s.add_timer("a", 0.0, false);
        s.add_timer("b", 0.0, false);
        let mut due = s.take_due();
        let rest = due.split_off(1);
        s.defer(rest);
        assert_eq!(names(&s.take_due()), vec!["b"]);
    }
}
