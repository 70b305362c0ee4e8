//! Mark-sweep string heap

use std::time::{Duration, Instant};

/// Handle to a heap string
///
/// Only valid while reachable from a root; the slot is reused after the
/// string is swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef(u32);

impl GcRef {
    /// Slot index
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Garbage collector statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total bytes freed
    pub bytes_freed: usize,

    /// Live objects right now
    pub live_objects: usize,

    /// Live bytes right now
    pub live_bytes: usize,

    /// Last collection duration
    pub last_pause_time: Duration,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Collections abandoned because other threads never reached a safepoint
    pub stalled_pauses: u64,
}

/// String arena with a free list
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Box<str>>>,
    marks: Vec<bool>,
    free: Vec<u32>,
    live_bytes: usize,
    allocated_since_gc: usize,
    threshold: usize,
    stats: GcStats,
}

impl Heap {
    /// Create a heap that asks for a collection after `threshold` bytes of allocation
    pub fn new(threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            live_bytes: 0,
            allocated_since_gc: 0,
            threshold: threshold.max(1),
            stats: GcStats::default(),
        }
    }

    /// Allocate a string
    pub fn alloc(&mut self, value: impl Into<Box<str>>) -> GcRef {
        let value = value.into();
        self.live_bytes += value.len();
        self.allocated_since_gc += value.len().max(1);
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(value);
                GcRef(idx)
            }
            None => {
                self.slots.push(Some(value));
                self.marks.push(false);
                GcRef((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Read a string
    pub fn get(&self, r: GcRef) -> Option<&str> {
        self.slots.get(r.0 as usize).and_then(|s| s.as_deref())
    }

    /// Whether enough has been allocated since the last collection to warrant another
    pub fn should_collect(&self) -> bool {
        self.allocated_since_gc >= self.threshold
    }

    /// Number of live strings
    pub fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Mark everything reachable from `roots` and sweep the rest
    ///
    /// Returns the number of strings freed. The caller is responsible for
    /// having stopped every other thread that could hold a [`GcRef`].
    pub fn collect(&mut self, roots: impl IntoIterator<Item = GcRef>) -> usize {
        let start = Instant::now();

        for root in roots {
            if let Some(mark) = self.marks.get_mut(root.0 as usize) {
                *mark = true;
            }
        }

        let mut freed = 0;
        let mut freed_bytes = 0;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let marked = std::mem::replace(&mut self.marks[idx], false);
            if marked {
                continue;
            }
            if let Some(value) = slot.take() {
                freed += 1;
                freed_bytes += value.len();
                self.free.push(idx as u32);
            }
        }

        self.live_bytes -= freed_bytes;
        self.allocated_since_gc = 0;

        let pause = start.elapsed();
        self.stats.collections += 1;
        self.stats.objects_freed += freed;
        self.stats.bytes_freed += freed_bytes;
        self.stats.last_pause_time = pause;
        self.stats.total_pause_time += pause;
        freed
    }

    /// Current statistics
    pub fn stats(&self) -> GcStats {
        GcStats {
            live_objects: self.live_objects(),
            live_bytes: self.live_bytes,
            ..self.stats.clone()
        }
    }
}
