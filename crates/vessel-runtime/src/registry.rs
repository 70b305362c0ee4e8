//! Process-wide instance registry
//!
//! A process hosts at most one VM for its whole lifetime. The rule is checked
//! when an instance is created: the first `create()` claims the registry slot
//! and every later one fails, even after the first instance was destroyed.

use crate::instance::Inner;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

static GLOBAL: Lazy<ProcessRegistry> = Lazy::new(ProcessRegistry::new);

enum Slot {
    Vacant,
    /// Claimed by an instance; the weak handle lets `current()` find it
    Claimed(Weak<Inner>),
}

/// Guards the one-instance-per-process rule
pub struct ProcessRegistry {
    slot: Mutex<Slot>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("claimed", &self.is_claimed())
            .finish()
    }
}

impl ProcessRegistry {
    /// Create an empty registry
    ///
    /// Hosts use [`ProcessRegistry::global`]; separate registries exist so
    /// tests can exercise the lifecycle more than once per process.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Vacant),
        }
    }

    /// The registry behind [`Vessel::create`](crate::Vessel::create)
    pub fn global() -> &'static ProcessRegistry {
        &GLOBAL
    }

    /// Whether an instance has ever been created in this registry
    pub fn is_claimed(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Claimed(_))
    }

    /// Claim the slot for `inner`; returns `false` if it was already claimed
    pub(crate) fn claim(&self, inner: &Arc<Inner>) -> bool {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Vacant => {
                *slot = Slot::Claimed(Arc::downgrade(inner));
                true
            }
            Slot::Claimed(_) => false,
        }
    }

    /// The live instance, if it still has handles
    pub(crate) fn current(&self) -> Option<Arc<Inner>> {
        match &*self.slot.lock() {
            Slot::Claimed(weak) => weak.upgrade(),
            Slot::Vacant => None,
        }
    }
}
