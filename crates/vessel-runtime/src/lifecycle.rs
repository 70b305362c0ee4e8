//! Instance lifecycle states

use std::fmt;

/// Lifecycle of a [`Vessel`](crate::Vessel)
///
/// States only ever move forward; the derived ordering follows that
/// progression, so "at least loaded" is `state >= ModuleLoaded`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    /// Allocated, runtime not built yet
    Uninitialized = 0,
    /// Runtime built, calling thread registered
    Created = 1,
    /// Bytecode accepted (decoded and verified) but not linked
    Initialized = 2,
    /// Module linked and statics initialised
    ModuleLoaded = 3,
    /// Entry point has run
    EntryRan = 4,
    /// Torn down; every operation now fails
    Destroyed = 5,
}

impl LifecycleState {
    /// Whether the runtime exists (created and not destroyed)
    pub fn is_live(self) -> bool {
        self >= LifecycleState::Created && self != LifecycleState::Destroyed
    }

    /// Whether a module is linked and callable
    pub fn has_module(self) -> bool {
        matches!(self, LifecycleState::ModuleLoaded | LifecycleState::EntryRan)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Created => "created",
            LifecycleState::Initialized => "initialized",
            LifecycleState::ModuleLoaded => "module-loaded",
            LifecycleState::EntryRan => "entry-ran",
            LifecycleState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_follows_progression() {
        assert!(LifecycleState::Uninitialized < LifecycleState::Created);
        assert!(LifecycleState::ModuleLoaded < LifecycleState::EntryRan);
        assert!(LifecycleState::EntryRan < LifecycleState::Destroyed);
    }

    #[test]
    fn test_predicates() {
        assert!(!LifecycleState::Uninitialized.is_live());
        assert!(LifecycleState::Initialized.is_live());
        assert!(!LifecycleState::Destroyed.is_live());
        assert!(!LifecycleState::Initialized.has_module());
        assert!(LifecycleState::EntryRan.has_module());
    }
}
