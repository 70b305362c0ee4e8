//! Host native functions
//!
//! Hosts register callbacks by name in a [`NativeRegistry`]. When a module is
//! linked, each name in its native import table is resolved to a handler,
//! so dispatch at run time is an indexed call with no hash lookup.

use super::value::HostValue;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Host callback invoked by `CALL_NATIVE`
///
/// Arguments and return value are host-owned copies. Returning `Err` raises
/// an exception in the calling bytecode.
pub type NativeFn = Arc<dyn Fn(&[HostValue]) -> Result<HostValue, String> + Send + Sync>;

/// Name → handler table maintained by the host
#[derive(Clone, Default)]
pub struct NativeRegistry {
    handlers: FxHashMap<String, NativeFn>,
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRegistry")
            .field("count", &self.handlers.len())
            .finish()
    }
}

impl NativeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a handler
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[HostValue]) -> Result<HostValue, String> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(handler));
    }

    /// Register or replace an already boxed handler
    pub fn insert(&mut self, name: &str, handler: NativeFn) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.handlers.get(name).cloned()
    }

    /// Whether a handler is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Resolved native table for a linked module
#[derive(Clone)]
pub struct ResolvedNatives {
    names: Vec<String>,
    handlers: Vec<NativeFn>,
}

impl std::fmt::Debug for ResolvedNatives {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedNatives")
            .field("names", &self.names)
            .finish()
    }
}

impl ResolvedNatives {
    /// Resolve every import against the registry
    ///
    /// Returns the first name that has no handler.
    pub fn link(imports: &[String], registry: &NativeRegistry) -> Result<Self, String> {
        let mut handlers = Vec::with_capacity(imports.len());
        for name in imports {
            match registry.get(name) {
                Some(handler) => handlers.push(handler),
                None => return Err(name.clone()),
            }
        }
        Ok(Self {
            names: imports.to_vec(),
            handlers,
        })
    }

    /// Rebind an import after the host replaced its handler
    pub fn rebind(&mut self, name: &str, handler: &NativeFn) {
        for (slot, import) in self.handlers.iter_mut().zip(&self.names) {
            if import == name {
                *slot = handler.clone();
            }
        }
    }

    /// Handler and name for an import index
    pub fn get(&self, index: u16) -> Option<(&str, &NativeFn)> {
        let idx = index as usize;
        Some((self.names.get(idx)?.as_str(), self.handlers.get(idx)?))
    }

    /// Number of imports
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the module imports nothing
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
