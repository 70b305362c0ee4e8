//! Hot reload manager
//!
//! Replaces the running module with new bytecode while the heap stays put.
//! The engine builds the new image aside and swaps only if it is compatible,
//! so a failed reload leaves the previous module fully callable.

use crate::error::{VesselError, VesselResult};
use crate::lifecycle::LifecycleState;
use crate::Vessel;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use vessel_engine::bytecode::load_module;
use vessel_engine::{ExecutionMode, VmError};

pub use vessel_engine::PatchReport as ReloadReport;

/// Called with the outcome of every reload attempt
pub type ReloadCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Modification signature of a bytecode file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileSignature {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileSignature {
    /// Signature of `path`, `None` if it cannot be read
    pub(crate) fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        Some(Self {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

impl Vessel {
    /// Enable or disable hot reload
    ///
    /// Must be configured before the entry point runs; afterwards this fails
    /// with `RequiresPriorEntry` instead of silently ignoring the request.
    pub fn enable_hot_reload(&self, enable: bool) -> VesselResult<()> {
        self.tracked(|| {
            let mut core = self.inner.core.lock();
            match core.state {
                LifecycleState::Destroyed => {
                    Err(VesselError::NotInitialized("instance destroyed".to_string()))
                }
                LifecycleState::EntryRan => Err(VesselError::RequiresPriorEntry(
                    "hot reload must be configured before the entry point runs".to_string(),
                )),
                _ => {
                    core.hot_reload = enable;
                    tracing::debug!(enable, "hot reload configured");
                    Ok(())
                }
            }
        })
    }

    /// Whether hot reload is enabled
    pub fn is_hot_reload_enabled(&self) -> bool {
        self.inner.core.lock().hot_reload
    }

    /// Set (or clear) the callback told about every reload attempt
    pub fn set_reload_callback<F>(&self, callback: Option<F>)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self.inner.reload_callback.lock() = callback.map(|f| Arc::new(f) as ReloadCallback);
    }

    /// Reload from a bytecode file
    pub fn reload_from_file(&self, path: impl AsRef<Path>) -> VesselResult<ReloadReport> {
        let path = path.as_ref().to_path_buf();
        self.reload_with(|| {
            let bytes = std::fs::read(&path).map_err(|e| VesselError::FileNotFound {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            Ok((bytes, Some(path.clone())))
        })
    }

    /// Reload from bytecode in memory
    pub fn reload_from_memory(&self, bytes: &[u8]) -> VesselResult<ReloadReport> {
        self.reload_with(|| Ok((bytes.to_vec(), None)))
    }

    /// Reload the file the module was originally loaded from
    pub fn reload_current(&self) -> VesselResult<ReloadReport> {
        let path = self.inner.core.lock().loaded_file.clone();
        match path {
            Some(path) => self.reload_from_file(path),
            None => self.tracked(|| {
                Err(VesselError::InvalidArgument(
                    "the module was not loaded from a file".to_string(),
                ))
            }),
        }
    }

    /// Reload if the originally loaded file changed on disk
    ///
    /// Compares the file's modification time and length with the last
    /// load. Returns whether a reload happened; does nothing when hot
    /// reload is disabled or the module came from memory.
    pub fn check_reload(&self) -> VesselResult<bool> {
        let (path, previous) = {
            let core = self.inner.core.lock();
            if !core.hot_reload || core.state != LifecycleState::EntryRan {
                return Ok(false);
            }
            match &core.loaded_file {
                Some(path) => (path.clone(), core.signature),
                None => return Ok(false),
            }
        };
        let current = FileSignature::of(&path);
        if current.is_none() || current == previous {
            return Ok(false);
        }
        // Remember the new signature even if the reload fails, so a broken
        // file is reported once rather than on every poll
        self.inner.core.lock().signature = current;
        tracing::info!(path = %path.display(), "bytecode changed on disk");
        self.reload_from_file(&path).map(|_| true)
    }

    fn reload_with(
        &self,
        source: impl FnOnce() -> VesselResult<(Vec<u8>, Option<PathBuf>)>,
    ) -> VesselResult<ReloadReport> {
        let result = self.tracked(|| {
            {
                let core = self.inner.core.lock();
                if !core.state.is_live() {
                    return Err(VesselError::NotInitialized("instance not initialized".to_string()));
                }
            }
            let outcome = self.try_reload(source);
            let callback = self.inner.reload_callback.lock().clone();
            if let Some(callback) = callback {
                callback(outcome.is_ok());
            }
            outcome
        });
        match &result {
            Ok(report) => tracing::info!(
                changed = report.changed,
                functions_changed = report.functions_changed,
                statics_preserved = report.statics_preserved,
                "module reloaded"
            ),
            Err(e) => tracing::warn!(error = %e, "reload failed"),
        }
        result
    }

    fn try_reload(
        &self,
        source: impl FnOnce() -> VesselResult<(Vec<u8>, Option<PathBuf>)>,
    ) -> VesselResult<ReloadReport> {
        {
            let core = self.inner.core.lock();
            if !core.hot_reload {
                return Err(VesselError::ReloadNotEnabled);
            }
            if core.state != LifecycleState::EntryRan {
                return Err(VesselError::RequiresPriorEntry(
                    "reload requires the entry point to have run".to_string(),
                ));
            }
        }
        if self.inner.config.vm_options().execution_mode == ExecutionMode::Static {
            return Err(VesselError::ReloadNotSupported);
        }

        let (bytes, path) = source()?;
        let module = load_module(&bytes)
            .map_err(|e| VesselError::ReloadFailed(format!("invalid bytecode: {e}")))?;
        let report = self.with_loaded_vm(|vm| {
            vm.patch(module).map_err(|e| match e {
                VmError::PatchUnsupported => VesselError::ReloadNotSupported,
                VmError::PatchRejected(reason) => VesselError::ReloadFailed(reason),
                other => VesselError::ReloadFailed(other.to_string()),
            })
        })?;

        if let Some(path) = path {
            let signature = FileSignature::of(&path);
            let mut core = self.inner.core.lock();
            core.loaded_file = Some(path);
            core.signature = signature;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_tracks_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.vbc");
        assert_eq!(FileSignature::of(&path), None);

        std::fs::write(&path, b"abc").unwrap();
        let first = FileSignature::of(&path).unwrap();
        std::fs::write(&path, b"abcdef").unwrap();
        let second = FileSignature::of(&path).unwrap();
        assert_ne!(first, second);
    }
}
