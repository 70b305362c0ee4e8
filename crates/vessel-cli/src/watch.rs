//! File watching for `vessel run --watch`
//!
//! Uses the `notify` crate (v7). Events are queued on an mpsc channel and
//! drained once per frame, so a burst of writes triggers one reload check.

use anyhow::Context;
use notify::{recommended_watcher, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Watches the directory holding a bytecode file
pub struct ModuleWatcher {
    /// Kept alive to receive events
    _watcher: notify::RecommendedWatcher,
    receiver: mpsc::Receiver<notify::Result<notify::Event>>,
    file_name: Option<std::ffi::OsString>,
}

impl ModuleWatcher {
    /// Start watching `file`
    ///
    /// The parent directory is watched rather than the file, since editors
    /// and build tools often replace files instead of writing in place.
    pub fn new(file: &Path) -> anyhow::Result<Self> {
        let dir = match file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let (tx, rx) = mpsc::channel();
        let mut watcher = recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .context("failed to create file watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch '{}'", dir.display()))?;
        tracing::debug!(dir = %dir.display(), "watching for bytecode changes");

        Ok(Self {
            _watcher: watcher,
            receiver: rx,
            file_name: file.file_name().map(|n| n.to_os_string()),
        })
    }

    /// Whether the file was touched since the last call
    pub fn changed(&self) -> bool {
        let mut changed = false;
        while let Ok(res) = self.receiver.try_recv() {
            match res {
                Ok(event) => changed |= self.concerns_module(&event),
                Err(e) => tracing::warn!(error = %e, "file watcher error"),
            }
        }
        changed
    }

    fn concerns_module(&self, event: &notify::Event) -> bool {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return false;
        }
        event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n.to_os_string()) == self.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_detects_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("game.vbc");
        std::fs::write(&file, b"v1").unwrap();

        let watcher = ModuleWatcher::new(&file).unwrap();
        assert!(!watcher.changed());
        std::fs::write(dir.path().join("other.txt"), b"x").unwrap();
        std::fs::write(&file, b"v2").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while !seen && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            seen = watcher.changed();
        }
        assert!(seen);
    }
}
