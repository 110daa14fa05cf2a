//! File watching for source invalidation.
//!
//! Wraps a `notify` watcher: each watched file is registered non-recursively,
//! and every modify/create/remove event for it calls the supplied handler on
//! notify's own thread.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, trace, warn};
use notify::{EventKind, RecursiveMode, Watcher as _};

use crate::error::PipelineError;

/// Watches individual source files
pub struct FileWatcher {
    watcher: Mutex<notify::RecommendedWatcher>,
    watched: Mutex<HashSet<PathBuf>>,
}

impl FileWatcher {
    /// Create a watcher calling `on_change` for every changed path
    pub fn new<F>(on_change: F) -> Result<Self, PipelineError>
    where
        F: Fn(&Path) + Send + 'static,
    {
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        for path in &event.paths {
                            trace!("File event {:?} on {}", event.kind, path.display());
                            on_change(path);
                        }
                    }
                }
                Err(err) => warn!("File watcher error: {}", err),
            }
        })
        .map_err(|e| PipelineError::Watch(e.to_string()))?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            watched: Mutex::new(HashSet::new()),
        })
    }

    /// Start watching `path` (already-watched paths are skipped)
    pub fn watch(&self, path: &Path) -> Result<(), PipelineError> {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        if watched.contains(path) {
            return Ok(());
        }
        self.watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| PipelineError::Watch(format!("{}: {}", path.display(), e)))?;
        watched.insert(path.to_path_buf());
        debug!("Watching {}", path.display());
        Ok(())
    }

    pub fn unwatch(&self, path: &Path) {
        let mut watched = self.watched.lock().unwrap_or_else(|e| e.into_inner());
        if watched.remove(path) {
            if let Err(e) = self
                .watcher
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .unwatch(path)
            {
                warn!("Cannot unwatch {}: {}", path.display(), e);
            }
        }
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }
}
