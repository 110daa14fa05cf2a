//! Pipeline context: the one owner of cache, worker, event bus and watcher.
//!
//! Created at startup, torn down on drop (or `shutdown()`), flushable on
//! demand. Every collection is built through it so its source files get
//! watched, and every frame request goes through its cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::unbounded;
use log::{debug, info, warn};

use super::cache::{CacheStats, FrameCache};
use super::event_bus::EventBus;
use super::events::{RedrawRequestedEvent, SourceChangedEvent};
use super::watcher::FileWatcher;
use super::workers::{LoadQueue, Workers};
use crate::config::PipelineConfig;
use crate::entities::loader::is_stdin;
use crate::entities::{build_from_filenames, Collection, EditProgram, FrameHandle};
use crate::error::PipelineError;

/// A collection source as remembered for change notifications
#[derive(Clone)]
struct WatchedSource {
    /// Path as the collection spelled it (the cache key path)
    origin: Arc<Path>,
    stale: Weak<AtomicBool>,
}

/// State reachable from the watcher thread
struct Shared {
    cache: FrameCache,
    events: EventBus,
    /// Canonical path → sources registered under it
    sources: Mutex<HashMap<PathBuf, Vec<WatchedSource>>>,
}

impl Shared {
    fn source_changed(&self, path: &Path) {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let watched = {
            let sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
            sources
                .get(&canonical)
                .or_else(|| sources.get(path))
                .cloned()
                .unwrap_or_default()
        };

        let mut evicted = self.cache.invalidate_source(path);
        if canonical != path {
            evicted += self.cache.invalidate_source(&canonical);
        }
        for source in &watched {
            if source.origin.as_ref() != path && source.origin.as_ref() != canonical {
                evicted += self.cache.invalidate_source(&source.origin);
            }
            if let Some(flag) = source.stale.upgrade() {
                flag.store(true, Ordering::Release);
            }
        }
        info!("{} changed: {} cached frame(s) invalidated", path.display(), evicted);

        self.events.emit(SourceChangedEvent { path: canonical });
        self.events.emit(RedrawRequestedEvent);
    }
}

/// Explicitly owned pipeline context
pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Workers,
    watcher: Option<FileWatcher>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Start the worker thread (and file watcher, if enabled)
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            cache: FrameCache::new(tx, config.cache_capacity),
            events: EventBus::new(),
            sources: Mutex::new(HashMap::new()),
        });

        let queue = LoadQueue::new(rx, Some(shared.events.emitter()));
        let workers =
            Workers::spawn(queue, config.idle()).map_err(|e| PipelineError::Spawn(e.to_string()))?;

        let watcher = if config.watch_files {
            let weak = Arc::downgrade(&shared);
            match FileWatcher::new(move |path| {
                if let Some(shared) = weak.upgrade() {
                    shared.source_changed(path);
                }
            }) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!("{}; continuing without file watching", e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Pipeline started: idle={:?}, capacity={}, watch={}",
            config.idle(),
            config.cache_capacity,
            watcher.is_some()
        );
        Ok(Self {
            shared,
            workers,
            watcher,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &FrameCache {
        &self.shared.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn stats(&self) -> &CacheStats {
        self.shared.cache.stats()
    }

    /// Build a collection from resolved filenames and watch its sources
    pub fn build_collection(&self, paths: &[PathBuf]) -> Result<Arc<Collection>, PipelineError> {
        let collection = Arc::new(build_from_filenames(paths, self.config.force_generic)?);
        self.register(&collection);
        debug!("Collection built: {} file(s), {} frame(s)", paths.len(), collection.len());
        Ok(collection)
    }

    /// Combine sibling collections with an edit expression
    pub fn edit(&self, inputs: Vec<Arc<Collection>>, expr: &str) -> Result<Arc<Collection>, PipelineError> {
        let program = EditProgram::parse(expr)?;
        Ok(Arc::new(Collection::edited(inputs, program)?))
    }

    /// Hide one frame of a collection
    pub fn remove_frame(&self, collection: &Arc<Collection>, index: usize) -> Result<Arc<Collection>, PipelineError> {
        Ok(Arc::new(Collection::masked(Arc::clone(collection), index)?))
    }

    /// Request a frame; never blocks on decoding
    pub fn frame(&self, collection: &Collection, index: usize) -> Result<FrameHandle, PipelineError> {
        collection.frame(index, &self.shared.cache)
    }

    /// Change notification entry point (also called by the internal watcher)
    pub fn on_file_changed(&self, path: &Path) {
        self.shared.source_changed(path);
    }

    /// Drop every cached provider
    pub fn flush(&self) {
        self.shared.cache.flush_all();
        self.shared.events.emit(RedrawRequestedEvent);
    }

    /// Stop the worker; called by Drop as well
    pub fn shutdown(&mut self) {
        self.watcher = None;
        self.workers.shutdown();
        debug!(
            "Pipeline stopped: {} hits, {} misses, {} evictions",
            self.stats().hits(),
            self.stats().misses(),
            self.stats().evictions()
        );
    }

    fn register(&self, collection: &Collection) {
        let mut sources = self.shared.sources.lock().unwrap_or_else(|e| e.into_inner());
        for source in collection.sources() {
            if is_stdin(&source.path) {
                continue;
            }
            let canonical = fs::canonicalize(&source.path).unwrap_or_else(|_| source.path.to_path_buf());
            let entry = sources.entry(canonical.clone()).or_default();
            entry.retain(|s| s.stale.strong_count() > 0);
            entry.push(WatchedSource {
                origin: source.path.clone(),
                stale: Arc::downgrade(&source.stale),
            });

            if let Some(watcher) = &self.watcher {
                if let Err(e) = watcher.watch(&canonical) {
                    warn!("{}", e);
                }
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdleStrategy;
    use crate::core::event_bus::downcast_event;
    use crate::entities::vpp::tests::write_vpp;
    use image::{Rgb, RgbImage};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn pipeline(idle_mode: IdleStrategy) -> Pipeline {
        Pipeline::new(PipelineConfig {
            idle_mode,
            poll_interval_ms: 1,
            watch_files: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn wait(handle: &FrameHandle) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !handle.is_complete() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_complete(), "frame {} never completed", handle.key());
    }

    #[test]
    fn test_still_image_end_to_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.png");
        RgbImage::from_pixel(5, 4, Rgb([1, 2, 3])).save(&path).unwrap();

        let p = pipeline(IdleStrategy::Wait);
        let c = p.build_collection(&[path]).unwrap();
        assert_eq!(c.len(), 1);
        let handle = p.frame(&c, 0).unwrap();
        wait(&handle);
        assert_eq!(handle.status_label(), "5x4x3");
        assert!(handle.image().unwrap().is_cached());
    }

    #[test]
    fn test_out_of_range_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.vpp");
        write_vpp(&path, 2, 2, 1, 3, 0);
        let p = pipeline(IdleStrategy::Poll);
        let c = p.build_collection(&[path]).unwrap();
        assert!(matches!(
            p.frame(&c, 3),
            Err(PipelineError::OutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_file_change_invalidates_and_marks_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.vpp");
        write_vpp(&path, 2, 2, 1, 3, 0);

        let p = pipeline(IdleStrategy::Wait);
        let c = p.build_collection(&[path.clone()]).unwrap();
        let first = p.frame(&c, 1).unwrap();
        wait(&first);
        assert!(p.cache().contains(first.key()));
        assert!(!c.is_stale());
        p.events().poll();

        p.on_file_changed(&path);

        assert!(!p.cache().contains(first.key()));
        assert!(c.is_stale());
        let again = p.frame(&c, 1).unwrap();
        assert!(!Arc::ptr_eq(first.provider(), again.provider()));
        // Detached provider keeps its result for the old holder
        assert!(first.image().is_some());

        let events = p.events().poll();
        assert!(events.iter().any(|e| downcast_event::<SourceChangedEvent>(e).is_some()));
        assert!(events.iter().any(|e| downcast_event::<RedrawRequestedEvent>(e).is_some()));
    }

    #[test]
    fn test_edit_through_pipeline() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.vpp");
        let b = dir.path().join("b.vpp");
        write_vpp(&a, 2, 2, 1, 3, 0);
        write_vpp(&b, 2, 2, 1, 3, 0);

        let p = pipeline(IdleStrategy::Poll);
        let ca = p.build_collection(&[a.clone()]).unwrap();
        let cb = p.build_collection(&[b]).unwrap();
        let edited = p.edit(vec![ca, cb], "x y + 2 /").unwrap();
        let handle = p.frame(&edited, 2).unwrap();
        wait(&handle);
        assert_eq!(handle.image().unwrap().pixels(), &[2.0; 4]);

        // Changing one input drops the edit result too
        p.on_file_changed(&a);
        assert!(!p.cache().contains(handle.key()));
        assert!(edited.is_stale());
    }

    #[test]
    fn test_remove_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.vpp");
        write_vpp(&path, 1, 1, 1, 2, 0);
        let p = pipeline(IdleStrategy::Poll);
        let c = p.build_collection(&[path]).unwrap();
        let masked = p.remove_frame(&c, 0).unwrap();
        assert_eq!(masked.len(), 1);
        assert!(matches!(p.remove_frame(&masked, 0), Err(PipelineError::LastFrame)));
    }

    #[test]
    fn test_flush_and_shutdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("v.vpp");
        write_vpp(&path, 1, 1, 1, 4, 0);
        let mut p = pipeline(IdleStrategy::Wait);
        let c = p.build_collection(&[path]).unwrap();
        for i in 0..4 {
            p.frame(&c, i).unwrap();
        }
        assert_eq!(p.cache().len(), 4);
        p.flush();
        assert!(p.cache().is_empty());
        p.shutdown();
        p.shutdown();
    }
}
