//! Core engine modules - cache, events, worker, watcher
//!
//! These modules schedule and share decode work; what gets decoded lives in `entities`.

pub mod cache;
pub mod event_bus;
pub mod events;
pub mod pipeline;
pub mod watcher;
pub mod workers;

// Re-exports for convenience
pub use cache::{CacheStats, FrameCache};
pub use event_bus::{downcast_event, BoxedEvent, EventBus, EventEmitter};
pub use pipeline::Pipeline;
pub use watcher::FileWatcher;
pub use workers::{IdleMode, LoadQueue, Tick, Workers};
