//! seqload - asynchronous image acquisition and caching for sequence viewers
//!
//! Re-exports all modules for use by the binary target.

// Core engine (cache, events, worker, watcher, pipeline context)
pub mod core;

// Decoders and collections
pub mod entities;

pub mod cli;
pub mod config;
pub mod error;

pub use config::PipelineConfig;
pub use core::event_bus::{downcast_event, BoxedEvent, EventBus, EventEmitter};
pub use core::pipeline::Pipeline;
pub use entities::{CacheKey, Collection, FrameHandle, Image, ProviderState};
pub use error::PipelineError;
