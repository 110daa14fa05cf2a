//! Pipeline events: emitted on provider transitions and file changes.
//!
//! These replace polling for "is anyone still waiting on this frame": the
//! worker announces state changes and the foreground decides what to redraw.

use std::path::PathBuf;

use crate::entities::CacheKey;

/// Decode progress crossed a whole percent
#[derive(Clone, Debug)]
pub struct FrameProgressEvent {
    pub key: CacheKey,
    pub progress: f32,
}

/// Provider reached `Done` (ok) or `Failed` (!ok)
#[derive(Clone, Debug)]
pub struct FrameReadyEvent {
    pub key: CacheKey,
    pub ok: bool,
}

/// A watched source file changed; collections built from it are stale
#[derive(Clone, Debug)]
pub struct SourceChangedEvent {
    pub path: PathBuf,
}

/// Something visible changed
#[derive(Clone, Debug)]
pub struct RedrawRequestedEvent;
