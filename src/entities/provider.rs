//! Decoder providers: shared, stepwise decode state per cache key.
//!
//! **Why**: The UI polls "is it ready yet" while a single background worker
//! advances decodes one bounded step at a time. A provider is the unit both
//! sides share: the worker is its only writer, everyone else reads snapshots.
//!
//! # State machine
//!
//! `NotStarted → InProgress(p) → Done | Failed`, monotonic. Once complete, the
//! decoder is dropped (file handles, child providers) and further `advance()`
//! calls are no-ops. Invalidation never resurrects a provider: the cache
//! forgets it and builds a fresh one on the next request.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::edit::EditDecoder;
use super::image::Image;
use super::loader::{self, StillDecoder};
use super::npy::NpyDecoder;
use super::vpp::VppDecoder;

/// Provider shared between the cache, the worker queue and consumers
pub type SharedProvider = Arc<Provider>;

/// Outcome of a completed decode: the image, or a human-readable error
pub type FrameResult = Result<Arc<Image>, String>;

/// Logical identity of a decoded frame.
///
/// File keys name a source file and a frame inside it; edit keys name an
/// expression and the keys of the frames it combines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    File { path: Arc<Path>, frame: usize },
    Edit { program: Arc<str>, inputs: Vec<CacheKey> },
}

impl CacheKey {
    pub fn file(path: impl Into<Arc<Path>>, frame: usize) -> Self {
        CacheKey::File {
            path: path.into(),
            frame,
        }
    }

    /// True if this key was derived (directly or through an edit) from `path`
    pub fn depends_on(&self, path: &Path) -> bool {
        match self {
            CacheKey::File { path: p, .. } => p.as_ref() == path,
            CacheKey::Edit { inputs, .. } => inputs.iter().any(|k| k.depends_on(path)),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::File { path, frame } => write!(f, "{}:{}", path.display(), frame),
            CacheKey::Edit { program, inputs } => {
                write!(f, "edit[{}](", program)?;
                for (i, k) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", k)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Provider loading status
#[derive(Debug, Clone)]
pub enum ProviderState {
    NotStarted,
    InProgress(f32),
    Done(Arc<Image>),
    Failed(String),
}

impl ProviderState {
    pub fn is_complete(&self) -> bool {
        matches!(self, ProviderState::Done(_) | ProviderState::Failed(_))
    }

    pub fn progress(&self) -> f32 {
        match self {
            ProviderState::NotStarted => 0.0,
            ProviderState::InProgress(p) => *p,
            ProviderState::Done(_) | ProviderState::Failed(_) => 1.0,
        }
    }
}

/// Result of one bounded unit of decode work
#[derive(Debug)]
pub enum Step {
    Progress(f32),
    Done(Image),
    Failed(String),
}

/// Closed set of decoder families
pub enum Decoder {
    /// Source not yet sniffed; selection runs on the first step (worker side)
    Sniff { path: PathBuf, force_generic: bool },
    Still(StillDecoder),
    #[cfg(feature = "raw")]
    Raw(loader::RawDecoder),
    #[cfg(feature = "openexr")]
    Exr(loader::ExrDecoder),
    Vpp(VppDecoder),
    Npy(NpyDecoder),
    Edit(EditDecoder),
    /// Decode finished, resources released
    Spent,
    /// Caller-supplied steps, for exercising the worker in tests
    #[cfg(test)]
    Scripted(Box<dyn FnMut() -> Step + Send>),
}

impl Decoder {
    /// Perform one bounded unit of work
    pub fn step(&mut self) -> Step {
        match self {
            Decoder::Sniff {
                path,
                force_generic,
            } => {
                let selected = loader::select_decoder(path, *force_generic);
                *self = selected;
                self.step()
            }
            Decoder::Still(d) => d.step(),
            #[cfg(feature = "raw")]
            Decoder::Raw(d) => d.step(),
            #[cfg(feature = "openexr")]
            Decoder::Exr(d) => d.step(),
            Decoder::Vpp(d) => d.step(),
            Decoder::Npy(d) => d.step(),
            Decoder::Edit(d) => d.step(),
            Decoder::Spent => Step::Failed("decoder already finished".into()),
            #[cfg(test)]
            Decoder::Scripted(f) => f(),
        }
    }

    /// Short name of the decoder family (for logs and tests)
    pub fn kind(&self) -> &'static str {
        match self {
            Decoder::Sniff { .. } => "sniff",
            Decoder::Still(d) => d.format().name(),
            #[cfg(feature = "raw")]
            Decoder::Raw(_) => "raw",
            #[cfg(feature = "openexr")]
            Decoder::Exr(_) => "openexr",
            Decoder::Vpp(_) => "vpp",
            Decoder::Npy(_) => "npy",
            Decoder::Edit(_) => "edit",
            Decoder::Spent => "spent",
            #[cfg(test)]
            Decoder::Scripted(_) => "scripted",
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decoder({})", self.kind())
    }
}

/// Stepwise decode of one cache key
pub struct Provider {
    key: CacheKey,
    decoder: Mutex<Decoder>,
    state: Mutex<ProviderState>,
}

impl Provider {
    pub fn new(key: CacheKey, decoder: Decoder) -> Self {
        Self {
            key,
            decoder: Mutex::new(decoder),
            state: Mutex::new(ProviderState::NotStarted),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Advance the decode by one step.
    ///
    /// Returns the state after the step. No-op once complete.
    pub fn advance(&self) -> ProviderState {
        if self.is_complete() {
            return self.state();
        }

        let mut decoder = self.decoder.lock().unwrap_or_else(|e| e.into_inner());
        // A panicking codec fails this frame only, never the worker
        let step = panic::catch_unwind(AssertUnwindSafe(|| decoder.step())).unwrap_or_else(|payload| {
            Step::Failed(format!("decoder panicked: {}", panic_message(payload.as_ref())))
        });
        let next = match step {
            Step::Progress(p) => {
                let prev = self.progress();
                ProviderState::InProgress(p.clamp(0.0, 1.0).max(prev))
            }
            Step::Done(image) => {
                *decoder = Decoder::Spent;
                ProviderState::Done(Arc::new(image.into_cached()))
            }
            Step::Failed(msg) => {
                log::error!("Decode failed for {}: {}", self.key, msg);
                *decoder = Decoder::Spent;
                ProviderState::Failed(msg)
            }
        };
        drop(decoder);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = next.clone();
        next
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ProviderState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn progress(&self) -> f32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).progress()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).is_complete()
    }

    /// Image or error once complete, None while loading
    pub fn result(&self) -> Option<FrameResult> {
        match self.state() {
            ProviderState::Done(img) => Some(Ok(img)),
            ProviderState::Failed(msg) => Some(Err(msg)),
            _ => None,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Consumer-side view of a requested frame.
///
/// Never blocks: a frame that is not ready reports "loading".
#[derive(Debug, Clone)]
pub struct FrameHandle {
    provider: SharedProvider,
}

impl FrameHandle {
    pub fn new(provider: SharedProvider) -> Self {
        Self { provider }
    }

    pub fn key(&self) -> &CacheKey {
        self.provider.key()
    }

    pub fn provider(&self) -> &SharedProvider {
        &self.provider
    }

    pub fn is_complete(&self) -> bool {
        self.provider.is_complete()
    }

    pub fn progress(&self) -> f32 {
        self.provider.progress()
    }

    pub fn result(&self) -> Option<FrameResult> {
        self.provider.result()
    }

    /// Decoded image, if the frame finished successfully
    pub fn image(&self) -> Option<Arc<Image>> {
        self.result().and_then(Result::ok)
    }

    /// Short status for titles: "WxHxC", "is loading (42%)" or "cannot be loaded: ..."
    pub fn status_label(&self) -> String {
        match self.provider.state() {
            ProviderState::NotStarted => "is loading".to_string(),
            ProviderState::InProgress(p) => format!("is loading ({}%)", (p * 100.0) as u32),
            ProviderState::Done(img) => {
                format!("{}x{}x{}", img.width(), img.height(), img.channels())
            }
            ProviderState::Failed(msg) => format!("cannot be loaded: {}", msg),
        }
    }
}
