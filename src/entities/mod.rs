//! Entities module - images, decoders and collections
//!
//! Everything here is independent of threads and caching policy:
//! - `provider`: stepwise decode state shared through the cache
//! - `loader`, `vpp`, `npy`, `edit`: decoder families
//! - `collection`: index-addressed frame sequences
//! - `traits`: the cache interface collections rely on

pub mod collection;
pub mod edit;
pub mod image;
pub mod loader;
pub mod npy;
pub mod provider;
pub mod traits;
pub mod vpp;

pub use collection::{build_from_filenames, Collection, CollectionSource, StaleFlag};
pub use edit::EditProgram;
pub use image::Image;
pub use provider::{CacheKey, Decoder, FrameHandle, FrameResult, Provider, ProviderState, SharedProvider, Step};
pub use traits::ProviderCache;
