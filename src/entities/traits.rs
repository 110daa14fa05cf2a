//! Abstract traits for dependency inversion.
//!
//! Collections need a deduplicating provider store but must not know the
//! concrete cache, so `core` depends on `entities` and not the reverse.
//!
//! Implementation lives in `core/cache.rs`.

use std::sync::Arc;

use super::provider::{CacheKey, Decoder, SharedProvider};

/// Boxed provider constructor, invoked at most once per live key
pub type DecoderFactory<'a> = Box<dyn FnOnce() -> Decoder + 'a>;

/// Abstract provider store.
///
/// `provider` returns the live provider for `key`, or registers (and
/// schedules) a new one built by `factory`.
pub trait ProviderCache: Send + Sync {
    fn provider(&self, key: CacheKey, factory: DecoderFactory<'_>) -> SharedProvider;
}

/// Blanket impl: Arc<T> implements the trait if T does
impl<T: ProviderCache + ?Sized> ProviderCache for Arc<T> {
    fn provider(&self, key: CacheKey, factory: DecoderFactory<'_>) -> SharedProvider {
        (**self).provider(key, factory)
    }
}
