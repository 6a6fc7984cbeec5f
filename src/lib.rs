//! Webpage and media proxying engine for the feed reader's sandboxed
//! viewer. Pages and their sub-resources are fetched server-side, every
//! external reference is rewritten to route back through this proxy, and
//! media is cached on disk with age/size-bounded eviction.

pub mod cache;
pub mod codec;
pub mod css;
pub mod error;
pub mod fetcher;
pub mod mime;
pub mod proxy;
pub mod rewrite;
pub mod settings;

use cache::MediaCache;
use fetcher::MediaFetcher;
use settings::SharedSettings;
use std::sync::Arc;

/// Shared state for the proxy endpoints. The cache owns the only mutable
/// resource (its on-disk store); rewriting is pure and request-scoped.
#[derive(Clone)]
pub struct AppState {
    pub settings: SharedSettings,
    pub cache: Arc<MediaCache>,
    pub fetcher: MediaFetcher,
}

impl AppState {
    pub fn new(settings: SharedSettings, cache: MediaCache) -> Self {
        AppState {
            fetcher: MediaFetcher::new(settings.clone()),
            cache: Arc::new(cache),
            settings,
        }
    }
}
