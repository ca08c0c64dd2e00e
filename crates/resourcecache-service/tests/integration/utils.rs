use std::sync::Arc;
use std::time::Duration;

use resourcecache_service::ResourceCache;
use resourcecache_service::config::Config;
use resourcecache_service::watch::{GroupVersionResource, MemoryWatchProvider};

pub fn pods() -> GroupVersionResource {
    GroupVersionResource::new("", "v1", "pods")
}

/// Creates a cache over an in-memory cluster, applying `update` to the default config.
pub fn setup_cache(update: impl FnOnce(&mut Config)) -> (ResourceCache, MemoryWatchProvider) {
    resourcecache_test::setup();

    let mut config = Config::default();
    config.watch.sync_timeout = Duration::from_secs(2);
    config.watch.resync_period = Duration::from_millis(50);
    update(&mut config);

    let provider = MemoryWatchProvider::new(config.watch.resync_period);
    let cache = ResourceCache::new(&config, Arc::new(provider.clone()));
    (cache, provider)
}
