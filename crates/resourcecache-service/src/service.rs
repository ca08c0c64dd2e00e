//! The [`ResourceCache`] facade.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::caching::{CacheEntry, CacheError, CacheKey, CacheStore, SourceId};
use crate::config::{Config, ExternalConfig, WatchConfig};
use crate::external::PollSource;
use crate::utils::tasks::ActiveTasks;
use crate::watch::{GroupVersionResource, ResourceLister, WatchProvider, WatchSource};

/// How long [`ResourceCache::shutdown`] waits for background tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Hands out resource listers and external data, constructing each source once per key.
///
/// All methods can be called concurrently. Requests for a key that is being constructed wait
/// for that construction instead of starting another one.
#[derive(Debug)]
pub struct ResourceCache {
    store: CacheStore<CacheEntry>,
    provider: Arc<dyn WatchProvider>,
    watch_config: WatchConfig,
    external_config: ExternalConfig,
    tasks: ActiveTasks,
}

impl ResourceCache {
    pub fn new(config: &Config, provider: Arc<dyn WatchProvider>) -> Self {
        Self {
            store: CacheStore::new("sources", &config.caches),
            provider,
            watch_config: config.watch,
            external_config: config.external,
            tasks: ActiveTasks::default(),
        }
    }

    /// Returns a lister for `resource` in `namespace`, where an empty namespace means all
    /// namespaces.
    ///
    /// The first request for a key starts a watch and waits for it to synchronize.
    pub async fn get_lister(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
    ) -> Result<ResourceLister, CacheError> {
        let key = CacheKey::for_resource(resource, namespace);
        let entry = self
            .store
            .get_or_try_insert_with(key.clone(), async {
                let source = WatchSource::start(
                    self.provider.as_ref(),
                    resource,
                    namespace,
                    &self.watch_config,
                    &self.tasks,
                )
                .await?;
                Ok(CacheEntry::Watch(source))
            })
            .await?;

        match entry {
            CacheEntry::Watch(source) if !source.is_cancelled() => {
                Ok(ResourceLister::new(source))
            }
            // torn down while we were waiting for it
            CacheEntry::Watch(source) => {
                self.discard(&key, source.id()).await;
                Err(CacheError::Cancelled)
            }
            CacheEntry::Poll(_) => Err(CacheError::InternalError),
        }
    }

    /// Removes the watch for `resource` in `namespace` and stops it.
    pub async fn delete_resource_entry(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
    ) -> Result<(), CacheError> {
        self.store
            .delete(&CacheKey::for_resource(resource, namespace))
            .await
    }

    /// Returns the latest value of the JSON endpoint at `url`.
    ///
    /// The first request for a `(url, ca_bundle, interval_secs)` triple fetches the endpoint
    /// and starts refreshing it every `interval_secs` seconds. If the poller has failed since,
    /// its entry is discarded and the error returned, so the next request starts over.
    pub async fn get_external_data(
        &self,
        url: &str,
        ca_bundle: &[u8],
        interval_secs: u64,
    ) -> Result<Arc<Value>, CacheError> {
        let key = CacheKey::for_external(url, ca_bundle, interval_secs);
        let entry = self
            .store
            .get_or_try_insert_with(key.clone(), async {
                let source = PollSource::start(
                    url,
                    ca_bundle,
                    Duration::from_secs(interval_secs),
                    &self.external_config,
                    &self.tasks,
                )
                .await?;
                Ok(CacheEntry::Poll(source))
            })
            .await?;

        let CacheEntry::Poll(source) = entry else {
            return Err(CacheError::InternalError);
        };

        match source.get() {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::debug!(%key, error = %err, "discarding external poller");
                self.discard(&key, source.id()).await;
                Err(err)
            }
        }
    }

    /// Removes the poller for the given triple and stops it.
    pub async fn delete_external_entry(
        &self,
        url: &str,
        ca_bundle: &[u8],
        interval_secs: u64,
    ) -> Result<(), CacheError> {
        self.store
            .delete(&CacheKey::for_external(url, ca_bundle, interval_secs))
            .await
    }

    /// Tears down all entries and waits for their background tasks to finish.
    pub async fn shutdown(&self) {
        self.store.clear().await;
        if !self.tasks.wait_for(0, SHUTDOWN_GRACE).await {
            tracing::warn!(
                remaining = self.tasks.count(),
                "background tasks still running after shutdown"
            );
        }
    }

    /// Number of live entries, after applying pending evictions.
    pub async fn entry_count(&self) -> u64 {
        self.store.run_pending_tasks().await;
        self.store.entry_count()
    }

    /// Number of background tasks that are still running.
    pub fn active_tasks(&self) -> usize {
        self.tasks.count()
    }

    /// Waits until at most `count` background tasks are running, up to `timeout`.
    pub async fn wait_for_tasks(&self, count: usize, timeout: Duration) -> bool {
        self.tasks.wait_for(count, timeout).await
    }

    /// Removes the entry for `key` if it still holds the source `id`.
    ///
    /// A concurrent request may already have replaced it with a fresh source, which is kept.
    async fn discard(&self, key: &CacheKey, id: SourceId) {
        self.store
            .delete_if(key, |entry| entry.source_id() == id)
            .await;
    }
}
