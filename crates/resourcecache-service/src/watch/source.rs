use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{GroupVersionResource, LabelSelector, ResourceWatch, WatchProvider};
use crate::caching::{CacheError, SourceId};
use crate::config::WatchConfig;
use crate::utils::tasks::ActiveTasks;

/// A running resource watch, owned by a cache entry.
///
/// The watch runs until [`cancel`](Self::cancel) is called or the source is dropped.
pub struct WatchSource {
    id: SourceId,
    resource: GroupVersionResource,
    namespace: String,
    watch: Arc<dyn ResourceWatch>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchSource")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("namespace", &self.namespace)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl WatchSource {
    /// Opens a watch through `provider`, starts it and waits for its mirror to synchronize.
    ///
    /// If the mirror is not synchronized within [`WatchConfig::sync_timeout`], or the watch
    /// gives up before, it is stopped again and an error returned.
    #[tracing::instrument(skip_all, fields(resource = %resource, namespace = namespace))]
    pub async fn start(
        provider: &dyn WatchProvider,
        resource: &GroupVersionResource,
        namespace: &str,
        config: &WatchConfig,
        tasks: &ActiveTasks,
    ) -> Result<Arc<Self>, CacheError> {
        let watch = provider.watch(resource, namespace)?;
        let stop = CancellationToken::new();
        let task = tasks.spawn(Arc::clone(&watch).run(stop.clone()));

        // from here on, dropping the source stops the watch
        let source = Arc::new(Self {
            id: SourceId::next(),
            resource: resource.clone(),
            namespace: namespace.to_owned(),
            watch,
            stop,
            task: Mutex::new(Some(task)),
        });

        let started = Instant::now();
        let synced =
            tokio::time::timeout(config.sync_timeout, source.watch.wait_for_sync(&source.stop))
                .await;
        metric!(timer("watch.sync.duration") = started.elapsed());

        match synced {
            Ok(true) => {
                tracing::debug!(id = %source.id, "resource watch synchronized");
                Ok(source)
            }
            Ok(false) => {
                source.cancel();
                Err(CacheError::SyncFailed(format!(
                    "watch on {resource} stopped before synchronizing"
                )))
            }
            Err(_) => {
                source.cancel();
                Err(CacheError::SyncTimeout(config.sync_timeout))
            }
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn resource(&self) -> &GroupVersionResource {
        &self.resource
    }

    /// The watched namespace, empty for all namespaces.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stops the watch. Only the first call has an effect.
    pub fn cancel(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };

        self.stop.cancel();
        task.abort();
        tracing::debug!(id = %self.id, resource = %self.resource, "resource watch stopped");
    }

    fn list(&self, selector: &LabelSelector) -> Result<Vec<Arc<Value>>, CacheError> {
        if self.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        Ok(self.watch.list(selector))
    }
}

impl Drop for WatchSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Read-only access to the mirror of a cached [`WatchSource`].
///
/// Listers are cheap to clone. A lister keeps its source alive, but not running: once the
/// cache has torn the source down, listing fails with [`CacheError::Cancelled`].
#[derive(Clone, Debug)]
pub struct ResourceLister {
    source: Arc<WatchSource>,
}

impl ResourceLister {
    pub(crate) fn new(source: Arc<WatchSource>) -> Self {
        Self { source }
    }

    /// Lists the mirrored objects matching `selector`.
    pub fn list(&self, selector: &LabelSelector) -> Result<Vec<Arc<Value>>, CacheError> {
        self.source.list(selector)
    }

    /// Lists all mirrored objects.
    pub fn list_all(&self) -> Result<Vec<Arc<Value>>, CacheError> {
        self.list(&LabelSelector::everything())
    }

    /// The id of the underlying source.
    ///
    /// Two listers with the same id read from the same watch.
    pub fn source_id(&self) -> SourceId {
        self.source.id()
    }

    pub fn resource(&self) -> &GroupVersionResource {
        self.source.resource()
    }

    pub fn namespace(&self) -> &str {
        self.source.namespace()
    }
}
