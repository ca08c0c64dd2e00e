use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    GroupVersionResource, LabelSelector, Mirror, ResourceWatch, WatchProvider, in_namespace,
};
use crate::caching::CacheError;

/// `(namespace, name)` of an object.
type ObjectName = (String, String);

#[derive(Debug, Default, Clone, Copy)]
struct Behavior {
    sync_delay: Duration,
    fail_sync: bool,
}

#[derive(Debug)]
struct Cluster {
    objects: RwLock<BTreeMap<GroupVersionResource, BTreeMap<ObjectName, Arc<Value>>>>,
    revision: watch::Sender<u64>,
    behavior: Mutex<Behavior>,
    resync_period: Duration,
    watches_started: AtomicUsize,
    watches_active: AtomicUsize,
}

impl Cluster {
    fn snapshot(&self, resource: &GroupVersionResource, namespace: &str) -> Vec<Arc<Value>> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(resource)
            .into_iter()
            .flat_map(|objects| objects.values())
            .filter(|object| in_namespace(object, namespace))
            .cloned()
            .collect()
    }

    fn behavior(&self) -> Behavior {
        *self.behavior.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A [`WatchProvider`] over objects held in process.
///
/// Changes made through [`apply`](Self::apply) and [`remove`](Self::remove) are pushed to all
/// running watches, which additionally re-list everything every resync period.
#[derive(Clone, Debug)]
pub struct MemoryWatchProvider {
    cluster: Arc<Cluster>,
}

impl MemoryWatchProvider {
    pub fn new(resync_period: Duration) -> Self {
        Self {
            cluster: Arc::new(Cluster {
                objects: Default::default(),
                revision: watch::Sender::new(0),
                behavior: Default::default(),
                resync_period,
                watches_started: AtomicUsize::new(0),
                watches_active: AtomicUsize::new(0),
            }),
        }
    }

    /// Creates or replaces an object of type `resource`.
    ///
    /// The object is identified by `metadata.namespace` and `metadata.name`, a missing
    /// namespace is `default`.
    pub fn apply(&self, resource: &GroupVersionResource, object: Value) {
        let name = |pointer: &str| {
            object
                .pointer(pointer)
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        let key = (
            name("/metadata/namespace").unwrap_or_else(|| "default".into()),
            name("/metadata/name").unwrap_or_default(),
        );

        self.cluster
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(resource.clone())
            .or_default()
            .insert(key, Arc::new(object));
        self.cluster.revision.send_modify(|r| *r += 1);
    }

    /// Removes an object, returning whether it existed.
    pub fn remove(&self, resource: &GroupVersionResource, namespace: &str, name: &str) -> bool {
        let removed = self
            .cluster
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(resource)
            .and_then(|objects| objects.remove(&(namespace.to_owned(), name.to_owned())))
            .is_some();
        if removed {
            self.cluster.revision.send_modify(|r| *r += 1);
        }
        removed
    }

    /// Delays the initial listing of watches started from now on.
    pub fn set_sync_delay(&self, delay: Duration) {
        self.cluster
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sync_delay = delay;
    }

    /// Makes watches started from now on give up before synchronizing.
    pub fn set_fail_sync(&self, fail: bool) {
        self.cluster
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_sync = fail;
    }

    /// Number of watches ever opened.
    pub fn watches_started(&self) -> usize {
        self.cluster.watches_started.load(Ordering::SeqCst)
    }

    /// Number of watches currently running.
    pub fn watches_active(&self) -> usize {
        self.cluster.watches_active.load(Ordering::SeqCst)
    }
}

impl WatchProvider for MemoryWatchProvider {
    fn watch(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
    ) -> Result<Arc<dyn ResourceWatch>, CacheError> {
        self.cluster.watches_started.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryWatch {
            cluster: Arc::clone(&self.cluster),
            resource: resource.clone(),
            namespace: namespace.to_owned(),
            mirror: Mirror::default(),
        }))
    }
}

struct ActiveWatch(Arc<Cluster>);

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        self.0.watches_active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryWatch {
    cluster: Arc<Cluster>,
    resource: GroupVersionResource,
    namespace: String,
    mirror: Mirror,
}

#[async_trait]
impl ResourceWatch for MemoryWatch {
    async fn run(self: Arc<Self>, stop: CancellationToken) {
        self.cluster.watches_active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveWatch(Arc::clone(&self.cluster));

        let behavior = self.cluster.behavior();
        if behavior.fail_sync {
            tracing::debug!(resource = %self.resource, "failing initial listing");
            self.mirror.fail();
            return;
        }

        let mut changes = self.cluster.revision.subscribe();
        tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(behavior.sync_delay) => {}
        }

        loop {
            changes.borrow_and_update();
            self.mirror
                .replace(self.cluster.snapshot(&self.resource, &self.namespace));

            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                _ = changes.changed() => {}
                _ = tokio::time::sleep(self.cluster.resync_period) => {}
            }
        }
    }

    async fn wait_for_sync(&self, stop: &CancellationToken) -> bool {
        self.mirror.wait_for_sync(stop).await
    }

    fn list(&self, selector: &LabelSelector) -> Vec<Arc<Value>> {
        self.mirror.list(selector)
    }
}
