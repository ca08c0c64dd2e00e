//! Live resource watches.
//!
//! A [`WatchProvider`] opens a [`ResourceWatch`] for one resource type in one namespace. The
//! watch runs as a background task that keeps a local [`Mirror`] of all matching objects up to
//! date, and a [`WatchSource`] owns that task for as long as the cache keeps it.
//!
//! Two providers are included: [`MemoryWatchProvider`] serves objects held in process, and
//! [`FilesystemWatchProvider`] serves manifests from a directory tree.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::caching::CacheError;

mod filesystem;
mod memory;
mod selector;
mod source;

pub use filesystem::FilesystemWatchProvider;
pub use memory::MemoryWatchProvider;
pub use selector::{LabelSelector, SelectorError};
pub use source::{ResourceLister, WatchSource};

/// Identifies a type of resource: API group, version and plural resource name.
///
/// The core group is the empty string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_owned(),
            version: version.to_owned(),
            resource: resource.to_owned(),
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}, Resource={}", self.version, self.resource)
        } else {
            write!(
                f,
                "{}/{}, Resource={}",
                self.group, self.version, self.resource
            )
        }
    }
}

/// Opens watches on resource types.
pub trait WatchProvider: Send + Sync + fmt::Debug {
    /// Creates a watch on `resource` in `namespace`, where an empty namespace means all
    /// namespaces.
    ///
    /// The watch is not running yet, [`ResourceWatch::run`] starts it.
    fn watch(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
    ) -> Result<Arc<dyn ResourceWatch>, CacheError>;
}

/// A single watch, mirroring the objects of one resource type.
#[async_trait]
pub trait ResourceWatch: Send + Sync {
    /// Keeps the mirror up to date until `stop` is cancelled.
    async fn run(self: Arc<Self>, stop: CancellationToken);

    /// Waits until the mirror holds a complete listing.
    ///
    /// Returns `false` if the watch gave up, or `stop` was cancelled, before that.
    async fn wait_for_sync(&self, stop: &CancellationToken) -> bool;

    /// Lists the mirrored objects matching `selector`.
    fn list(&self, selector: &LabelSelector) -> Vec<Arc<Value>>;
}

/// The synchronization state of a [`Mirror`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug)]
struct MirrorState {
    sync: SyncState,
    objects: Arc<[Arc<Value>]>,
}

/// The local copy of the objects a watch observes.
///
/// Readers always see one complete listing, which is swapped out as a whole.
#[derive(Debug)]
pub struct Mirror {
    state: watch::Sender<MirrorState>,
}

impl Default for Mirror {
    fn default() -> Self {
        Self {
            state: watch::Sender::new(MirrorState {
                sync: SyncState::Pending,
                objects: Arc::new([]),
            }),
        }
    }
}

impl Mirror {
    /// Replaces the mirrored objects and marks the mirror as synchronized.
    pub fn replace(&self, objects: Vec<Arc<Value>>) {
        self.state.send_replace(MirrorState {
            sync: SyncState::Synced,
            objects: objects.into(),
        });
    }

    /// Marks the mirror as failed, unless it has synchronized before.
    pub fn fail(&self) {
        self.state.send_if_modified(|state| {
            if state.sync == SyncState::Pending {
                state.sync = SyncState::Failed;
                true
            } else {
                false
            }
        });
    }

    pub fn sync_state(&self) -> SyncState {
        self.state.borrow().sync
    }

    /// Waits until the mirror leaves [`SyncState::Pending`], or `stop` is cancelled.
    pub async fn wait_for_sync(&self, stop: &CancellationToken) -> bool {
        let mut receiver = self.state.subscribe();
        tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            state = receiver.wait_for(|state| state.sync != SyncState::Pending) => {
                matches!(state, Ok(state) if state.sync == SyncState::Synced)
            }
        }
    }

    /// Lists the objects matching `selector`.
    pub fn list(&self, selector: &LabelSelector) -> Vec<Arc<Value>> {
        let objects = Arc::clone(&self.state.borrow().objects);
        objects
            .iter()
            .filter(|object| selector.matches_object(object))
            .cloned()
            .collect()
    }
}

/// Returns `true` if `object` lives in `namespace`, where an empty namespace matches all.
fn in_namespace(object: &Value, namespace: &str) -> bool {
    namespace.is_empty()
        || object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("default")
            == namespace
}
