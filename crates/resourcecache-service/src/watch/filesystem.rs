use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{GroupVersionResource, LabelSelector, Mirror, ResourceWatch, WatchProvider};
use crate::caching::CacheError;

/// A [`WatchProvider`] over manifests in a directory tree.
///
/// Objects of a resource type live in `<root>/<namespace>/<resource>/`, one object per
/// `.json`, `.yaml` or `.yml` file. Resources outside the core group use `<resource>.<group>`
/// as directory name, e.g. `deployments.apps`. Watches re-read their directories every resync
/// period.
#[derive(Clone, Debug)]
pub struct FilesystemWatchProvider {
    root: Arc<Path>,
    resync_period: Duration,
}

impl FilesystemWatchProvider {
    pub fn new(root: impl Into<PathBuf>, resync_period: Duration) -> Self {
        Self {
            root: root.into().into(),
            resync_period,
        }
    }
}

impl WatchProvider for FilesystemWatchProvider {
    fn watch(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
    ) -> Result<Arc<dyn ResourceWatch>, CacheError> {
        if namespace.contains(['/', '\\']) || namespace == ".." {
            return Err(CacheError::ConstructionFailed(format!(
                "invalid namespace `{namespace}`"
            )));
        }

        let directory = if resource.group.is_empty() {
            resource.resource.clone()
        } else {
            format!("{}.{}", resource.resource, resource.group)
        };

        Ok(Arc::new(FilesystemWatch {
            root: Arc::clone(&self.root),
            namespace: namespace.to_owned(),
            directory,
            resync_period: self.resync_period,
            mirror: Mirror::default(),
        }))
    }
}

struct FilesystemWatch {
    root: Arc<Path>,
    namespace: String,
    directory: String,
    resync_period: Duration,
    mirror: Mirror,
}

impl FilesystemWatch {
    /// Directories holding the watched objects.
    async fn object_dirs(&self) -> io::Result<Vec<PathBuf>> {
        if !self.namespace.is_empty() {
            return Ok(vec![self.root.join(&self.namespace).join(&self.directory)]);
        }

        let mut dirs = vec![];
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path().join(&self.directory));
            }
        }
        Ok(dirs)
    }

    async fn list_objects(&self) -> io::Result<Vec<Arc<Value>>> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("manifest root {} does not exist", self.root.display()),
            ));
        }

        let mut paths = vec![];
        for dir in self.object_dirs().await? {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // a namespace without objects of this type
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if is_manifest(&path) {
                    paths.push(path);
                }
            }
        }
        paths.sort();

        let mut objects = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = tokio::fs::read_to_string(&path).await?;
            match parse_manifest(&path, &contents) {
                Ok(object) => objects.push(Arc::new(object)),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping invalid manifest");
                }
            }
        }
        Ok(objects)
    }
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json" | "yaml" | "yml")
    )
}

fn parse_manifest(path: &Path, contents: &str) -> anyhow::Result<Value> {
    let object = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(contents)?
    } else {
        serde_yaml::from_str(contents)?
    };
    Ok(object)
}

#[async_trait]
impl ResourceWatch for FilesystemWatch {
    async fn run(self: Arc<Self>, stop: CancellationToken) {
        loop {
            let listed = tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                listed = self.list_objects() => listed,
            };

            match listed {
                Ok(objects) => self.mirror.replace(objects),
                Err(error) => {
                    let error = &error as &dyn std::error::Error;
                    tracing::warn!(
                        root = %self.root.display(),
                        resource = %self.directory,
                        error,
                        "failed to list manifests"
                    );
                    // gives up if the first listing fails, keeps the last listing otherwise
                    self.mirror.fail();
                    if self.mirror.sync_state() != super::SyncState::Synced {
                        return;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(self.resync_period) => {}
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
