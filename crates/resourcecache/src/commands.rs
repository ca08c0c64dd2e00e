//! The lookup loops behind the subcommands.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use resourcecache_service::config::Config;
use resourcecache_service::watch::{
    FilesystemWatchProvider, GroupVersionResource, ResourceWatch, WatchProvider,
};
use resourcecache_service::{CacheError, ResourceCache};

use crate::cli::{ExternalArgs, ResourceArgs};

const LOOKUP_DELAY: Duration = Duration::from_secs(1);

/// Runs `lookup` once per second until `iterations` are done or the process is interrupted.
async fn repeat<F, Fut>(iterations: Option<u64>, mut lookup: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut done = 0;
    loop {
        lookup().await;
        done += 1;
        if iterations.is_some_and(|n| done >= n) {
            return;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                return;
            }
            _ = tokio::time::sleep(LOOKUP_DELAY) => {}
        }
    }
}

pub async fn resource(config: &Config, args: ResourceArgs) -> Result<()> {
    let provider = FilesystemWatchProvider::new(&args.root, config.watch.resync_period);
    let cache = ResourceCache::new(config, Arc::new(provider));
    let resource = GroupVersionResource::new(&args.group, &args.version, &args.resource);
    tracing::info!(%resource, namespace = %args.namespace, root = %args.root.display(), "watching");

    let (cache_ref, resource, args) = (&cache, &resource, &args);
    repeat(args.iterations, move || async move {
        let started = Instant::now();
        let listed = cache_ref
            .get_lister(&resource, &args.namespace)
            .await
            .and_then(|lister| lister.list(&args.selector));
        let elapsed = started.elapsed();

        match listed {
            Ok(objects) => println!(
                "{} objects match `{}` ({}µs)",
                objects.len(),
                args.selector,
                elapsed.as_micros()
            ),
            Err(error) => {
                let error = &error as &dyn std::error::Error;
                tracing::error!(error, "resource lookup failed");
            }
        }
    })
    .await;

    cache.shutdown().await;
    Ok(())
}

pub async fn external(config: &Config, args: ExternalArgs) -> Result<()> {
    let ca_bundle = match &args.ca_bundle {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("failed to read CA bundle {}", path.display()))?,
        None => vec![],
    };
    let cache = ResourceCache::new(config, Arc::new(NoWatches));
    tracing::info!(url = %args.url, interval = args.interval, "polling");

    let (cache_ref, ca_bundle, args) = (&cache, &ca_bundle, &args);
    repeat(args.iterations, move || async move {
        let started = Instant::now();
        let value = cache_ref
            .get_external_data(&args.url, ca_bundle, args.interval)
            .await;
        let elapsed = started.elapsed();

        match value {
            Ok(value) => println!("{value} ({}µs)", elapsed.as_micros()),
            Err(error) => {
                let error = &error as &dyn std::error::Error;
                tracing::error!(error, "external lookup failed");
            }
        }
    })
    .await;

    cache.shutdown().await;
    Ok(())
}

/// The provider of a cache that only serves external data.
#[derive(Debug)]
struct NoWatches;

impl WatchProvider for NoWatches {
    fn watch(
        &self,
        resource: &GroupVersionResource,
        _namespace: &str,
    ) -> Result<Arc<dyn ResourceWatch>, CacheError> {
        Err(CacheError::ConstructionFailed(format!(
            "no watch provider configured for {resource}"
        )))
    }
}
