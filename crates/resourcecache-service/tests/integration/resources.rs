use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use resourcecache_service::CacheError;
use resourcecache_service::watch::LabelSelector;
use serde_json::json;

use crate::utils::{pods, setup_cache};

fn pod(namespace: &str, name: &str, app: &str) -> serde_json::Value {
    json!({"metadata": {"name": name, "namespace": namespace, "labels": {"app": app}}})
}

#[tokio::test]
async fn test_single_watch_per_key() {
    let (cache, provider) = setup_cache(|_| {});
    provider.set_sync_delay(Duration::from_millis(200));
    provider.apply(&pods(), pod("default", "web-0", "web"));

    let gvr = pods();
    let lookups = (0..16).map(|_| cache.get_lister(&gvr, "default"));
    let listers = futures::future::try_join_all(lookups).await.unwrap();

    let ids: BTreeSet<_> = listers.iter().map(|l| l.source_id()).collect();
    assert_eq!(ids.len(), 1);
    assert_eq!(provider.watches_started(), 1);
    assert_eq!(cache.entry_count().await, 1);
    assert_eq!(cache.active_tasks(), 1);

    for lister in &listers {
        assert_eq!(lister.list_all().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_second_lookup_skips_sync() {
    let (cache, provider) = setup_cache(|_| {});
    provider.set_sync_delay(Duration::from_millis(300));

    let started = Instant::now();
    let first = cache.get_lister(&pods(), "default").await.unwrap();
    let first_duration = started.elapsed();

    let started = Instant::now();
    let second = cache.get_lister(&pods(), "default").await.unwrap();
    let second_duration = started.elapsed();

    assert!(first_duration >= Duration::from_millis(300));
    assert!(second_duration < Duration::from_millis(100));
    assert_eq!(first.source_id(), second.source_id());
    assert_eq!(provider.watches_started(), 1);
}

#[tokio::test]
async fn test_delete_then_miss() {
    let (cache, provider) = setup_cache(|_| {});

    let before = cache.get_lister(&pods(), "default").await.unwrap();
    cache.delete_resource_entry(&pods(), "default").await.unwrap();

    assert_eq!(before.list_all(), Err(CacheError::Cancelled));
    assert!(cache.wait_for_tasks(0, Duration::from_secs(1)).await);
    assert_eq!(provider.watches_active(), 0);

    let after = cache.get_lister(&pods(), "default").await.unwrap();
    assert_ne!(before.source_id(), after.source_id());
    assert_eq!(provider.watches_started(), 2);

    cache.delete_resource_entry(&pods(), "default").await.unwrap();
    assert_eq!(
        cache.delete_resource_entry(&pods(), "default").await,
        Err(CacheError::NotFound)
    );
}

#[tokio::test]
async fn test_namespaces_are_separate_entries() {
    let (cache, provider) = setup_cache(|_| {});
    provider.apply(&pods(), pod("default", "web-0", "web"));
    provider.apply(&pods(), pod("prod", "web-0", "web"));
    provider.apply(&pods(), pod("prod", "db-0", "db"));

    let default = cache.get_lister(&pods(), "default").await.unwrap();
    let prod = cache.get_lister(&pods(), "prod").await.unwrap();
    let all = cache.get_lister(&pods(), "").await.unwrap();

    assert_eq!(default.list_all().unwrap().len(), 1);
    assert_eq!(prod.list_all().unwrap().len(), 2);
    assert_eq!(all.list_all().unwrap().len(), 3);

    let db: LabelSelector = "app=db".parse().unwrap();
    assert_eq!(all.list(&db).unwrap().len(), 1);
    assert_eq!(cache.entry_count().await, 3);
}

#[tokio::test]
async fn test_lister_follows_changes() {
    let (cache, provider) = setup_cache(|_| {});
    let lister = cache.get_lister(&pods(), "default").await.unwrap();
    assert!(lister.list_all().unwrap().is_empty());

    provider.apply(&pods(), pod("default", "web-0", "web"));
    tokio::time::timeout(Duration::from_secs(2), async {
        while lister.list_all().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_capacity_tears_down_evicted() {
    let (cache, provider) = setup_cache(|config| config.caches.capacity = 2);

    for i in 0..6 {
        match cache.get_lister(&pods(), &format!("ns-{i}")).await {
            Ok(_) | Err(CacheError::AdmissionRejected) => {}
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    let live = cache.entry_count().await as usize;
    assert!(live <= 2);
    assert!(cache.wait_for_tasks(live, Duration::from_secs(1)).await);
    assert_eq!(cache.active_tasks(), live);
    assert_eq!(provider.watches_started(), 6);
}

#[tokio::test]
async fn test_rejected_lookups_agree() {
    let (cache, provider) = setup_cache(|config| config.caches.capacity = 0);
    provider.set_sync_delay(Duration::from_millis(200));

    let gvr = pods();
    let lookups = (0..8).map(|_| cache.get_lister(&gvr, "default"));
    let results = futures::future::join_all(lookups).await;

    for result in results {
        assert_eq!(result.unwrap_err(), CacheError::AdmissionRejected);
    }
    assert_eq!(provider.watches_started(), 1);
    assert!(cache.wait_for_tasks(0, Duration::from_secs(1)).await);
    assert_eq!(provider.watches_active(), 0);
}

#[tokio::test]
async fn test_sync_failures_are_not_cached() {
    let (cache, provider) = setup_cache(|config| {
        config.watch.sync_timeout = Duration::from_millis(100);
    });

    provider.set_fail_sync(true);
    let err = cache.get_lister(&pods(), "default").await.unwrap_err();
    assert!(matches!(err, CacheError::SyncFailed(_)), "{err:?}");
    assert!(cache.wait_for_tasks(0, Duration::from_secs(1)).await);

    provider.set_fail_sync(false);
    provider.set_sync_delay(Duration::from_secs(5));
    let err = cache.get_lister(&pods(), "default").await.unwrap_err();
    assert_eq!(err, CacheError::SyncTimeout(Duration::from_millis(100)));
    assert!(cache.wait_for_tasks(0, Duration::from_secs(1)).await);
    assert_eq!(cache.entry_count().await, 0);

    provider.set_sync_delay(Duration::ZERO);
    cache.get_lister(&pods(), "default").await.unwrap();
    assert_eq!(provider.watches_started(), 3);
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let (cache, provider) = setup_cache(|_| {});

    let mut listers = vec![];
    for namespace in ["a", "b", "c"] {
        listers.push(cache.get_lister(&pods(), namespace).await.unwrap());
    }
    assert_eq!(cache.active_tasks(), 3);

    cache.shutdown().await;

    assert_eq!(cache.active_tasks(), 0);
    assert_eq!(cache.entry_count().await, 0);
    assert_eq!(provider.watches_active(), 0);
    for lister in listers {
        assert_eq!(lister.list_all(), Err(CacheError::Cancelled));
    }
}
