use std::time::Duration;

use resourcecache_service::CacheError;
use resourcecache_test::{JsonServer, read_fixture};
use serde_json::json;

use crate::utils::setup_cache;

#[tokio::test]
async fn test_cached_then_refreshed() {
    let (cache, _) = setup_cache(|_| {});
    let server = JsonServer::new(json!({"version": 1}));
    let url = server.url("/data");
    let bundle = read_fixture("ca.pem");

    let value = cache.get_external_data(url.as_str(), &bundle, 1).await.unwrap();
    assert_eq!(*value, json!({"version": 1}));
    assert_eq!(server.hits(), 1);

    // served from the poller until its next refresh
    server.set_body(json!({"version": 2}));
    let value = cache.get_external_data(url.as_str(), &bundle, 1).await.unwrap();
    assert_eq!(*value, json!({"version": 1}));

    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let value = cache.get_external_data(url.as_str(), &bundle, 1).await.unwrap();
            if *value == json!({"version": 2}) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(cache.entry_count().await, 1);
    assert_eq!(cache.active_tasks(), 1);
}

#[tokio::test]
async fn test_key_triple_separates_pollers() {
    let (cache, _) = setup_cache(|_| {});
    let server = JsonServer::new(json!("x"));
    let url = server.url("/data");
    let bundle = read_fixture("ca.pem");

    cache.get_external_data(url.as_str(), b"", 5).await.unwrap();
    cache.get_external_data(url.as_str(), b"", 6).await.unwrap();
    cache.get_external_data(url.as_str(), &bundle, 5).await.unwrap();
    cache.get_external_data(url.as_str(), b"", 5).await.unwrap();

    assert_eq!(server.hits(), 3);
    assert_eq!(cache.entry_count().await, 3);
    assert_eq!(cache.active_tasks(), 3);
}

#[tokio::test]
async fn test_corrupt_ca_bundle() {
    let (cache, _) = setup_cache(|_| {});
    let server = JsonServer::new(json!("x"));

    let err = cache
        .get_external_data(server.url("/data").as_str(), &read_fixture("corrupt.pem"), 5)
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::InvalidCaBundle(_)), "{err:?}");
    assert_eq!(server.hits(), 0);
    assert_eq!(cache.active_tasks(), 0);
    assert_eq!(cache.entry_count().await, 0);
}

#[tokio::test]
async fn test_first_fetch_failures() {
    let (cache, _) = setup_cache(|_| {});
    let server = JsonServer::new(json!("x"));

    let err = cache
        .get_external_data(server.url("/status/404").as_str(), b"", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::FetchFailed(_)), "{err:?}");

    let err = cache
        .get_external_data(server.url("/garbage").as_str(), b"", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::DecodeFailed(_)), "{err:?}");

    let err = cache
        .get_external_data(server.url("/data").as_str(), b"", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::ConstructionFailed(_)), "{err:?}");

    let err = cache
        .get_external_data(server.url("/data").as_str(), b"", u64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::ConstructionFailed(_)), "{err:?}");
    assert_eq!(server.hits(), 0);

    assert_eq!(cache.active_tasks(), 0);
    assert_eq!(cache.entry_count().await, 0);
}

#[tokio::test]
async fn test_failed_poller_is_replaced() {
    let (cache, _) = setup_cache(|_| {});
    let server = JsonServer::new(json!("first"));
    let url = server.url("/data");

    cache.get_external_data(url.as_str(), b"", 1).await.unwrap();

    server.set_failing(true);
    assert!(cache.wait_for_tasks(0, Duration::from_secs(3)).await);

    let err = cache.get_external_data(url.as_str(), b"", 1).await.unwrap_err();
    assert!(matches!(err, CacheError::PollFailed(_)), "{err:?}");
    assert_eq!(cache.entry_count().await, 0);

    server.set_failing(false);
    server.set_body(json!("second"));
    let value = cache.get_external_data(url.as_str(), b"", 1).await.unwrap();
    assert_eq!(*value, json!("second"));
    assert_eq!(cache.active_tasks(), 1);
}

#[tokio::test]
async fn test_reads_see_complete_values() {
    let (cache, _) = setup_cache(|_| {});
    let server = JsonServer::new(json!({"a": 0, "b": 0}));
    let url = server.url("/data");
    cache.get_external_data(url.as_str(), b"", 1).await.unwrap();

    let writer = async {
        for i in 1..=50 {
            server.set_body(json!({"a": i, "b": i}));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    let reader = async {
        let mut seen = 0;
        for _ in 0..500 {
            let value = cache.get_external_data(url.as_str(), b"", 1).await.unwrap();
            assert_eq!(value["a"], value["b"]);
            seen = seen.max(value["a"].as_i64().unwrap());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen
    };

    let ((), seen) = tokio::join!(writer, reader);
    assert!(seen > 0);
}

#[tokio::test]
async fn test_delete_external_entry() {
    let (cache, _) = setup_cache(|_| {});
    let server = JsonServer::new(json!("x"));
    let url = server.url("/data");

    cache.get_external_data(url.as_str(), b"", 5).await.unwrap();
    assert_eq!(cache.active_tasks(), 1);

    cache.delete_external_entry(url.as_str(), b"", 5).await.unwrap();
    assert!(cache.wait_for_tasks(0, Duration::from_secs(1)).await);
    assert_eq!(
        cache.delete_external_entry(url.as_str(), b"", 5).await,
        Err(CacheError::NotFound)
    );

    cache.get_external_data(url.as_str(), b"", 5).await.unwrap();
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn test_ca_bundle_validates_server() {
    let (cache, _) = setup_cache(|_| {});
    let server = JsonServer::with_tls(json!({"secure": true}));
    let url = server.url("/data");
    assert_eq!(url.scheme(), "https");

    let value = cache
        .get_external_data(url.as_str(), &read_fixture("ca.pem"), 5)
        .await
        .unwrap();
    assert_eq!(*value, json!({"secure": true}));

    // a well-formed bundle that did not issue the server certificate
    let err = cache
        .get_external_data(url.as_str(), &read_fixture("other-ca.pem"), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::FetchFailed(_)), "{err:?}");

    // the default trust store does not know the test CA either
    let err = cache
        .get_external_data(url.as_str(), b"", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::FetchFailed(_)), "{err:?}");

    assert_eq!(server.hits(), 1);
    assert_eq!(cache.entry_count().await, 1);
    assert_eq!(cache.active_tasks(), 1);
}
