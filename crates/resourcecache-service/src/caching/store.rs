use std::future::Future;
use std::sync::{Arc, OnceLock};

use moka::notification::RemovalCause;
use moka::ops::compute::{CompResult, Op};

use super::{CacheError, CacheKey, Teardown};
use crate::config::CacheConfig;

type InMemoryCache<V> = moka::future::Cache<CacheKey, Stored<V>>;

/// A value in the store, with the store's decision whether to keep it.
///
/// The decision is made once, by whichever caller settles admission first, and shared by all
/// clones, so every caller handed this value observes the same outcome.
#[derive(Clone)]
struct Stored<V> {
    value: V,
    admitted: Arc<OnceLock<bool>>,
}

impl<V> Stored<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            admitted: Arc::default(),
        }
    }

    fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.admitted, &other.admitted)
    }
}

/// A bounded, concurrent store of cache entries.
///
/// Every entry that leaves the store is released through [`Teardown::teardown`], except when
/// it is replaced by [`put`](Self::put).
#[derive(Clone)]
pub struct CacheStore<V> {
    name: Arc<str>,
    cache: InMemoryCache<V>,
}

impl<V> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn cause_tag(cause: RemovalCause) -> &'static str {
    match cause {
        RemovalCause::Explicit => "explicit",
        RemovalCause::Replaced => "replaced",
        RemovalCause::Expired => "expired",
        RemovalCause::Size => "size",
    }
}

impl<V> CacheStore<V>
where
    V: Teardown + Clone + Send + Sync + 'static,
{
    pub fn new(name: &str, config: &CacheConfig) -> Self {
        let name: Arc<str> = name.into();
        let listener_name = Arc::clone(&name);

        let mut builder = InMemoryCache::builder()
            .name(&name)
            .max_capacity(config.capacity)
            .weigher(|_k, stored: &Stored<V>| stored.value.weight())
            .eviction_listener(move |key, stored: Stored<V>, cause| {
                if cause == RemovalCause::Replaced {
                    // the caller of `put` owns the previous value
                    return;
                }
                tracing::debug!(%key, ?cause, "releasing cache entry");
                metric!(
                    counter("cache.teardown") += 1,
                    "cache" => listener_name.as_ref(),
                    "cause" => cause_tag(cause),
                );
                stored.value.teardown();
            });

        if let Some(max_unused_for) = config.max_unused_for {
            builder = builder.time_to_idle(max_unused_for);
        }

        Self {
            name,
            cache: builder.build(),
        }
    }

    /// Looks up the entry for `key`.
    pub async fn get(&self, key: &CacheKey) -> Option<V> {
        self.cache.get(key).await.map(|stored| stored.value)
    }

    /// Inserts `value` if no entry for `key` exists yet.
    ///
    /// The store takes ownership of `value` in any case: when it is not kept, because the slot
    /// is occupied or the admission policy declined it, `value` is torn down and
    /// [`CacheError::AdmissionRejected`] is returned.
    pub async fn add(&self, key: CacheKey, value: V) -> Result<(), CacheError> {
        let stored = Stored::new(value);
        let entry = self
            .cache
            .entry_by_ref(&key)
            .or_insert_with(std::future::ready(stored.clone()))
            .await;

        if !entry.is_fresh() {
            tracing::debug!(%key, "entry already present, rejecting new value");
            stored.value.teardown();
            return Err(CacheError::AdmissionRejected);
        }

        self.settle_admission(&key, &stored).await
    }

    /// Inserts `value`, replacing any existing entry for `key`.
    ///
    /// A replaced value is *not* torn down.
    pub async fn put(&self, key: CacheKey, value: V) -> Result<(), CacheError> {
        let stored = Stored::new(value);
        self.cache.insert(key.clone(), stored.clone()).await;
        self.settle_admission(&key, &stored).await
    }

    /// Removes the entry for `key` and tears it down.
    pub async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        match self.cache.remove(key).await {
            Some(stored) => {
                stored.value.teardown();
                self.report_entries();
                Ok(())
            }
            None => Err(CacheError::NotFound),
        }
    }

    /// Removes the entry for `key` only if `predicate` holds for it.
    ///
    /// Returns `true` if an entry was removed and torn down.
    pub async fn delete_if<P>(&self, key: &CacheKey, predicate: P) -> bool
    where
        P: FnOnce(&V) -> bool,
    {
        let result = self
            .cache
            .entry_by_ref(key)
            .and_compute_with(|existing| {
                let matches = existing.is_some_and(|entry| predicate(&entry.value().value));
                std::future::ready(if matches { Op::Remove } else { Op::Nop })
            })
            .await;

        match result {
            CompResult::Removed(entry) => {
                entry.into_value().value.teardown();
                self.report_entries();
                true
            }
            _ => false,
        }
    }

    /// Returns the entry for `key`, or constructs it with `init`.
    ///
    /// Concurrent calls for the same key share one construction. A failed construction is
    /// handed to every waiting caller and not cached. If the store declines the constructed
    /// value, every waiting caller gets [`CacheError::AdmissionRejected`].
    pub async fn get_or_try_insert_with<F>(&self, key: CacheKey, init: F) -> Result<V, CacheError>
    where
        F: Future<Output = Result<V, CacheError>>,
    {
        let name = self.name.as_ref();
        metric!(counter("cache.access") += 1, "cache" => name);

        let entry = self
            .cache
            .entry_by_ref(&key)
            .or_try_insert_with(async move { init.await.map(Stored::new) })
            .await
            .map_err(|err: Arc<CacheError>| {
                metric!(
                    counter("cache.construction.failed") += 1,
                    "cache" => name,
                    "error" => err.metrics_tag(),
                );
                CacheError::clone(&err)
            })?;

        if entry.is_fresh() {
            metric!(counter("cache.construction") += 1, "cache" => name);
        } else {
            metric!(counter("cache.hit") += 1, "cache" => name);
        }

        let stored = entry.into_value();
        self.settle_admission(&key, &stored).await?;
        Ok(stored.value)
    }

    /// Removes and tears down all entries.
    pub async fn clear(&self) {
        let keys: Vec<Arc<CacheKey>> = self.cache.iter().map(|(key, _)| key).collect();
        for key in keys {
            if let Some(stored) = self.cache.remove(key.as_ref()).await {
                stored.value.teardown();
            }
        }
        // catches entries inserted while we were removing
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        self.report_entries();
    }

    /// Number of live entries.
    ///
    /// This is eventually consistent, call [`run_pending_tasks`](Self::run_pending_tasks)
    /// first for an exact count.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Applies all pending evictions and expirations.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// Returns whether the store keeps `stored` under `key`, deciding it if nobody has yet.
    ///
    /// Deciding settles pending admission work and checks that `key` still maps to this very
    /// value. A declined value has already been released by the eviction listener, it is torn
    /// down here once more so this holds even before the listener ran.
    async fn settle_admission(&self, key: &CacheKey, stored: &Stored<V>) -> Result<(), CacheError> {
        let admitted = match stored.admitted.get() {
            Some(&admitted) => admitted,
            None => {
                self.cache.run_pending_tasks().await;
                self.report_entries();
                let kept = self
                    .cache
                    .get(key)
                    .await
                    .is_some_and(|current| current.is_same(stored));
                *stored.admitted.get_or_init(|| kept)
            }
        };

        if admitted {
            return Ok(());
        }

        tracing::debug!(%key, "cache admission rejected");
        stored.value.teardown();
        Err(CacheError::AdmissionRejected)
    }

    fn report_entries(&self) {
        metric!(
            gauge("cache.entries") = self.cache.entry_count(),
            "cache" => self.name.as_ref(),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::watch::GroupVersionResource;

    /// A value recording whether it was torn down.
    #[derive(Clone, Debug)]
    struct Tracked {
        id: usize,
        torn_down: Arc<AtomicBool>,
        teardowns: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new(id: usize, teardowns: &Arc<AtomicUsize>) -> Self {
            Self {
                id,
                torn_down: Default::default(),
                teardowns: Arc::clone(teardowns),
            }
        }

        fn is_torn_down(&self) -> bool {
            self.torn_down.load(Ordering::SeqCst)
        }
    }

    impl Teardown for Tracked {
        fn teardown(&self) {
            if !self.torn_down.swap(true, Ordering::SeqCst) {
                self.teardowns.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn key(i: usize) -> CacheKey {
        CacheKey::for_resource(&GroupVersionResource::new("", "v1", "pods"), &format!("ns-{i}"))
    }

    fn store(capacity: u64) -> CacheStore<Tracked> {
        let config = CacheConfig {
            capacity,
            max_unused_for: None,
        };
        CacheStore::new("test", &config)
    }

    #[tokio::test]
    async fn test_add_get_delete() {
        let teardowns = Arc::default();
        let store = store(10);
        let value = Tracked::new(1, &teardowns);

        store.add(key(1), value.clone()).await.unwrap();
        assert_eq!(store.get(&key(1)).await.unwrap().id, 1);
        assert!(store.get(&key(2)).await.is_none());

        store.delete(&key(1)).await.unwrap();
        assert!(value.is_torn_down());
        assert!(store.get(&key(1)).await.is_none());

        assert_eq!(store.delete(&key(1)).await, Err(CacheError::NotFound));
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_occupied() {
        let teardowns = Arc::default();
        let store = store(10);
        let first = Tracked::new(1, &teardowns);
        let second = Tracked::new(2, &teardowns);

        store.add(key(1), first.clone()).await.unwrap();
        assert_eq!(
            store.add(key(1), second.clone()).await,
            Err(CacheError::AdmissionRejected)
        );

        assert!(!first.is_torn_down());
        assert!(second.is_torn_down());
        assert_eq!(store.get(&key(1)).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_put_replaces_without_teardown() {
        let teardowns = Arc::default();
        let store = store(10);
        let first = Tracked::new(1, &teardowns);
        let second = Tracked::new(2, &teardowns);

        store.put(key(1), first.clone()).await.unwrap();
        store.put(key(1), second.clone()).await.unwrap();

        assert_eq!(store.get(&key(1)).await.unwrap().id, 2);
        assert!(!first.is_torn_down());
        assert!(!second.is_torn_down());
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_capacity_releases_everything_not_kept() {
        let teardowns = Arc::default();
        let store = store(3);

        let mut values = vec![];
        for i in 0..20 {
            let value = Tracked::new(i, &teardowns);
            // rejection is fine, the store has torn the value down in that case
            let _ = store.add(key(i), value.clone()).await;
            values.push(value);
        }
        store.run_pending_tasks().await;

        assert!(store.entry_count() <= 3);
        for (i, value) in values.iter().enumerate() {
            let present = store.get(&key(i)).await.is_some();
            assert_eq!(present, !value.is_torn_down(), "value {i}");
        }
        assert_eq!(
            teardowns.load(Ordering::SeqCst) as u64,
            20 - store.entry_count()
        );
    }

    #[tokio::test]
    async fn test_single_flight() {
        let teardowns = Arc::default();
        let store = store(10);
        let constructions = Arc::new(AtomicUsize::new(0));

        let lookups = (0..8).map(|_| {
            let store = store.clone();
            let constructions = Arc::clone(&constructions);
            let teardowns = Arc::clone(&teardowns);
            async move {
                store
                    .get_or_try_insert_with(key(1), async move {
                        let id = constructions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Tracked::new(id, &teardowns))
                    })
                    .await
            }
        });
        let results = futures::future::join_all(lookups).await;

        assert_eq!(constructions.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().id, 0);
        }
    }

    #[tokio::test]
    async fn test_single_flight_rejected() {
        let teardowns = Arc::default();
        let store = store(0);
        let constructions = Arc::new(AtomicUsize::new(0));

        let lookups = (0..8).map(|_| {
            let store = store.clone();
            let constructions = Arc::clone(&constructions);
            let teardowns = Arc::clone(&teardowns);
            async move {
                store
                    .get_or_try_insert_with(key(1), async move {
                        let id = constructions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Tracked::new(id, &teardowns))
                    })
                    .await
            }
        });
        let results = futures::future::join_all(lookups).await;

        assert_eq!(constructions.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap_err(), CacheError::AdmissionRejected);
        }
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(store.get(&key(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_construction_is_not_cached() {
        let teardowns = Arc::default();
        let store = store(10);

        let result = store
            .get_or_try_insert_with(key(1), async {
                Err(CacheError::SyncFailed("nope".into()))
            })
            .await;
        assert_eq!(result.unwrap_err(), CacheError::SyncFailed("nope".into()));
        assert!(store.get(&key(1)).await.is_none());

        let value = store
            .get_or_try_insert_with(key(1), async { Ok(Tracked::new(7, &teardowns)) })
            .await
            .unwrap();
        assert_eq!(value.id, 7);
    }

    #[tokio::test]
    async fn test_delete_if() {
        let teardowns = Arc::default();
        let store = store(10);
        let value = Tracked::new(1, &teardowns);
        store.add(key(1), value.clone()).await.unwrap();

        assert!(!store.delete_if(&key(1), |p| p.id == 2).await);
        assert!(!value.is_torn_down());

        assert!(store.delete_if(&key(1), |p| p.id == 1).await);
        assert!(value.is_torn_down());
        assert!(!store.delete_if(&key(1), |_| true).await);
    }

    #[tokio::test]
    async fn test_clear() {
        let teardowns = Arc::default();
        let store = store(10);
        let values: Vec<_> = (0..5).map(|i| Tracked::new(i, &teardowns)).collect();
        for (i, value) in values.iter().enumerate() {
            store.add(key(i), value.clone()).await.unwrap();
        }

        store.clear().await;

        assert_eq!(store.entry_count(), 0);
        assert!(values.iter().all(Tracked::is_torn_down));
        assert_eq!(teardowns.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_idle_expiry() {
        let teardowns = Arc::default();
        let config = CacheConfig {
            capacity: 10,
            max_unused_for: Some(Duration::from_millis(100)),
        };
        let store = CacheStore::new("test", &config);
        let value = Tracked::new(1, &teardowns);
        store.add(key(1), value.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        store.run_pending_tasks().await;

        assert!(store.get(&key(1)).await.is_none());
        assert!(value.is_torn_down());
    }
}
