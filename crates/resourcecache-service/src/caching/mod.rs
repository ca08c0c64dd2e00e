//! # Entry caching and lifecycle
//!
//! Every data source handed out by the [`ResourceCache`](crate::ResourceCache) lives in a
//! single in-memory [`CacheStore`]. This module contains the store, the [`CacheEntry`]
//! variants it holds, the [`CacheKey`] they are addressed by, and the central
//! [`CacheError`] type.
//!
//! ## Entries
//!
//! A [`CacheEntry`] owns exactly one live background task: either the runner of a resource
//! watch ([`WatchSource`](crate::watch::WatchSource)) or the refresh loop of an external
//! poller ([`PollSource`](crate::external::PollSource)). The entry is the only owner of that
//! task, no two entries ever share a watch or a poller.
//!
//! Releasing an entry goes through [`Teardown::teardown`], which is idempotent: the first
//! call stops the background task, every later call does nothing.
//!
//! ## The release guarantee
//!
//! Whenever an entry leaves the store it is torn down, no matter which path removed it:
//!
//! - explicit [`CacheStore::delete`],
//! - eviction because the cost budget ([`CacheConfig::capacity`](crate::config::CacheConfig))
//!   is exceeded,
//! - expiry after being idle for [`CacheConfig::max_unused_for`](crate::config::CacheConfig),
//! - rejection by the admission policy right after insertion,
//! - [`CacheStore::clear`] on shutdown.
//!
//! All of these funnel into the eviction listener of the underlying `moka` cache, which calls
//! [`Teardown::teardown`]. Paths that hold the removed value themselves (delete, rejected
//! admission) call it as well, so teardown has happened by the time they return.
//!
//! The one exception is [`CacheStore::put`]: a replaced value is *not* torn down, releasing it
//! is up to the caller.
//!
//! ## Single-flight construction
//!
//! [`CacheStore::get_or_try_insert_with`] coalesces concurrent requests for one key: exactly
//! one construction future runs, all other callers wait for its outcome. Failed constructions
//! are not cached, so the next request starts over.
//!
//! ## [`CacheKey`]
//!
//! Keys consist of human-readable metadata plus its SHA-256 hash. Resource keys and external
//! keys live in disjoint namespaces, and every field value is quoted, so that values
//! containing separators cannot make two different requests share an entry. External keys
//! contain a fingerprint of the CA bundle instead of the bundle itself.
//!
//! ### Metrics
//!
//! Each metric is tagged with a `cache` field naming the store:
//!
//! - `cache.access`: All lookups through [`CacheStore::get_or_try_insert_with`].
//! - `cache.hit`: Lookups served by an existing entry.
//! - `cache.construction`: Constructions of new entries.
//! - `cache.construction.failed`: Constructions that failed, tagged with `error`.
//! - `cache.teardown`: Released entries, tagged with `cause`.
//! - `cache.entries`: Gauge of live entries.

mod cache_error;
mod cache_key;
mod entry;
mod store;

pub use cache_error::*;
pub use cache_key::*;
pub use entry::*;
pub use store::*;
