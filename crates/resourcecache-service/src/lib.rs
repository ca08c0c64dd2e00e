//! The lookup cache behind `resourcecache`.
//!
//! A [`ResourceCache`] hands out long-lived data sources by logical key: live resource
//! watches keyed by resource type and namespace, and periodically polled external HTTP
//! endpoints keyed by URL, CA bundle and refresh interval. Sources are constructed lazily
//! on first request, exactly once per key, and torn down deterministically when their
//! entry leaves the cache.
//!
//! See the [`caching`] module for the store and its release guarantee, [`watch`] and
//! [`external`] for the two kinds of sources.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod external;
pub mod service;
pub mod utils;
pub mod watch;

pub use caching::{CacheError, CacheKey};
pub use service::ResourceCache;
