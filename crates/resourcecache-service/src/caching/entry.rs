use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::external::PollSource;
use crate::watch::WatchSource;

/// A value owning background work that has to be released when it leaves the
/// [`CacheStore`](super::CacheStore).
pub trait Teardown {
    /// Stops the background work and releases its resources.
    ///
    /// Must be idempotent: only the first call has an effect.
    fn teardown(&self);

    /// Gives a relative weight for the entry, counted against the store capacity.
    fn weight(&self) -> u32 {
        1
    }
}

/// Unique identifier of a constructed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocates a new unique id.
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// A cached unit, owning either a live resource watch or an external poller.
#[derive(Clone, Debug)]
pub enum CacheEntry {
    /// A started and synchronized resource watch.
    Watch(Arc<WatchSource>),
    /// A started poller that has produced at least one value.
    Poll(Arc<PollSource>),
}

impl CacheEntry {
    /// The id of the owned source.
    pub fn source_id(&self) -> SourceId {
        match self {
            CacheEntry::Watch(source) => source.id(),
            CacheEntry::Poll(source) => source.id(),
        }
    }

    /// Returns `true` once the owned source has been torn down.
    pub fn is_cancelled(&self) -> bool {
        match self {
            CacheEntry::Watch(source) => source.is_cancelled(),
            CacheEntry::Poll(source) => source.is_cancelled(),
        }
    }
}

impl Teardown for CacheEntry {
    fn teardown(&self) {
        match self {
            CacheEntry::Watch(source) => source.cancel(),
            CacheEntry::Poll(source) => source.cancel(),
        }
    }
}
