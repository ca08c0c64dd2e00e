use std::time::Duration;

use thiserror::Error;

/// An error that happens while constructing, registering or reading a cached source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The source could not be set up at all, e.g. its HTTP client failed to build or a
    /// parameter was invalid.
    #[error("failed to construct source: {0}")]
    ConstructionFailed(String),
    /// The supplied certificate-authority bundle could not be parsed or contained no
    /// certificates.
    #[error("invalid CA bundle: {0}")]
    InvalidCaBundle(String),
    /// The watch mirror did not report being synchronized within the allotted time.
    #[error("resource watch failed to sync within {}", humantime::format_duration(*.0))]
    SyncTimeout(Duration),
    /// The watch gave up before its mirror was synchronized.
    #[error("resource watch failed to sync: {0}")]
    SyncFailed(String),
    /// The store declined to keep a freshly built source.
    ///
    /// The source has already been torn down when this is returned.
    #[error("cache admission rejected")]
    AdmissionRejected,
    /// No entry exists for the requested key.
    #[error("no cache entry for key")]
    NotFound,
    /// The external endpoint could not be reached or answered with a non-success status.
    #[error("fetch failed: {0}")]
    FetchFailed(String),
    /// The external endpoint answered with a body that is not valid JSON.
    #[error("failed to decode response: {0}")]
    DecodeFailed(String),
    /// A poller that had produced values stopped after a failed refresh.
    ///
    /// The entry is discarded, requesting the key again constructs a new poller.
    #[error("poller stopped: {0}")]
    PollFailed(String),
    /// The source was torn down and no longer serves data.
    #[error("source was cancelled")]
    Cancelled,
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// A short, stable name of the variant, used as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            CacheError::ConstructionFailed(_) => "construction-failed",
            CacheError::InvalidCaBundle(_) => "invalid-ca-bundle",
            CacheError::SyncTimeout(_) => "sync-timeout",
            CacheError::SyncFailed(_) => "sync-failed",
            CacheError::AdmissionRejected => "admission-rejected",
            CacheError::NotFound => "not-found",
            CacheError::FetchFailed(_) => "fetch-failed",
            CacheError::DecodeFailed(_) => "decode-failed",
            CacheError::PollFailed(_) => "poll-failed",
            CacheError::Cancelled => "cancelled",
            CacheError::InternalError => "internal",
        }
    }
}
