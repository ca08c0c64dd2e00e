use std::fmt::{self, Write};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::watch::GroupVersionResource;

/// The key of one entry in the [`CacheStore`](super::CacheStore).
///
/// A key carries stable, human-readable metadata describing the request parameters, and
/// the SHA-256 hash of that metadata. Equality and hashing only look at the hash.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_path())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates the [`CacheKey`] for a watch on `resource` in `namespace`.
    ///
    /// An empty `namespace` stands for all namespaces.
    pub fn for_resource(resource: &GroupVersionResource, namespace: &str) -> Self {
        let mut builder = CacheKeyBuilder::new("resource");
        builder.field("group", &resource.group);
        builder.field("version", &resource.version);
        builder.field("resource", &resource.resource);
        builder.field("namespace", namespace);
        builder.build()
    }

    /// Creates the [`CacheKey`] for a poller of `url` refreshing every `interval_secs`.
    ///
    /// Only the [`fingerprint`] of `ca_bundle` becomes part of the key.
    pub fn for_external(url: &str, ca_bundle: &[u8], interval_secs: u64) -> Self {
        let mut builder = CacheKeyBuilder::new("external");
        builder.field("url", url);
        builder.field("ca_bundle", &fingerprint(ca_bundle));
        builder.field("refresh", &interval_secs.to_string());
        builder.build()
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns a short path-like rendering of the key hash.
    ///
    /// The hash is hex-formatted like so: `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        path.extend(self.hash[1..4].iter().map(|b| format!("{b:02x}")));
        path.push('/');
        path.extend(self.hash[4..].iter().map(|b| format!("{b:02x}")));
        path
    }
}

/// Returns the hex-encoded SHA-256 digest of `bytes`.
///
/// An empty input yields an empty fingerprint, so that "no CA bundle" stays recognizable
/// in key metadata.
pub fn fingerprint(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// A builder for [`CacheKey`]s.
///
/// Every field is written as one `name: "value"` line, with the value as a JSON string,
/// which keeps the metadata unambiguous regardless of what the values contain.
struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    fn new(namespace: &str) -> Self {
        Self {
            metadata: format!("kind: {namespace}\n"),
        }
    }

    fn field(&mut self, name: &str, value: &str) {
        let quoted = Value::from(value);
        // Writing into a `String` is infallible.
        let _ = writeln!(self.metadata, "{name}: {quoted}");
    }

    /// Finalize the [`CacheKey`].
    fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        CacheKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}
