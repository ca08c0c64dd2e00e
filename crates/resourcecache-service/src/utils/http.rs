use std::time::Duration;

use reqwest::tls;

use crate::caching::CacheError;
use crate::config::ExternalConfig;

/// The user agent sent with every request to an external endpoint.
pub const USER_AGENT: &str = concat!("resourcecache/", env!("CARGO_PKG_VERSION"));

/// Timeouts for requests to external endpoints.
#[derive(Copy, Clone, Debug)]
pub struct HttpTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one request, including the body.
    pub request: Duration,
}

impl HttpTimeouts {
    pub fn from_config(config: &ExternalConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            request: config.request_timeout,
        }
    }
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self::from_config(&ExternalConfig::default())
    }
}

/// Creates a [`reqwest::Client`] for one external endpoint.
///
/// With a non-empty `ca_bundle`, the client trusts exactly the certificates in that PEM bundle
/// and nothing else, and refuses anything older than TLS 1.2. An empty bundle gives a client
/// with the default trust store.
///
/// # Errors
///
/// [`CacheError::InvalidCaBundle`] if the bundle does not parse or holds no certificate, and
/// [`CacheError::ConstructionFailed`] if the client cannot be built otherwise.
pub fn create_client(
    timeouts: &HttpTimeouts,
    ca_bundle: &[u8],
) -> Result<reqwest::Client, CacheError> {
    let mut builder = reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(USER_AGENT);

    if ca_bundle.is_empty() {
        return builder
            .build()
            .map_err(|e| CacheError::ConstructionFailed(e.to_string()));
    }

    let certificates = reqwest::Certificate::from_pem_bundle(ca_bundle)
        .map_err(|e| CacheError::InvalidCaBundle(e.to_string()))?;
    if certificates.is_empty() {
        return Err(CacheError::InvalidCaBundle("no certificates found".into()));
    }

    builder = builder
        .tls_built_in_root_certs(false)
        .min_tls_version(tls::Version::TLS_1_2);
    for certificate in certificates {
        builder = builder.add_root_certificate(certificate);
    }

    // certificate contents are only validated when the TLS backend is configured
    builder
        .build()
        .map_err(|e| CacheError::InvalidCaBundle(e.to_string()))
}
