//! Statsd reporting for the cache.
//!
//! Metrics are emitted through the [`metric!`](crate::metric) macro and dropped silently until
//! [`configure_statsd`] has installed the process-wide client.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Traits the [`metric!`](crate::metric) macro needs in scope.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// The statsd client together with the tags attached to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Adds the default tags to `metric` and sends it.
    #[inline(always)]
    pub fn send<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Installs the statsd client reporting to `host`, with every metric name prefixed by `prefix`.
///
/// The client is process-wide: a second call only logs a warning.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    default_tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let Some(addr) = addrs.first() else {
        anyhow::bail!("statsd host resolved to no address");
    };
    tracing::info!(%addr, prefix, "reporting metrics to statsd");

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket
        .set_nonblocking(true)
        .context("failed to configure statsd socket")?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        default_tags,
    };
    if CLIENT.set(client).is_err() {
        tracing::warn!("statsd was already configured");
    }
    Ok(())
}

/// Calls `f` with the installed client, or does nothing if there is none.
#[inline(always)]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = CLIENT.get() {
        f(client);
    }
}

/// Emits a counter, gauge or timer, with optional `key => value` tags.
///
/// ```ignore
/// metric!(counter("cache.hit") += 1, "cache" => "sources");
/// metric!(gauge("cache.entries") = 12);
/// metric!(timer("poll.fetch.duration") = started.elapsed());
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };
    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send(client.statsd().$method($id, $value)$(.with_tag($k, $v))*);
        })
    }};
}
