use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` on a terminal, `simplified` otherwise.
    Auto,
    /// Multi-line and colored.
    Pretty,
    /// One plain line per event.
    Simplified,
    /// One JSON object per event.
    Json,
}

/// The `logging` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Default level, used when `RUST_LOG` is not set.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE=1` at startup.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// The `metrics` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server, reporting is off without one.
    ///
    /// Defaults to the `STATSD_SERVER` environment variable.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// If set, every metric carries the host name under this tag.
    pub hostname_tag: Option<String>,
    /// Tags attached to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "resourcecache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Bounds of the in-memory entry store.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The total cost budget of the store.
    ///
    /// Every entry costs `1` unless its source says otherwise, so by default this is the
    /// maximum number of live watches and pollers.
    ///
    /// Defaults to `100`.
    pub capacity: u64,

    /// Maximum duration since last use of an entry.
    ///
    /// Idle entries are evicted and their background tasks stopped. `None` keeps entries
    /// until they are deleted or pushed out by capacity pressure.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            max_unused_for: None,
        }
    }
}

/// Settings for resource watches.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    /// How long constructing a watch may wait for its mirror to synchronize.
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,

    /// How often providers re-list their full state into the mirror.
    #[serde(with = "humantime_serde")]
    pub resync_period: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(30),
            resync_period: Duration::from_secs(5),
        }
    }
}

/// Settings for external pollers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ExternalConfig {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a whole request, including reading the body.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Bounds of the entry store.
    pub caches: CacheConfig,

    /// Resource watch tuning.
    pub watch: WatchConfig,

    /// External poller tuning.
    pub external: ExternalConfig,
}

impl Config {
    /// Loads the YAML file at `path`, or the defaults if there is none.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open configuration file {}", path.display()))?;
        Self::from_reader(file)
    }

    fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .context("failed reading config file")?;
        // serde_yaml would accept an empty document as all defaults
        if yaml.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&yaml).context("failed to parse config YAML")
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(|_| {
        de::Error::invalid_value(
            de::Unexpected::Str(&level),
            &"one of off, error, warn, info, debug or trace",
        )
    })
}
