//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use resourcecache_service::config::Config;
use resourcecache_service::metrics;
use resourcecache_service::watch::LabelSelector;

use crate::commands;
use crate::logging;

fn get_crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Arguments of the `resource` command.
#[derive(Args, Debug)]
pub struct ResourceArgs {
    /// API group of the resource, empty for the core group.
    #[arg(long, default_value = "")]
    pub group: String,

    /// API version of the resource.
    #[arg(long, default_value = "v1")]
    pub version: String,

    /// Plural resource name, e.g. `pods`.
    #[arg(long)]
    pub resource: String,

    /// Namespace to watch, all namespaces if empty.
    #[arg(long, default_value = "")]
    pub namespace: String,

    /// Label selector, e.g. `app=web,tier!=db`.
    #[arg(long, default_value = "")]
    pub selector: LabelSelector,

    /// Directory with the manifests to watch.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub root: PathBuf,

    /// Stop after this many lookups instead of running until interrupted.
    #[arg(long)]
    pub iterations: Option<u64>,
}

/// Arguments of the `external` command.
#[derive(Args, Debug)]
pub struct ExternalArgs {
    /// URL of the JSON endpoint.
    #[arg(long)]
    pub url: String,

    /// PEM file with the certificate authorities to trust instead of the system roots.
    #[arg(long, value_name = "FILE")]
    pub ca_bundle: Option<PathBuf>,

    /// Refresh interval in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub interval: u64,

    /// Stop after this many lookups instead of running until interrupted.
    #[arg(long)]
    pub iterations: Option<u64>,
}

/// resourcecache commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch a resource type and print how many objects match the selector.
    Resource(ResourceArgs),

    /// Poll an external JSON endpoint and print its latest value.
    External(ExternalArgs),
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(bin_name = "resourcecache", version = get_crate_version())]
struct Cli {
    /// Path to your configuration file.
    #[arg(long = "config", short = 'c', global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No runtime has been started yet, this is still single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags: BTreeMap<_, _> = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("resourcecache")
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    match cli.command {
        Command::Resource(args) => runtime.block_on(commands::resource(&config, args)),
        Command::External(args) => runtime.block_on(commands::external(&config, args)),
    }
}
