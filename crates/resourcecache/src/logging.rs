use std::env;

use resourcecache_service::config::{Config, LogFormat};
use sentry::integrations::tracing::EventFilter;
use tracing::Level;
use tracing::level_filters::{LevelFilter, STATIC_MAX_LEVEL};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

/// Our own crates log at `level`, chatty dependencies are held back at lower levels.
fn get_rust_log(level: LevelFilter) -> String {
    const CRATES: [&str; 2] = ["resourcecache", "resourcecache_service"];
    const NOISY: [&str; 2] = ["hyper", "reqwest"];

    let Some(level) = level.into_level() else {
        return String::new();
    };
    if level <= Level::WARN {
        return level.to_string();
    }

    let mut directives = vec!["INFO".to_owned()];
    if level == Level::INFO {
        directives.extend(NOISY.iter().map(|krate| format!("{krate}=WARN")));
    } else {
        directives.extend(CRATES.iter().map(|krate| format!("{krate}={level}")));
    }
    directives.join(",")
}

fn format_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let format = match format {
        LogFormat::Auto if console::user_attended() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        other => other,
    };

    match format {
        LogFormat::Pretty | LogFormat::Auto => layer.pretty().boxed(),
        LogFormat::Simplified => layer.compact().with_ansi(false).boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    }
}

/// Installs the global tracing subscriber: the configured log format plus the sentry layer.
///
/// `RUST_LOG` takes precedence over the configured level.
///
/// # Safety
/// May set `RUST_BACKTRACE` through [`std::env::set_var`], so it must be called before any
/// other thread is started.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: the caller guarantees we are still single-threaded.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.logging.level));
    let fmt_layer = format_layer(config.logging.format).with_filter(EnvFilter::new(&rust_log));

    // errors are reported, warnings and info are kept as breadcrumbs
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            Level::ERROR => EventFilter::Event,
            Level::WARN | Level::INFO => EventFilter::Breadcrumb,
            Level::DEBUG | Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}

/// Logs `error` through tracing if an error would be recorded, and to stderr otherwise.
pub fn ensure_log_error(error: &anyhow::Error) {
    if Level::ERROR <= STATIC_MAX_LEVEL && Level::ERROR <= LevelFilter::current() {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
