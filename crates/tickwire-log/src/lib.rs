//! Logging setup for tickwire clients.
//!
//! Console output goes through a human-readable `fmt` layer with uptime
//! timestamps and thread names, so lines from the `tickwire-send`,
//! `tickwire-recv` and `tickwire-connect` workers are easy to tell apart.
//! Debug builds can additionally write JSON lines to a log file.

use std::fs::File;
use std::path::Path;

use tickwire_config::Config;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File name of the JSON log inside the log directory.
pub const LOG_FILE_NAME: &str = "tickwire.log";

/// Filter used when neither `RUST_LOG` nor the config sets a level.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` if set, else from `debug.log_level` in
/// `config`, else [`DEFAULT_FILTER`]. When `debug_build` is true and
/// `log_dir` is given, events are also written as JSON to
/// `log_dir/`[`LOG_FILE_NAME`].
///
/// # Examples
///
/// ```no_run
/// use tickwire_config::Config;
/// use tickwire_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), cfg!(debug_assertions), Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && let Some(log_file) = open_log_file(log_dir)
    {
        subscriber.with(json_file_layer(log_file)).init();
        return;
    }

    subscriber.init();
}

/// Filter directives from the config, falling back to [`DEFAULT_FILTER`].
pub fn filter_directives(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.trim().is_empty() => {
            config.debug.log_level.trim().to_string()
        }
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// An `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

/// Create the log directory and truncate the log file in it.
fn open_log_file(log_dir: &Path) -> Option<File> {
    std::fs::create_dir_all(log_dir).ok()?;
    File::create(log_dir.join(LOG_FILE_NAME)).ok()
}

/// JSON lines, no ANSI escapes.
fn json_file_layer<S>(file: File) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_timer(fmt::time::uptime())
        .json()
}
