//! Tracing setup for Tideshift
//!
//! Console output follows the level the user picked. A second layer writes
//! everything the engine logs to a per-run file, since writer and downloader
//! tasks report stalls, reloads and evictions at debug and trace level.

use std::fs::{File, create_dir_all};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{Level, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the debug log written on every run.
pub const LOG_FILE_NAME: &str = "tideshift-last-run.log";

/// HTTP internals log every connection at debug level.
const TRANSPORT_DIRECTIVES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=info"];

/// Installs console and file logging.
///
/// `RUST_LOG` overrides `console_level` for the console only. The file in
/// `logs_dir` (default `./logs`) is truncated and receives every engine
/// event down to trace level. A subscriber installed earlier by the host
/// stays in place.
///
/// Returns the path of the debug log file.
///
/// # Errors
///
/// - `io::Error` - If the logs directory or log file cannot be created
pub fn init_tracing(console_level: Level, logs_dir: Option<&Path>) -> io::Result<PathBuf> {
    let logs_dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_dir)?;
    let log_path = logs_dir.join(LOG_FILE_NAME);
    let log_file = File::create(&log_path)?;

    let installed = tracing_subscriber::registry()
        .with(console_layer(console_level))
        .with(file_layer(log_file))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            "Logging to console at {} and to {}",
            console_level,
            log_path.display()
        );
    } else {
        tracing::debug!("Subscriber already installed, keeping host logging");
    }
    Ok(log_path)
}

fn console_layer<S>(level: Level) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| engine_filter(&level.to_string()));
    fmt::layer().with_target(true).with_filter(filter)
}

fn file_layer<S>(file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(Mutex::new(file))
        .with_filter(engine_filter("trace"))
}

/// Filter at `level` with HTTP internals held back.
fn engine_filter(level: &str) -> EnvFilter {
    TRANSPORT_DIRECTIVES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level), EnvFilter::add_directive)
}

/// Console verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    /// # Examples
    /// ```
    /// use tideshift_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Debug.as_tracing_level(), tracing::Level::DEBUG);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}
