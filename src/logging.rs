//! Logging and tracing initialization for bkpipe.
//!
//! Console output is pretty or JSON. Every run also appends to its own log
//! file, `bkpipe-<epoch>.log`, in the configured log directory, falling back
//! to the system temp directory and finally to console only.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{Level, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::core::models::Epoch;

/// Configuration for the logging system.
pub struct LogConfig {
    /// Output console logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
    /// Preferred directory for the per-run log file. `None` logs to console only.
    pub dir: Option<PathBuf>,
    pub epoch: Epoch,
}

/// Initialize the tracing subscriber and return the log file in use, if any.
///
/// The level can be overridden at runtime via `RUST_LOG`.
pub fn init(config: LogConfig) -> Option<PathBuf> {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("bkpipe={}", default_level.as_str().to_lowercase()))
    });

    let file = config
        .dir
        .as_deref()
        .and_then(|dir| open_run_log(dir, config.epoch));
    let (sink, path) = match file {
        Some((file, path)) => (Some(Mutex::new(file)), Some(path)),
        None => (None, None),
    };
    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(file_layer(sink))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .with(file_layer(sink))
            .init();
    }

    path
}

/// Plain-text layer for the per-run log file.
fn file_layer<S>(sink: Option<Mutex<File>>) -> Option<impl Layer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    sink.map(|sink| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(sink)
    })
}

/// Open `bkpipe-<epoch>.log` for appending in `preferred`, then in the
/// system temp directory.
pub fn open_run_log(preferred: &Path, epoch: Epoch) -> Option<(File, PathBuf)> {
    let name = log_file_name(epoch);
    [preferred.to_path_buf(), std::env::temp_dir()]
        .into_iter()
        .find_map(|dir| {
            let path = dir.join(&name);
            let file = fs::create_dir_all(&dir)
                .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
            match file {
                Ok(file) => Some((file, path)),
                Err(e) => {
                    eprintln!("bkpipe: cannot open log file {}: {}", path.display(), e);
                    None
                }
            }
        })
}

pub fn log_file_name(epoch: Epoch) -> String {
    format!("bkpipe-{}.log", epoch)
}
