//! Subscriber setup for the receiver binary.
//!
//! Our own crates follow `--log-level`; the media and websocket stacks stay
//! at `info` under `trace` unless `PIXEL_TRACE_DEPS` is set, because they log
//! every packet. `PIXEL_LOG_FILTER` replaces the computed directives outright.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

use crate::config::env_truthy;

pub const LOG_FILTER_ENV: &str = "PIXEL_LOG_FILTER";
pub const TRACE_DEPS_ENV: &str = "PIXEL_TRACE_DEPS";

const OWN_TARGETS: &[&str] = &["pixel_receiver_core", "pixel_receiver", "signaling_proto"];

const MEDIA_STACK_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_sctp",
    "webrtc_mdns",
    "interceptor",
    "tokio_tungstenite",
    "tungstenite",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid log filter {directives:?}: {source}")]
    Filter {
        directives: String,
        #[source]
        source: ParseError,
    },
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Keeps the background log writer alive; buffered lines are flushed when it
/// drops, so hold it for the life of the process.
#[must_use = "dropping the guard stops the log writer"]
pub struct LogGuard {
    _writer: WorkerGuard,
}

/// Installs the process-wide subscriber described by `config`.
pub fn init(config: &LogConfig) -> Result<LogGuard, InitError> {
    let directives = match std::env::var(LOG_FILTER_ENV) {
        Ok(custom) if !custom.trim().is_empty() => custom.trim().to_owned(),
        _ => directives_for(config.level, env_truthy(TRACE_DEPS_ENV)),
    };
    let filter = EnvFilter::try_new(&directives).map_err(|source| InitError::Filter {
        directives: directives.clone(),
        source,
    })?;
    let (writer, guard) = open_writer(config.file.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;

    tracing::debug!(target = "telemetry", directives = %directives, "logging initialized");
    Ok(LogGuard { _writer: guard })
}

fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let Some(path) = file else {
        return Ok(tracing_appender::non_blocking(std::io::stderr()));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::OpenFile {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(tracing_appender::non_blocking(file))
}

fn directives_for(level: LogLevel, media_traces: bool) -> String {
    if level < LogLevel::Debug {
        return level.directive().to_owned();
    }
    let mut directives = vec!["info".to_owned()];
    directives.extend(
        OWN_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.directive())),
    );
    if level == LogLevel::Trace && !media_traces {
        directives.extend(MEDIA_STACK_TARGETS.iter().map(|target| format!("{target}=info")));
    }
    directives.join(",")
}
