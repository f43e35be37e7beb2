//! Subscriber setup for the probe.
//!
//! Levels at `debug` and above only open up the harbor crates; everything
//! else stays at `info`. At `trace` the HTTP and socket stacks are held at
//! `info` unless `HARBOR_TRACE_DEPS` is set. `HARBOR_LOG_FILTER` replaces
//! the computed directives entirely.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FILTER: &str = "HARBOR_LOG_FILTER";
pub const ENV_TRACE_DEPS: &str = "HARBOR_TRACE_DEPS";

const HARBOR_CRATES: &[&str] = &["harbor_probe", "harbor_session", "harbor_spawn"];
const NOISY_DEPS: &[&str] = &[
    "hyper",
    "hyper_util",
    "h2",
    "reqwest",
    "rustls",
    "rust_socketio",
    "rust_engineio",
    "tungstenite",
    "tokio_tungstenite",
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

/// Everything that decides where logs go and what passes the filter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogSetup {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    pub filter_override: Option<String>,
    pub trace_deps: bool,
}

impl LogSetup {
    /// Combine CLI choices with the `HARBOR_LOG_FILTER` / `HARBOR_TRACE_DEPS` environment.
    pub fn new(level: LogLevel, file: Option<PathBuf>) -> Self {
        Self {
            level,
            file,
            filter_override: std::env::var(ENV_LOG_FILTER)
                .ok()
                .filter(|filter| !filter.trim().is_empty()),
            trace_deps: std::env::var(ENV_TRACE_DEPS)
                .map(|v| v != "0" && !v.is_empty())
                .unwrap_or(false),
        }
    }

    /// Whether dependency traces are being held back.
    pub fn throttles_deps(&self) -> bool {
        self.filter_override.is_none() && self.level == LogLevel::Trace && !self.trace_deps
    }

    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter_override {
            return filter.clone();
        }
        if self.level < LogLevel::Debug {
            return self.level.directive().to_string();
        }
        let mut directives = vec!["info".to_string()];
        directives.extend(
            HARBOR_CRATES
                .iter()
                .map(|krate| format!("{krate}={}", self.level.directive())),
        );
        if self.throttles_deps() {
            directives.extend(NOISY_DEPS.iter().map(|dep| format!("{dep}=info")));
        }
        directives.join(",")
    }

    /// Install the global subscriber. Keep the guard alive until exit or
    /// buffered lines are lost.
    pub fn install(&self) -> Result<WorkerGuard> {
        let (writer, guard) = match &self.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(self.directives()))
            .with_target(self.level >= LogLevel::Debug)
            .with_thread_ids(self.level == LogLevel::Trace)
            .with_ansi(self.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("failed to install log subscriber")?;

        if self.throttles_deps() {
            eprintln!(
                "[harbor-log] dependency traces held at info; set {ENV_TRACE_DEPS}=1 or {ENV_LOG_FILTER} to change"
            );
        }
        Ok(guard)
    }
}
