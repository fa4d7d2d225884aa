//! Tracing subscriber setup for evwatch binaries.
//!
//! ```ignore
//! let mut log_config = LogConfig::from_env("info").with_stderr();
//! if cli.verbose {
//!     log_config = log_config.with_level("debug");
//! }
//! let _logging_guards = init_logging(&log_config)?;
//! ```
//!
//! Human output goes to stderr so stdout stays free for reports. An optional
//! JSON file layer is written through a non-blocking appender whose guard
//! must be held until exit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::config::EnvParser;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },

    #[error("Failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Where and how verbosely to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Directive for the `evwatch` crates, e.g. `info` or `debug`.
    pub level: String,
    /// Emit human-readable output on stderr.
    pub stderr: bool,
    /// Emit JSON instead of human output on stderr.
    pub json: bool,
    /// Also append JSON lines to this file.
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Read `EVWATCH_LOG_LEVEL`, `EVWATCH_LOG_JSON` and `EVWATCH_LOG_FILE`.
    ///
    /// Invalid values fall back to defaults and are reported on stderr,
    /// since no subscriber exists yet.
    pub fn from_env(default_level: &str) -> Self {
        let mut parser = EnvParser::new();
        let config = Self {
            level: parser.get_log_level("LOG_LEVEL", default_level).value,
            stderr: false,
            json: parser.get_bool("LOG_JSON", false).value,
            file: parser.get_optional_path("LOG_FILE").value,
        };
        for err in parser.take_errors() {
            eprintln!("evwatch: {err}");
        }
        config
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// `RUST_LOG` wins when set; otherwise `level` applies to evwatch crates
    /// and everything else stays at `warn`.
    pub fn filter(&self) -> Result<EnvFilter, LoggingError> {
        let directive = match std::env::var("RUST_LOG") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => format!(
                "warn,evwatch={level},evwatch_common={level}",
                level = self.level
            ),
        };
        EnvFilter::try_new(&directive).map_err(|err| LoggingError::InvalidFilter {
            filter: directive,
            message: err.to_string(),
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stderr: false,
            json: false,
            file: None,
        }
    }
}

/// Keeps background log writers flushing; drop at exit.
#[must_use = "dropping the guards stops file logging"]
#[derive(Debug, Default)]
pub struct LoggingGuards {
    guards: Vec<WorkerGuard>,
}

impl LoggingGuards {
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = config.filter()?;
    let mut guards = LoggingGuards::default();

    let stderr_human = (config.stderr && !config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .compact()
    });
    let stderr_json = (config.stderr && config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(false)
    });

    let file_layer = match &config.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            guards.guards.push(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_thread_names(true),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_human)
        .with(stderr_json)
        .with(file_layer)
        .try_init()
        .map_err(|err| LoggingError::Init(err.to_string()))?;

    Ok(guards)
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), LoggingError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|source| LoggingError::CreateDir {
        path: dir.clone(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("evwatch.jsonl"));

    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn clear(vars: &[&str]) {
        for var in vars {
            // SAFETY: env access is serialized by env_test_lock
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::default()
            .with_stderr()
            .with_level("debug")
            .with_json(true)
            .with_file("/tmp/evwatch/log.jsonl");
        assert!(config.stderr);
        assert!(config.json);
        assert_eq!(config.level, "debug");
        assert_eq!(config.file, Some(PathBuf::from("/tmp/evwatch/log.jsonl")));
    }

    #[test]
    fn test_from_env() {
        let _guard = env_test_lock();
        let vars = ["EVWATCH_LOG_LEVEL", "EVWATCH_LOG_JSON", "EVWATCH_LOG_FILE"];
        clear(&vars);

        let config = LogConfig::from_env("warn");
        assert_eq!(config.level, "warn");
        assert!(!config.json);
        assert!(config.file.is_none());
        assert!(!config.stderr);

        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            std::env::set_var("EVWATCH_LOG_LEVEL", "TRACE");
            std::env::set_var("EVWATCH_LOG_JSON", "1");
        }
        let config = LogConfig::from_env("info");
        assert_eq!(config.level, "trace");
        assert!(config.json);

        clear(&vars);
    }

    #[test]
    fn test_filter_from_level() {
        let _guard = env_test_lock();
        clear(&["RUST_LOG"]);

        let filter = LogConfig::default().with_level("debug").filter().unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("evwatch_common=debug"), "{rendered}");

        let err = LogConfig::default().with_level("verbose").filter().unwrap_err();
        assert!(matches!(err, LoggingError::InvalidFilter { .. }));
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("evwatch.jsonl");
        let (_writer, _guard) = file_writer(&path).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
