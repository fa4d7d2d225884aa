//! Logging for deadline-sensitive scenario tests.
//!
//! Integration tests install the global subscriber once:
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     evwatch_common::testing::init_global_test_logging();
//! }
//! ```
//!
//! Library events then land in `target/test-logs/evwatch-scenarios.jsonl`.
//! A [`ScenarioLog`] adds step marks and the final report next to them, so a
//! flaky timing failure can be read back as "what did the producer do, when,
//! and what did the watch see".

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;

use crate::logging::LogConfig;

/// Where a scenario is when it leaves a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Files, producers and patterns being prepared.
    Arrange,
    /// The test makes the watched system emit events.
    Trigger,
    /// Blocked on a runner, session or probe.
    Wait,
    Verify,
}

impl std::fmt::Display for ScenarioStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Arrange => "arrange",
            Self::Trigger => "trigger",
            Self::Wait => "wait",
            Self::Verify => "verify",
        };
        f.write_str(name)
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install the JSONL test subscriber. Later calls do nothing.
///
/// `EVWATCH_TEST_LOG_FILE` overrides the JSONL path and
/// `EVWATCH_TEST_LOG_LEVEL` the level for evwatch crates (default `debug`).
/// `RUST_LOG` still wins, as for the binary.
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let level = std::env::var("EVWATCH_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".into());
        let filter = LogConfig::default()
            .with_level(level)
            .filter()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let file_layer = open_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_thread_names(true)
                .with_line_number(true)
        });
        let test_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_names(true)
            .compact();

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(test_layer);
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn open_log_file() -> Option<File> {
    let path = match std::env::var_os("EVWATCH_TEST_LOG_FILE") {
        Some(path) => PathBuf::from(path),
        None => target_dir().join("test-logs").join("evwatch-scenarios.jsonl"),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok()?;
    }
    File::create(path).ok()
}

fn target_dir() -> PathBuf {
    match std::env::var_os("CARGO_TARGET_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("target"),
    }
}

/// One mark left by a [`ScenarioLog`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioMark {
    pub scenario: String,
    pub step: ScenarioStep,
    pub message: String,
    pub at: DateTime<Utc>,
    /// Milliseconds since the scenario started.
    pub offset_ms: u64,
    /// Serialized report or measurements attached to the mark.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Timeline of one scenario, mirrored into tracing.
pub struct ScenarioLog {
    scenario: String,
    started: Instant,
    marks: Mutex<Vec<ScenarioMark>>,
}

impl ScenarioLog {
    pub fn start(scenario: &str) -> Self {
        let log = Self {
            scenario: scenario.to_string(),
            started: Instant::now(),
            marks: Mutex::new(Vec::new()),
        };
        log.mark(ScenarioStep::Arrange, "scenario started");
        log
    }

    pub fn mark(&self, step: ScenarioStep, message: impl Into<String>) {
        self.push(step, message.into(), None);
    }

    /// Attach a serialized report, e.g. a `MonitorReport` or `ProbeReport`.
    pub fn report<T: Serialize>(&self, message: impl Into<String>, report: &T) {
        let detail = serde_json::to_value(report)
            .unwrap_or_else(|err| serde_json::json!({ "unserializable": err.to_string() }));
        self.push(ScenarioStep::Verify, message.into(), Some(detail));
    }

    /// Run a blocking wait and record how long it took.
    pub fn timed<R>(&self, message: &str, wait: impl FnOnce() -> R) -> (R, Duration) {
        self.mark(ScenarioStep::Wait, message);
        let begin = Instant::now();
        let result = wait();
        let took = begin.elapsed();
        self.push(
            ScenarioStep::Wait,
            format!("{message} returned"),
            Some(serde_json::json!({ "took_ms": took.as_millis() as u64 })),
        );
        (result, took)
    }

    /// Panics, after recording the overrun, when `took` exceeds `bound`.
    pub fn assert_within(&self, took: Duration, bound: Duration) {
        if took > bound {
            self.push(
                ScenarioStep::Verify,
                "deadline overrun".into(),
                Some(serde_json::json!({
                    "took_ms": took.as_millis() as u64,
                    "bound_ms": bound.as_millis() as u64,
                })),
            );
            panic!("{}: took {took:?}, bound {bound:?}", self.scenario);
        }
    }

    pub fn offset_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn marks(&self) -> Vec<ScenarioMark> {
        self.marks.lock().map(|marks| marks.clone()).unwrap_or_default()
    }

    pub fn finish(self) {
        self.mark(ScenarioStep::Verify, "scenario passed");
    }

    fn push(&self, step: ScenarioStep, message: String, detail: Option<serde_json::Value>) {
        let mark = ScenarioMark {
            scenario: self.scenario.clone(),
            step,
            message,
            at: Utc::now(),
            offset_ms: self.offset_ms(),
            detail,
        };
        tracing::info!(
            scenario = %mark.scenario,
            step = %mark.step,
            offset_ms = mark.offset_ms,
            detail = ?mark.detail,
            "{}",
            mark.message
        );
        if let Ok(mut marks) = self.marks.lock() {
            marks.push(mark);
        }
    }
}
