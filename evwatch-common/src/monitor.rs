//! Waiting for an ordered sequence of lines from a file or a monitor process.
//!
//! Both entry points run the same worker loop under a [`DeadlineRunner`]:
//! drain every complete line into an [`EventMatcher`], stop once the pattern
//! completes, the token is cancelled, or the producing process has exited and
//! its output is fully drained, otherwise sleep one poll interval.
//!
//! [`MonitorSession`] owns the producing process. Its stdout goes to a
//! temporary file that the worker tails, so the process never blocks on a
//! full pipe while nobody reads.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::config::watch::humantime_serde;
use crate::matcher::{EventMatcher, EventPattern, MatchState};
use crate::process::{CommandSpec, OwnedProcess};
use crate::runner::{Aborted, CancelToken, DeadlineRunner, RunOutcome, RunnerState, WorkResult};
use crate::tail::{TailError, TailSession};

/// Errors from the monitor and probe layer.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Tail(#[from] TailError),

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// The worker stopped because the deadline expired before it had anything.
    #[error("Cancelled before any result was available")]
    Cancelled,
}

/// Outcome of a watch or monitor run.
#[derive(Debug, Serialize)]
pub struct MonitorReport {
    /// Path of the tailed file, or the monitor command line.
    pub source: String,
    /// Terminal runner state.
    pub outcome: RunnerState,
    /// Pattern progress when the run ended.
    pub state: MatchState,
    pub lines_seen: u64,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Exit code of the monitor process, when one was owned and exited normally.
    pub exit_code: Option<i32>,
    pub interrupted: bool,
    pub force_killed: bool,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<WatchError>,
}

impl MonitorReport {
    /// The run finished before the deadline.
    pub fn completed(&self) -> bool {
        self.outcome == RunnerState::Completed
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == RunnerState::TimedOut
    }

    /// Every pattern element was reached, regardless of how the run ended.
    pub fn all_matched(&self) -> bool {
        self.state.is_complete()
    }

    fn from_run(
        source: String,
        pattern: &EventPattern,
        outcome: RunOutcome<MatchState, WatchError>,
        elapsed: Duration,
    ) -> Result<Self, WatchError> {
        let runner_state = outcome.state();
        let (state, error) = match outcome {
            RunOutcome::Completed(state) => (Some(state), None),
            RunOutcome::TimedOut(partial) => (partial, None),
            RunOutcome::Failed { error, partial } => (partial, Some(error)),
            RunOutcome::Panicked(message) => return Err(WatchError::WorkerPanicked(message)),
        };
        // A detached worker never hands its state back.
        let state = state.unwrap_or_else(|| EventMatcher::new(pattern.clone()).into_state());

        Ok(Self {
            source,
            outcome: runner_state,
            lines_seen: state.lines_observed(),
            state,
            elapsed,
            exit_code: None,
            interrupted: false,
            force_killed: false,
            error,
        })
    }
}

impl fmt::Display for MonitorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({}/{} matched, {} lines, {})",
            self.source,
            self.outcome,
            self.state.matched_count(),
            self.state.pattern_len(),
            self.lines_seen,
            humantime::format_duration(round_millis(self.elapsed))
        )
    }
}

pub(crate) fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

pub(crate) fn serialize_error<S: Serializer>(
    error: &Option<WatchError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.collect_str(error),
        None => serializer.serialize_none(),
    }
}

/// A monitor process whose stdout is being captured for matching.
///
/// The deadline starts when [`MonitorSession::wait`] is called, so the
/// caller can trigger the events it expects between `start` and `wait`.
#[derive(Debug)]
pub struct MonitorSession {
    command: String,
    process: Arc<OwnedProcess>,
    output: NamedTempFile,
    tail: TailSession,
    pattern: EventPattern,
    config: WatchConfig,
}

impl MonitorSession {
    /// Spawn `command` with stdout redirected to a temporary file.
    pub fn start(
        command: &CommandSpec,
        pattern: EventPattern,
        config: &WatchConfig,
    ) -> Result<Self, WatchError> {
        let command_line = command.display();
        let output = NamedTempFile::new()?;
        let stdout = output.reopen()?;

        let mut cmd = command.to_command();
        cmd.stdout(Stdio::from(stdout));
        let process = OwnedProcess::spawn("monitor", &mut cmd).map_err(|source| WatchError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        let tail = TailSession::open(output.path())?;

        info!(
            command = %command_line,
            pid = process.pid(),
            output = %output.path().display(),
            elements = pattern.len(),
            "Monitor started"
        );
        Ok(Self {
            command: command_line,
            process: Arc::new(process),
            output,
            tail,
            pattern,
            config: *config,
        })
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// File the monitor's stdout is written to.
    pub fn output_path(&self) -> &Path {
        self.output.path()
    }

    /// Match the monitor's output until the pattern completes, the monitor
    /// exits, or the deadline expires, then stop the monitor.
    pub fn wait(self) -> Result<MonitorReport, WatchError> {
        let Self {
            command,
            process,
            output,
            tail,
            pattern,
            config,
        } = self;

        let mut runner = DeadlineRunner::new(config.runner_config());
        let matcher = EventMatcher::new(pattern.clone());
        let worker_process = Arc::clone(&process);
        let poll = config.poll_interval;
        let run = runner.run_with_process("monitor", Some(Arc::clone(&process)), move |cancel| {
            follow(tail, matcher, Some(worker_process.as_ref()), poll, &cancel)
        })?;

        // The monitor keeps running after a match; stop it either way.
        let status = process.shutdown(config.grace_period);
        debug!(output = %output.path().display(), ?status, "Monitor stopped");

        let mut report = MonitorReport::from_run(command, &pattern, run.outcome, run.elapsed)?;
        report.exit_code = status.and_then(|s| s.code());
        report.interrupted = process.was_interrupted();
        report.force_killed = process.was_killed();
        log_report(&report);
        Ok(report)
    }
}

/// Start `command` and wait for `pattern` in its stdout.
pub fn run_monitor(
    command: &CommandSpec,
    pattern: EventPattern,
    config: &WatchConfig,
) -> Result<MonitorReport, WatchError> {
    MonitorSession::start(command, pattern, config)?.wait()
}

/// Wait for `pattern` in a file some other process appends to.
pub fn watch_file(
    path: impl AsRef<Path>,
    pattern: EventPattern,
    config: &WatchConfig,
) -> Result<MonitorReport, WatchError> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let tail = TailSession::open(&path)?;
    info!(path = %path.display(), elements = pattern.len(), "Watching file");

    let mut runner = DeadlineRunner::new(config.runner_config());
    let matcher = EventMatcher::new(pattern.clone());
    let poll = config.poll_interval;
    let run = runner.run("watch", move |cancel| follow(tail, matcher, None, poll, &cancel))?;

    let report = MonitorReport::from_run(
        path.display().to_string(),
        &pattern,
        run.outcome,
        run.elapsed,
    )?;
    log_report(&report);
    Ok(report)
}

fn log_report(report: &MonitorReport) {
    if report.all_matched() {
        info!(report = %report, "All events observed");
    } else {
        warn!(
            report = %report,
            pending = ?report.state.pending_name(),
            "Pattern incomplete"
        );
    }
}

/// The tail loop shared by monitors and file watches.
fn follow(
    mut tail: TailSession,
    mut matcher: EventMatcher,
    process: Option<&OwnedProcess>,
    poll: Duration,
    cancel: &CancelToken,
) -> WorkResult<MatchState, WatchError> {
    loop {
        // Checked before draining so output written just before exit is seen.
        let exited = match process.map(OwnedProcess::try_wait).transpose() {
            Ok(status) => status.flatten().is_some(),
            Err(err) => return Err(Aborted::new(err.into(), Some(matcher.into_state()))),
        };

        while !matcher.is_complete() {
            match tail.poll() {
                Ok(Some(line)) => {
                    matcher.observe(&line);
                }
                Ok(None) => break,
                Err(err) => return Err(Aborted::new(err.into(), Some(matcher.into_state()))),
            }
        }

        if matcher.is_complete() {
            return Ok(matcher.into_state());
        }
        if exited {
            debug!(
                lines = tail.lines_yielded(),
                partial = tail.has_partial_line(),
                "Producer exited before the pattern completed"
            );
            return Ok(matcher.into_state());
        }
        if cancel.is_cancelled() {
            return Ok(matcher.into_state());
        }
        cancel.sleep(poll);
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use crate::matcher::Predicate;

    fn created_removed() -> EventPattern {
        EventPattern::new()
            .then("created", Predicate::contains("Unit created (reason: real)"))
            .then("removed", Predicate::contains("Unit removed (reason: real)"))
    }

    fn config(deadline: Duration) -> WatchConfig {
        WatchConfig::default()
            .with_deadline(deadline)
            .with_poll_interval(Duration::from_millis(50))
            .with_grace_period(Duration::from_secs(1))
    }

    #[test]
    fn test_monitor_observes_delayed_events_then_stops_process() {
        let command = CommandSpec::shell(
            "echo 'Monitor path: node-foo simple.service'; \
             echo 'Unit created (reason: real)'; \
             sleep 0.3; \
             echo 'Unit removed (reason: real)'; \
             exec sleep 30",
        );
        let report = run_monitor(&command, created_removed(), &config(Duration::from_secs(10))).unwrap();

        assert!(report.completed());
        assert!(report.all_matched());
        let created = report.state.reached(0).unwrap();
        let removed = report.state.reached(1).unwrap();
        assert!(created.reached_at <= removed.reached_at);
        assert!(created.line_number < removed.line_number);
        // Still running after the match, so teardown interrupted it.
        assert!(report.interrupted);
        assert!(report.elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_monitor_exit_before_pattern_completes() {
        let command = CommandSpec::shell("echo 'Unit created (reason: real)'; exit 4");
        let report = run_monitor(&command, created_removed(), &config(Duration::from_secs(10))).unwrap();

        assert!(report.completed());
        assert!(!report.all_matched());
        assert!(report.state.is_reached("created"));
        assert_eq!(report.exit_code, Some(4));
        assert!(!report.interrupted);
    }

    #[test]
    fn test_monitor_deadline_interrupts_silent_process() {
        let command = CommandSpec::new("sleep").arg("30");
        let report = run_monitor(&command, created_removed(), &config(Duration::from_millis(300))).unwrap();

        assert!(report.timed_out());
        assert_eq!(report.state.matched_count(), 0);
        assert!(report.interrupted);
        assert!(report.elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_session_exposes_output_before_wait() {
        let command = CommandSpec::shell("echo 'Unit created (reason: real)'; echo 'Unit removed (reason: real)'");
        let session = MonitorSession::start(&command, created_removed(), &config(Duration::from_secs(5))).unwrap();
        assert!(session.output_path().exists());
        assert!(session.pid() > 0);

        let report = session.wait().unwrap();
        assert!(report.all_matched());
    }

    #[test]
    fn test_spawn_failure_names_command() {
        let command = CommandSpec::new("/nonexistent/evwatch-monitor");
        let err = run_monitor(&command, created_removed(), &WatchConfig::default()).unwrap_err();
        assert!(matches!(err, WatchError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/evwatch-monitor"));
    }
}
