//! One-shot status probes bounded by a deadline.
//!
//! A probe is a command expected to print nothing while the watched system is
//! healthy and to print something (then exit) once it is not. Running it
//! under a deadline turns "nothing happened in time" into a clean
//! [`RunnerState::TimedOut`] with no result instead of a hung test.

use std::fmt;
use std::io::Read;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::WatchConfig;
use crate::config::watch::humantime_serde;
use crate::monitor::{WatchError, round_millis, serialize_error};
use crate::process::{CommandSpec, OwnedProcess};
use crate::runner::{Aborted, DeadlineRunner, RunOutcome, RunnerState};

/// What a probe printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "text")]
pub enum ProbeResult {
    /// Exited (or was stopped) with only whitespace on stdout.
    NoOutput,
    Output(String),
}

impl ProbeResult {
    pub fn from_output(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        if text.trim().is_empty() {
            Self::NoOutput
        } else {
            Self::Output(text.into_owned())
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::NoOutput => None,
            Self::Output(text) => Some(text),
        }
    }

    pub fn has_output(&self) -> bool {
        matches!(self, Self::Output(_))
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub command: String,
    pub outcome: RunnerState,
    /// `None` when the deadline expired before the probe produced anything.
    pub result: Option<ProbeResult>,
    pub exit_code: Option<i32>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub interrupted: bool,
    pub force_killed: bool,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<WatchError>,
}

impl ProbeReport {
    pub fn completed(&self) -> bool {
        self.outcome == RunnerState::Completed
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == RunnerState::TimedOut
    }

    /// Printed text, if any.
    pub fn output(&self) -> Option<&str> {
        self.result.as_ref().and_then(ProbeResult::text)
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match &self.result {
            None => "no result",
            Some(ProbeResult::NoOutput) => "no output",
            Some(ProbeResult::Output(_)) => "output",
        };
        write!(
            f,
            "{}: {} ({result}, {})",
            self.command,
            self.outcome,
            humantime::format_duration(round_millis(self.elapsed))
        )
    }
}

/// A command plus the timings to run it with.
#[derive(Debug, Clone)]
pub struct Probe {
    command: CommandSpec,
    config: WatchConfig,
}

impl Probe {
    pub fn new(command: CommandSpec, config: &WatchConfig) -> Self {
        Self {
            command,
            config: *config,
        }
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    /// Run the probe until it exits or the deadline expires.
    pub fn run(&self) -> Result<ProbeReport, WatchError> {
        let command_line = self.command.display();
        let mut cmd = self.command.to_command();
        cmd.stdout(Stdio::piped());
        let process = Arc::new(OwnedProcess::spawn("probe", &mut cmd).map_err(|source| {
            WatchError::Spawn {
                command: command_line.clone(),
                source,
            }
        })?);
        let stdout = process.take_stdout();
        let worker_process = Arc::clone(&process);
        let poll = self.config.poll_interval;

        let mut runner = DeadlineRunner::new(self.config.runner_config());
        let run = runner.run_with_process("probe", Some(Arc::clone(&process)), move |cancel| {
            let mut output = Vec::new();
            // Blocks until the probe closes stdout; interrupting it on timeout
            // is what unblocks this read.
            if let Some(mut stdout) = stdout
                && let Err(err) = stdout.read_to_end(&mut output)
            {
                let partial = Some(ProbeResult::from_output(&output));
                return Err(Aborted::new(WatchError::Io(err), partial));
            }

            loop {
                match worker_process.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => {}
                    Err(err) => {
                        let partial = Some(ProbeResult::from_output(&output));
                        return Err(Aborted::new(WatchError::Io(err), partial));
                    }
                }
                if cancel.sleep(poll) {
                    break;
                }
            }

            let result = ProbeResult::from_output(&output);
            if cancel.is_cancelled() && !result.has_output() {
                debug!("Probe stopped before printing anything");
                return Err(Aborted::new(WatchError::Cancelled, None));
            }
            Ok(result)
        })?;

        let status = process.shutdown(self.config.grace_period);
        let outcome = run.outcome.state();
        let (result, error) = match run.outcome {
            RunOutcome::Completed(result) => (Some(result), None),
            RunOutcome::TimedOut(partial) => (partial, None),
            RunOutcome::Failed { error, partial } => (partial, Some(error)),
            RunOutcome::Panicked(message) => return Err(WatchError::WorkerPanicked(message)),
        };

        let report = ProbeReport {
            command: command_line,
            outcome,
            result,
            exit_code: status.and_then(|s| s.code()),
            elapsed: run.elapsed,
            interrupted: process.was_interrupted(),
            force_killed: process.was_killed(),
            error,
        };
        info!(report = %report, "Probe finished");
        Ok(report)
    }
}


#[cfg(all(test, unix))]
mod process_tests {
    use super::*;

    fn config(deadline: Duration) -> WatchConfig {
        WatchConfig::default()
            .with_deadline(deadline)
            .with_poll_interval(Duration::from_millis(50))
            .with_grace_period(Duration::from_millis(500))
    }

    #[test]
    fn test_silent_probe_times_out_without_result() {
        let config = config(Duration::from_secs(2));
        let probe = Probe::new(CommandSpec::new("sleep").arg("30"), &config);
        let report = probe.run().unwrap();

        assert!(report.timed_out());
        assert!(report.result.is_none());
        assert!(report.interrupted);
        assert!(report.elapsed < config.deadline + config.poll_interval + config.grace_period);
    }

    #[test]
    fn test_probe_reports_output_and_exit_code() {
        let probe = Probe::new(
            CommandSpec::shell("echo 'node-foo: offline'; exit 1"),
            &config(Duration::from_secs(5)),
        );
        let report = probe.run().unwrap();

        assert!(report.completed());
        assert_eq!(report.output(), Some("node-foo: offline\n"));
        assert_eq!(report.exit_code, Some(1));
        assert!(!report.interrupted);
    }

    #[test]
    fn test_quiet_probe_completes_with_no_output() {
        let probe = Probe::new(CommandSpec::new("true"), &config(Duration::from_secs(5)));
        let report = probe.run().unwrap();

        assert!(report.completed());
        assert_eq!(report.result, Some(ProbeResult::NoOutput));
        assert_eq!(report.exit_code, Some(0));
    }

    #[test]
    fn test_background_child_is_stopped_on_timeout() {
        // The shell exits at once; its background job keeps stdout open.
        let config = config(Duration::from_millis(500)).with_grace_period(Duration::from_millis(300));
        let report = Probe::new(CommandSpec::shell("sleep 3 & exit 0"), &config)
            .run()
            .unwrap();

        assert!(report.timed_out());
        assert!(report.result.is_none());
        assert!(report.interrupted);
        assert!(report.force_killed);
        assert!(report.elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_partial_output_survives_timeout() {
        let probe = Probe::new(
            CommandSpec::shell("echo 'still checking'; exec sleep 30"),
            &config(Duration::from_millis(300)),
        );
        let report = probe.run().unwrap();

        assert!(report.timed_out());
        assert_eq!(report.output(), Some("still checking\n"));
    }
}
