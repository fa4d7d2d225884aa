//! Deadline-bounded execution of a unit of work on its own thread.
//!
//! [`dispatch`] starts the work on a named thread and returns a
//! [`TaskHandle`]: a single-write result cell (a one-slot channel) plus a
//! [`CancelToken`]. [`DeadlineRunner`] races that handle against a wall-clock
//! deadline:
//!
//! ```text
//! Idle -> Running -> Completed      worker finished in time, nothing signalled
//!                 -> TimedOut       deadline hit: cancel token tripped, owned
//!                                   process interrupted, then force-killed
//!                 -> Failed         worker gave up with an error
//! ```
//!
//! Cancellation is cooperative. The runner never unwinds the worker; it waits
//! a grace period for the worker to notice the token (or the death of its
//! subprocess) and hand back a partial result, and detaches it if it never
//! does.

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::process::OwnedProcess;

/// Shared cancellation flag checked by workers between polls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early once cancelled.
    ///
    /// Returns `true` if the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(10);
        let start = Instant::now();
        while !self.is_cancelled() {
            let elapsed = start.elapsed();
            if elapsed >= duration {
                return false;
            }
            thread::sleep(SLICE.min(duration - elapsed));
        }
        true
    }
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Running,
    Completed,
    TimedOut,
    Failed,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A worker that stopped early with an error, plus whatever it had so far.
#[derive(Debug)]
pub struct Aborted<T, E> {
    pub error: E,
    pub partial: Option<T>,
}

impl<T, E> Aborted<T, E> {
    pub fn new(error: E, partial: Option<T>) -> Self {
        Self { error, partial }
    }
}

/// What a worker hands back through the result cell.
pub type WorkResult<T, E> = Result<T, Aborted<T, E>>;

/// Terminal result of a run.
#[derive(Debug)]
pub enum RunOutcome<T, E> {
    /// The worker finished before the deadline.
    Completed(T),
    /// The deadline expired. Holds the partial result if the worker handed
    /// one back during the grace period.
    TimedOut(Option<T>),
    /// The worker gave up with an error before the deadline.
    Failed { error: E, partial: Option<T> },
    /// The worker thread panicked without producing a result.
    Panicked(String),
}

impl<T, E> RunOutcome<T, E> {
    pub fn state(&self) -> RunnerState {
        match self {
            Self::Completed(_) => RunnerState::Completed,
            Self::TimedOut(_) => RunnerState::TimedOut,
            Self::Failed { .. } | Self::Panicked(_) => RunnerState::Failed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }

    /// The full or partial result, whichever exists.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::TimedOut(partial) | Self::Failed { partial, .. } => partial.as_ref(),
            Self::Panicked(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::TimedOut(partial) | Self::Failed { partial, .. } => partial,
            Self::Panicked(_) => None,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Result of a bounded wait on a [`TaskHandle`].
#[derive(Debug)]
pub enum WaitStatus<T, E> {
    Ready(WorkResult<T, E>),
    Pending,
    /// The worker ended without writing a result.
    Lost(String),
}

/// Handle to work running on its own thread.
pub struct TaskHandle<T, E> {
    name: String,
    result: Receiver<WorkResult<T, E>>,
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("elapsed", &self.started_at.elapsed())
            .finish()
    }
}

/// Start `work` on a new thread named after `name`.
///
/// The worker receives a [`CancelToken`] it should check between polls.
pub fn dispatch<T, E, F>(name: &str, work: F) -> io::Result<TaskHandle<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce(CancelToken) -> WorkResult<T, E> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();

    let thread = thread::Builder::new()
        .name(format!("evwatch-{name}"))
        .spawn(move || {
            // The receiver may be gone if the runner detached; nothing to do then.
            let _ = tx.send(work(worker_cancel));
        })?;

    debug!(task = name, "Worker dispatched");
    Ok(TaskHandle {
        name: name.to_string(),
        result: rx,
        cancel,
        thread: Some(thread),
        started_at: Instant::now(),
    })
}

impl<T, E> TaskHandle<T, E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait up to `timeout` for the worker's result.
    pub fn wait_timeout(&mut self, timeout: Duration) -> WaitStatus<T, E> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => {
                self.join();
                WaitStatus::Ready(result)
            }
            Err(RecvTimeoutError::Timeout) => WaitStatus::Pending,
            Err(RecvTimeoutError::Disconnected) => WaitStatus::Lost(self.join_panic()),
        }
    }

    /// Join a worker that already wrote its result; returns promptly.
    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn join_panic(&mut self) -> String {
        match self.thread.take().map(JoinHandle::join) {
            Some(Err(payload)) => panic_message(payload.as_ref()),
            _ => "worker exited without a result".to_string(),
        }
    }

    /// Give up on the worker; its thread keeps running until it notices.
    fn detach(mut self) {
        if let Some(thread) = self.thread.take() {
            warn!(
                task = %self.name,
                thread = ?thread.thread().name(),
                "Worker did not stop within grace period, detaching"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Deadline and cancellation timings for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Wall-clock budget for the work.
    pub deadline: Duration,
    /// How long each cancellation step waits for the worker to return.
    pub grace_period: Duration,
}

impl RunnerConfig {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            grace_period: Duration::from_secs(2),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// What happened during a run, for reporting and assertions.
#[derive(Debug)]
pub struct RunReport<T, E> {
    pub outcome: RunOutcome<T, E>,
    pub elapsed: Duration,
    /// The owned process was sent SIGINT by the runner.
    pub interrupted: bool,
    /// The owned process had to be force-killed by the runner.
    pub force_killed: bool,
}

impl<T, E> RunReport<T, E> {
    pub fn state(&self) -> RunnerState {
        self.outcome.state()
    }
}

/// Races a worker against a deadline.
#[derive(Debug, Clone)]
pub struct DeadlineRunner {
    config: RunnerConfig,
    state: RunnerState,
}

impl DeadlineRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            state: RunnerState::Idle,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// State after the most recent run (`Idle` before any).
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Run `work` with no owned subprocess.
    pub fn run<T, E, F>(&mut self, name: &str, work: F) -> io::Result<RunReport<T, E>>
    where
        T: Send + 'static,
        E: Send + fmt::Display + 'static,
        F: FnOnce(CancelToken) -> WorkResult<T, E> + Send + 'static,
    {
        self.run_with_process(name, None, work)
    }

    /// Run `work`, signalling `process` if the deadline expires.
    pub fn run_with_process<T, E, F>(
        &mut self,
        name: &str,
        process: Option<Arc<OwnedProcess>>,
        work: F,
    ) -> io::Result<RunReport<T, E>>
    where
        T: Send + 'static,
        E: Send + fmt::Display + 'static,
        F: FnOnce(CancelToken) -> WorkResult<T, E> + Send + 'static,
    {
        let start = Instant::now();
        let mut handle = dispatch(name, work)?;
        self.transition(name, RunnerState::Running);

        let mut interrupted = false;
        let mut force_killed = false;

        let outcome = match handle.wait_timeout(self.config.deadline) {
            WaitStatus::Ready(Ok(value)) => RunOutcome::Completed(value),
            WaitStatus::Ready(Err(aborted)) => {
                warn!(task = name, error = %aborted.error, "Worker aborted");
                RunOutcome::Failed {
                    error: aborted.error,
                    partial: aborted.partial,
                }
            }
            WaitStatus::Lost(message) => {
                warn!(task = name, %message, "Worker panicked");
                RunOutcome::Panicked(message)
            }
            WaitStatus::Pending => {
                warn!(
                    task = name,
                    deadline = ?self.config.deadline,
                    "Deadline expired, cancelling worker"
                );
                handle.cancel();
                if let Some(process) = &process {
                    if let Err(err) = process.interrupt() {
                        warn!(task = name, error = %err, "Failed to interrupt process");
                    }
                    interrupted = process.was_interrupted();
                }

                let mut status = handle.wait_timeout(self.config.grace_period);
                if matches!(status, WaitStatus::Pending)
                    && let Some(process) = &process
                {
                    warn!(task = name, pid = process.pid(), "Escalating to SIGKILL");
                    if let Err(err) = process.force_kill() {
                        warn!(task = name, error = %err, "Failed to kill process");
                    }
                    force_killed = process.was_killed();
                    status = handle.wait_timeout(self.config.grace_period);
                }

                match status {
                    WaitStatus::Ready(Ok(partial)) => RunOutcome::TimedOut(Some(partial)),
                    WaitStatus::Ready(Err(aborted)) => {
                        debug!(task = name, error = %aborted.error, "Worker aborted after cancellation");
                        RunOutcome::TimedOut(aborted.partial)
                    }
                    WaitStatus::Lost(message) => {
                        warn!(task = name, %message, "Worker panicked after cancellation");
                        RunOutcome::TimedOut(None)
                    }
                    WaitStatus::Pending => {
                        handle.detach();
                        RunOutcome::TimedOut(None)
                    }
                }
            }
        };

        self.transition(name, outcome.state());
        Ok(RunReport {
            outcome,
            elapsed: start.elapsed(),
            interrupted,
            force_killed,
        })
    }

    fn transition(&mut self, name: &str, next: RunnerState) {
        info!(task = name, from = %self.state, to = %next, "Runner state change");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: Duration = Duration::from_millis(200);

    fn runner(deadline: Duration) -> DeadlineRunner {
        DeadlineRunner::new(RunnerConfig::new(deadline).with_grace_period(UNIT))
    }

    #[test]
    fn test_fast_worker_completes() {
        let mut runner = runner(UNIT * 2);
        assert_eq!(runner.state(), RunnerState::Idle);

        let report = runner
            .run("fast", |_cancel| -> WorkResult<u32, String> {
                thread::sleep(UNIT);
                Ok(42)
            })
            .unwrap();

        assert!(report.outcome.is_completed());
        assert_eq!(report.outcome.value(), Some(&42));
        assert_eq!(runner.state(), RunnerState::Completed);
        assert!(!report.interrupted);
    }

    #[test]
    fn test_stuck_worker_times_out_promptly() {
        let mut runner = runner(UNIT * 2);
        let report = runner
            .run("stuck", |cancel| -> WorkResult<u32, String> {
                let mut polls = 0;
                while !cancel.sleep(Duration::from_millis(20)) {
                    polls += 1;
                }
                Ok(polls)
            })
            .unwrap();

        assert!(report.outcome.is_timed_out());
        assert!(report.outcome.value().is_some(), "partial result expected");
        assert!(report.elapsed < UNIT * 2 + UNIT);
        assert_eq!(runner.state(), RunnerState::TimedOut);
    }

    #[test]
    fn test_uncooperative_worker_is_detached() {
        let mut runner = runner(UNIT);
        let start = Instant::now();
        let report = runner
            .run("deaf", |_cancel| -> WorkResult<(), String> {
                thread::sleep(Duration::from_secs(3));
                Ok(())
            })
            .unwrap();

        assert!(matches!(report.outcome, RunOutcome::TimedOut(None)));
        // deadline + one grace period (no process to escalate on)
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_worker_error_is_preserved() {
        let mut runner = runner(UNIT * 5);
        let report = runner
            .run("broken", |_cancel| -> WorkResult<u32, String> {
                Err(Aborted::new("file truncated".to_string(), Some(1)))
            })
            .unwrap();

        assert_eq!(report.state(), RunnerState::Failed);
        assert_eq!(report.outcome.error().map(String::as_str), Some("file truncated"));
        assert_eq!(report.outcome.into_value(), Some(1));
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let mut runner = runner(UNIT * 5);
        let report = runner
            .run("panics", |_cancel| -> WorkResult<u32, String> {
                panic!("boom");
            })
            .unwrap();

        match report.outcome {
            RunOutcome::Panicked(message) => assert_eq!(message, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_cancel_token_sleep_wakes_early() {
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        let start = Instant::now();
        assert!(token.sleep(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        canceller.join().unwrap();
    }

    #[test]
    fn test_dispatch_handle_bounded_wait() {
        let mut handle = dispatch("handle", |cancel| -> WorkResult<bool, String> {
            while !cancel.sleep(Duration::from_millis(10)) {}
            Ok(true)
        })
        .unwrap();

        assert!(matches!(handle.wait_timeout(Duration::from_millis(50)), WaitStatus::Pending));
        handle.cancel();
        assert!(matches!(
            handle.wait_timeout(Duration::from_secs(1)),
            WaitStatus::Ready(Ok(true))
        ));
    }
}

#[cfg(all(test, unix))]
mod process_tests {
    use super::*;
    use crate::process::CommandSpec;

    #[test]
    fn test_timeout_interrupts_owned_process() {
        let mut cmd = CommandSpec::new("sleep").arg("30").to_command();
        let process = Arc::new(OwnedProcess::spawn("sleeper", &mut cmd).unwrap());
        let worker_process = Arc::clone(&process);

        let mut runner = DeadlineRunner::new(
            RunnerConfig::new(Duration::from_millis(300)).with_grace_period(Duration::from_secs(2)),
        );
        let report = runner
            // Keeps polling after cancellation until the process actually exits.
            .run_with_process("sleeper", Some(Arc::clone(&process)), move |_cancel| {
                loop {
                    match worker_process.try_wait() {
                        Ok(Some(status)) => return Ok(status.code()),
                        Ok(None) => thread::sleep(Duration::from_millis(20)),
                        Err(err) => return Err(Aborted::new(err, None)),
                    }
                }
            })
            .unwrap();

        assert!(report.outcome.is_timed_out());
        assert!(report.interrupted);
        assert!(!report.force_killed);
        assert!(process.was_interrupted());
        assert!(report.elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_ignored_interrupt_escalates_to_kill() {
        let mut cmd = CommandSpec::shell("trap '' INT; while true; do sleep 0.05; done").to_command();
        let process = Arc::new(OwnedProcess::spawn("stubborn", &mut cmd).unwrap());
        let worker_process = Arc::clone(&process);

        let mut runner = DeadlineRunner::new(
            RunnerConfig::new(Duration::from_millis(200)).with_grace_period(Duration::from_millis(300)),
        );
        let report = runner
            .run_with_process("stubborn", Some(Arc::clone(&process)), move |_cancel| {
                loop {
                    match worker_process.try_wait() {
                        Ok(Some(_)) => return Ok(()),
                        Ok(None) => thread::sleep(Duration::from_millis(20)),
                        Err(err) => return Err(Aborted::new(err, None)),
                    }
                }
            })
            .unwrap();

        assert!(report.outcome.is_timed_out());
        assert!(report.interrupted);
        assert!(report.force_killed);
        assert!(!process.is_running());
    }
}
