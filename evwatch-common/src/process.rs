//! Subprocesses owned by a watch and shared with its worker thread.
//!
//! The runner needs to signal a process while the worker is polling it for
//! exit, so the [`std::process::Child`] lives behind a mutex inside
//! [`OwnedProcess`] and both sides hold an `Arc` to it. Signals are delivered
//! through the `kill` utility to the child's process group, so shells and
//! their children are stopped together.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Signals the runner sends to an owned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Cooperative stop request (SIGINT).
    Interrupt,
    /// Forced termination (SIGKILL).
    Kill,
}

impl Signal {
    fn kill_arg(self) -> &'static str {
        match self {
            Self::Interrupt => "-INT",
            Self::Kill => "-KILL",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Failure to deliver a signal. Cleanup is best effort, so callers log these
/// rather than failing the watch.
#[derive(Debug, Error)]
pub enum ProcessSignalError {
    #[error("Failed to run kill to send {signal} to pid {pid}: {source}")]
    Deliver {
        pid: u32,
        signal: Signal,
        #[source]
        source: io::Error,
    },

    #[error("kill refused to send {signal} to pid {pid} (exit code {code:?})")]
    Rejected {
        pid: u32,
        signal: Signal,
        code: Option<i32>,
    },

    #[error("Failed to check state of pid {pid}: {source}")]
    Status {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// A program plus arguments to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Build from an argv vector; `None` when it is empty.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv.next()?;
        Some(Self {
            program,
            args: argv.collect(),
            env: Vec::new(),
        })
    }

    /// Run `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<OsString>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Build a [`Command`] in its own process group with stdin closed.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

/// A running child process shared between a runner and its worker.
///
/// Dropping the last handle force-kills and reaps the child if it is still
/// running, so no process outlives its watch.
#[derive(Debug)]
pub struct OwnedProcess {
    name: String,
    pid: u32,
    started_at: Instant,
    child: Mutex<Child>,
    stdout: Mutex<Option<ChildStdout>>,
    interrupted: AtomicBool,
    killed: AtomicBool,
}

impl OwnedProcess {
    /// Spawn `cmd` and take ownership of the child.
    pub fn spawn(name: &str, cmd: &mut Command) -> io::Result<Self> {
        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        info!(name, pid, "Process spawned");

        Ok(Self {
            name: name.to_string(),
            pid,
            started_at: Instant::now(),
            child: Mutex::new(child),
            stdout: Mutex::new(stdout),
            interrupted: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Take the piped stdout, if the command was spawned with one.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.stdout.lock().ok().and_then(|mut stdout| stdout.take())
    }

    /// Non-blocking exit check; reaps the child once it has exited.
    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        self.lock_child().try_wait()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Exit code once the process has exited; `None` while running or when
    /// it was terminated by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.try_wait().ok().flatten().and_then(|status| status.code())
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Ask the process to stop (SIGINT). Once the leader has exited only
    /// leftover members of its group are signalled, if any.
    pub fn interrupt(&self) -> Result<(), ProcessSignalError> {
        if self.send(Signal::Interrupt)? {
            self.interrupted.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Terminate the process and its group (SIGKILL).
    pub fn force_kill(&self) -> Result<(), ProcessSignalError> {
        if self.send(Signal::Kill)? {
            self.killed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Poll for exit until `timeout` elapses.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(interval.min(timeout.saturating_sub(start.elapsed())));
        }
    }

    /// Interrupt, wait up to `grace` for exit, then force-kill and reap.
    ///
    /// Signal failures are logged and the exit status, if any, is returned.
    pub fn shutdown(&self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.try_wait()
            && !self.group_alive()
        {
            return Some(status);
        }

        if let Err(err) = self.interrupt() {
            warn!(name = %self.name, pid = self.pid, error = %err, "Interrupt failed");
        }
        match self.wait_stopped(grace) {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(err) => warn!(name = %self.name, pid = self.pid, error = %err, "Wait failed"),
        }

        warn!(
            name = %self.name,
            pid = self.pid,
            ?grace,
            "Process ignored interrupt, escalating to SIGKILL"
        );
        if let Err(err) = self.force_kill() {
            warn!(name = %self.name, pid = self.pid, error = %err, "Force kill failed");
        }
        self.lock_child().wait().ok()
    }

    /// Returns whether a signal was actually sent.
    fn send(&self, signal: Signal) -> Result<bool, ProcessSignalError> {
        // Holding the lock keeps the worker from reaping the child, so the
        // pid cannot be reused between the exit check and the kill.
        let mut child = self.lock_child();
        let exited = child
            .try_wait()
            .map_err(|source| ProcessSignalError::Status {
                pid: self.pid,
                source,
            })?;
        if exited.is_some() {
            return self.send_to_leftovers(signal);
        }

        info!(name = %self.name, pid = self.pid, %signal, "Signalling process");
        let result = deliver_signal(self.pid, signal);
        if signal == Signal::Kill {
            // The leader may still be alive if the group signal failed.
            let _ = child.kill();
        }
        result.map(|()| true)
    }

    /// Signal processes left in the group after the leader exited.
    ///
    /// A group id is not reused while any member is alive, so this cannot hit
    /// an unrelated process. An empty group is a no-op.
    #[cfg(unix)]
    fn send_to_leftovers(&self, signal: Signal) -> Result<bool, ProcessSignalError> {
        match deliver_signal(self.pid, signal) {
            Ok(()) => {
                info!(name = %self.name, pid = self.pid, %signal, "Signalling leftover process group");
                Ok(true)
            }
            Err(ProcessSignalError::Rejected { .. }) => {
                debug!(name = %self.name, pid = self.pid, %signal, "Process already exited, not signalling");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    #[cfg(not(unix))]
    fn send_to_leftovers(&self, signal: Signal) -> Result<bool, ProcessSignalError> {
        debug!(name = %self.name, pid = self.pid, %signal, "Process already exited, not signalling");
        Ok(false)
    }

    /// Whether any process in the child's group is still running.
    ///
    /// Stays true after the leader exits while something it started in the
    /// background still holds on.
    pub fn group_alive(&self) -> bool {
        if matches!(self.try_wait(), Ok(None)) {
            return true;
        }
        group_exists(self.pid)
    }

    /// Poll until the leader and the rest of its group are gone, or `timeout` elapses.
    fn wait_stopped(&self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()?
                && !group_exists(self.pid)
            {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(GROUP_POLL.min(timeout.saturating_sub(start.elapsed())));
        }
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        // A panicking worker must not prevent cleanup of the child.
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for OwnedProcess {
    fn drop(&mut self) {
        let child = self
            .child
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(child.try_wait(), Ok(None)) {
            debug!(name = %self.name, pid = self.pid, "Killing process on drop");
            #[cfg(unix)]
            let _ = deliver_signal(self.pid, Signal::Kill);
            let _ = child.kill();
            let _ = child.wait();
        } else if group_exists(self.pid) {
            debug!(name = %self.name, pid = self.pid, "Killing leftover process group on drop");
            #[cfg(unix)]
            let _ = deliver_signal(self.pid, Signal::Kill);
        }
    }
}

const GROUP_POLL: Duration = Duration::from_millis(20);

/// Run `kill <arg> -- -<pid>`. A negative pid addresses the process group
/// created by `process_group(0)`.
#[cfg(unix)]
fn kill_group(pid: u32, arg: &str) -> io::Result<ExitStatus> {
    Command::new("kill")
        .arg(arg)
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
}

/// Signal 0 checks that the group has members without touching them.
#[cfg(unix)]
fn group_exists(pid: u32) -> bool {
    kill_group(pid, "-0").is_ok_and(|status| status.success())
}

#[cfg(not(unix))]
fn group_exists(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn deliver_signal(pid: u32, signal: Signal) -> Result<(), ProcessSignalError> {
    let status = kill_group(pid, signal.kill_arg())
        .map_err(|source| ProcessSignalError::Deliver {
            pid,
            signal,
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(ProcessSignalError::Rejected {
            pid,
            signal,
            code: status.code(),
        })
    }
}

#[cfg(not(unix))]
fn deliver_signal(pid: u32, signal: Signal) -> Result<(), ProcessSignalError> {
    // No signals here; the caller's `Child::kill` is the only lever.
    debug!(pid, %signal, arg = signal.kill_arg(), "Signals unsupported on this platform");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn(script: &str) -> OwnedProcess {
        let mut cmd = CommandSpec::shell(script).to_command();
        OwnedProcess::spawn("test", &mut cmd).unwrap()
    }

    #[test]
    fn test_command_spec_from_argv() {
        assert!(CommandSpec::from_argv(Vec::<String>::new()).is_none());
        let spec = CommandSpec::from_argv(["bluechictl", "monitor", "node-foo"]).unwrap();
        assert_eq!(spec.program, "bluechictl");
        assert_eq!(spec.args.len(), 2);
        assert_eq!(spec.display(), "bluechictl monitor node-foo");
    }

    #[test]
    fn test_exit_is_observed() {
        let process = spawn("exit 3");
        let status = process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(process.exit_code(), Some(3));
        assert!(!process.is_running());
    }

    #[test]
    fn test_interrupt_stops_sleeping_process() {
        let process = spawn("sleep 30");
        assert!(process.is_running());

        process.interrupt().unwrap();
        let status = process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .unwrap();
        assert!(status.is_some());
        assert!(process.was_interrupted());
        assert!(!process.was_killed());
    }

    #[test]
    fn test_shutdown_escalates_when_interrupt_is_ignored() {
        let process = spawn("trap '' INT; while true; do sleep 0.05; done");
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        let status = process.shutdown(Duration::from_millis(300));
        assert!(status.is_some());
        assert!(process.was_interrupted());
        assert!(process.was_killed());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_signalling_exited_process_is_noop() {
        let process = spawn("true");
        process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .unwrap();
        process.interrupt().unwrap();
        process.force_kill().unwrap();
        assert!(!process.was_interrupted());
        assert!(!process.was_killed());
    }

    #[cfg(target_os = "linux")]
    /// `$!` of the backgrounded sleep, read from the first stdout line.
    fn spawn_with_orphan(script: &str) -> (OwnedProcess, u32) {
        let mut cmd = CommandSpec::shell(script).to_command();
        cmd.stdout(Stdio::piped());
        let process = OwnedProcess::spawn("test", &mut cmd).unwrap();
        let mut stdout = io::BufReader::new(process.take_stdout().unwrap());
        let mut line = String::new();
        io::BufRead::read_line(&mut stdout, &mut line).unwrap();
        let orphan = line.trim().parse().unwrap();
        process
            .wait_timeout(Duration::from_secs(5), Duration::from_millis(10))
            .unwrap()
            .unwrap();
        (process, orphan)
    }

    #[cfg(target_os = "linux")]
    /// Running and not a zombie waiting for a reaper.
    fn pid_alive(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let state = stat.rsplit_once(") ")?.1.chars().next()?;
                Some(state != 'Z' && state != 'X')
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_signals_reach_group_after_leader_exits() {
        let (process, orphan) = spawn_with_orphan("sleep 30 & echo $!; exit 0");
        assert!(!process.is_running());
        assert!(process.group_alive());
        assert!(pid_alive(orphan));

        process.force_kill().unwrap();
        assert!(process.was_killed());
        let start = Instant::now();
        while pid_alive(orphan) && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!pid_alive(orphan));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_shutdown_stops_leftover_group() {
        let (process, orphan) = spawn_with_orphan("sleep 30 & echo $!; exit 0");

        let start = Instant::now();
        let status = process.shutdown(Duration::from_millis(200));
        assert_eq!(status.and_then(|s| s.code()), Some(0));
        assert!(process.was_interrupted());
        assert!(start.elapsed() < Duration::from_secs(5));

        let start = Instant::now();
        while pid_alive(orphan) && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!pid_alive(orphan));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_drop_kills_running_process() {
        let process = spawn("sleep 30");
        let pid = process.pid();
        drop(process);
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }
}
