//! Deadline-bounded observation of growing text streams.
//!
//! The pieces compose bottom-up:
//!
//! - [`tail`]: complete lines appended to a file, each delivered once
//! - [`matcher`]: an ordered pattern of line predicates with noise skipped
//! - [`runner`]: work on its own thread raced against a deadline, with
//!   cooperative cancellation and an owned process to interrupt
//! - [`monitor`] and [`probe`]: the two end-to-end shapes built from them
//!
//! [`config`], [`logging`] and [`testing`] carry the ambient setup.

pub mod config;
pub mod logging;
pub mod matcher;
pub mod monitor;
pub mod probe;
pub mod process;
pub mod runner;
pub mod tail;
pub mod testing;

pub use config::{ConfigError, LoadedConfig, WatchConfig};
pub use logging::{LogConfig, LoggingGuards, init_logging};
pub use matcher::{EventMatcher, EventPattern, MatchState, MatchedEvent, Predicate};
pub use monitor::{MonitorReport, MonitorSession, WatchError, run_monitor, watch_file};
pub use probe::{Probe, ProbeReport, ProbeResult};
pub use process::{CommandSpec, OwnedProcess, ProcessSignalError, Signal};
pub use runner::{
    Aborted, CancelToken, DeadlineRunner, RunOutcome, RunReport, RunnerConfig, RunnerState,
    TaskHandle, dispatch,
};
pub use tail::{TailError, TailSession};
