//! evwatch - wait for ordered events with a deadline
//!
//! Shell-facing front end for end-to-end test suites: follow a log file or a
//! monitor command until an ordered list of lines shows up, or run a probe
//! that should stay quiet, all bounded by a wall-clock deadline.
//!
//! Exit codes: 0 completed, 2 timed out (or pattern incomplete), 1 error.

#![forbid(unsafe_code)]

mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use evwatch_common::{
    CommandSpec, EventPattern, LogConfig, Probe, WatchConfig, init_logging, run_monitor,
    watch_file,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "evwatch")]
#[command(author, version, about = "Wait for ordered events in a log stream, with a deadline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the report as a single JSON object
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ~/.config/evwatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a file another process appends to
    Watch {
        /// File to follow; must already exist
        file: PathBuf,

        #[command(flatten)]
        pattern: PatternArgs,

        #[command(flatten)]
        timing: TimingArgs,
    },

    /// Run a monitor command and match its stdout
    ///
    /// The command is stopped with SIGINT once the pattern completes or the
    /// deadline expires.
    Monitor {
        #[command(flatten)]
        pattern: PatternArgs,

        #[command(flatten)]
        timing: TimingArgs,

        /// Monitor command and its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Run a probe that prints only when something is wrong
    ///
    /// Completes when the probe exits; times out (exit 2) when it is still
    /// silent at the deadline.
    Probe {
        #[command(flatten)]
        timing: TimingArgs,

        /// Probe command and its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Show the effective timing configuration and where each value came from
    Config,
}

#[derive(Args)]
struct PatternArgs {
    /// Expected line, in order; repeat for each event
    #[arg(short, long = "expect", value_name = "PATTERN", required = true)]
    expect: Vec<String>,

    /// Treat each --expect as a regular expression instead of a substring
    #[arg(long)]
    regex: bool,
}

impl PatternArgs {
    fn build(&self) -> Result<EventPattern> {
        if self.regex {
            EventPattern::regex_all(&self.expect).context("Invalid --expect regex")
        } else {
            Ok(EventPattern::contains_all(self.expect.iter().cloned()))
        }
    }
}

#[derive(Args)]
struct TimingArgs {
    /// Deadline for the whole run, e.g. "10s"
    #[arg(short, long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Sleep between polls, e.g. "500ms"
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    poll: Option<Duration>,
}

impl TimingArgs {
    fn apply(&self, mut config: WatchConfig) -> Result<WatchConfig> {
        if let Some(timeout) = self.timeout {
            config = config.with_deadline(timeout);
        }
        if let Some(poll) = self.poll {
            config = config.with_poll_interval(poll);
        }
        config.validate()?;
        Ok(config)
    }
}

fn command_spec(argv: &[String]) -> Result<CommandSpec> {
    match CommandSpec::from_argv(argv) {
        Some(spec) => Ok(spec),
        None => bail!("No command given after --"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = WatchConfig::load(cli.config.as_deref())?;

    let mut log_config = LogConfig::from_env(&loaded.log_level.value).with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let logging_guards = init_logging(&log_config)?;
    debug!(config = ?loaded.watch(), "Effective configuration");

    let code = match cli.command {
        Commands::Watch {
            file,
            pattern,
            timing,
        } => {
            let config = timing.apply(loaded.watch())?;
            let report = watch_file(&file, pattern.build()?, &config)
                .with_context(|| format!("Failed to watch {}", file.display()))?;
            output::print_monitor(&report, cli.json)?;
            output::monitor_exit_code(&report)
        }

        Commands::Monitor {
            pattern,
            timing,
            command,
        } => {
            let config = timing.apply(loaded.watch())?;
            let report = run_monitor(&command_spec(&command)?, pattern.build()?, &config)?;
            output::print_monitor(&report, cli.json)?;
            output::monitor_exit_code(&report)
        }

        Commands::Probe { timing, command } => {
            let config = timing.apply(loaded.watch())?;
            let report = Probe::new(command_spec(&command)?, &config).run()?;
            output::print_probe(&report, cli.json)?;
            output::probe_exit_code(&report)
        }

        Commands::Config => {
            output::print_config(&loaded, cli.json)?;
            0
        }
    };

    if code != 0 {
        drop(logging_guards);
        std::process::exit(code);
    }
    Ok(())
}
