//! Report rendering and exit codes.

use anyhow::Result;
use evwatch_common::{LoadedConfig, MonitorReport, ProbeReport, ProbeResult, RunnerState};
use serde::Serialize;

pub const EXIT_INCOMPLETE: i32 = 2;
pub const EXIT_FAILED: i32 = 1;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub fn print_monitor(report: &MonitorReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    for index in 0..report.state.pattern_len() {
        match report.state.reached(index) {
            Some(event) => println!(
                "matched  {} (line {}, {})",
                event.name,
                event.line_number,
                event.reached_at.format("%H:%M:%S%.3f")
            ),
            None => {
                let name = report.state.name(index).unwrap_or_default();
                if index == report.state.next_index() {
                    println!("waiting  {name}");
                } else {
                    println!("pending  {name}");
                }
            }
        }
    }
    if let Some(error) = &report.error {
        println!("error    {error}");
    }
    println!("{report}");
    Ok(())
}

/// 0 only when every element matched; a failed tail is an error.
pub fn monitor_exit_code(report: &MonitorReport) -> i32 {
    match report.outcome {
        RunnerState::Failed => EXIT_FAILED,
        _ if report.all_matched() => 0,
        _ => EXIT_INCOMPLETE,
    }
}

pub fn print_probe(report: &ProbeReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    match &report.result {
        Some(ProbeResult::Output(text)) => print!("{text}"),
        Some(ProbeResult::NoOutput) | None => {}
    }
    if let Some(error) = &report.error {
        println!("error    {error}");
    }
    println!("{report}");
    Ok(())
}

pub fn probe_exit_code(report: &ProbeReport) -> i32 {
    match report.outcome {
        RunnerState::Completed => 0,
        RunnerState::TimedOut => EXIT_INCOMPLETE,
        _ => EXIT_FAILED,
    }
}

pub fn print_config(loaded: &LoadedConfig, json: bool) -> Result<()> {
    if json {
        return print_json(loaded);
    }

    for (name, value, source) in [
        ("deadline", humantime::format_duration(loaded.deadline.value).to_string(), &loaded.deadline.source),
        (
            "poll_interval",
            humantime::format_duration(loaded.poll_interval.value).to_string(),
            &loaded.poll_interval.source,
        ),
        (
            "grace_period",
            humantime::format_duration(loaded.grace_period.value).to_string(),
            &loaded.grace_period.source,
        ),
        ("log_level", loaded.log_level.value.clone(), &loaded.log_level.source),
    ] {
        println!("{name:<14} {value:<10} ({source})");
    }
    Ok(())
}
