//! Timing configuration shared by watches, monitors and probes.
//!
//! Values are layered: built-in defaults, then a TOML file, then `EVWATCH_*`
//! environment variables. Command-line flags are applied last by the caller.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::env::{EnvError, EnvParser};
use super::source::{ConfigSource, Sourced};
use crate::runner::RunnerConfig;

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

const MIN_DURATION: Duration = Duration::from_millis(1);
const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid environment: {}", format_env_errors(.0))]
    Environment(Vec<EnvError>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Deadline, poll interval and grace period for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Wall-clock budget for the whole observation.
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,
    /// Sleep between polls that found no new line.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long each cancellation step waits before escalating.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// On-disk layout: `[watch]` table plus an optional `log_level`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    watch: WatchConfig,
    log_level: Option<String>,
}

/// A [`WatchConfig`] plus where each value came from.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedConfig {
    pub deadline: Sourced<Duration>,
    pub poll_interval: Sourced<Duration>,
    pub grace_period: Sourced<Duration>,
    pub log_level: Sourced<String>,
}

impl LoadedConfig {
    pub fn watch(&self) -> WatchConfig {
        WatchConfig {
            deadline: self.deadline.value,
            poll_interval: self.poll_interval.value,
            grace_period: self.grace_period.value,
        }
    }
}

impl WatchConfig {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::new(self.deadline).with_grace_period(self.grace_period)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("deadline", self.deadline),
            ("poll_interval", self.poll_interval),
            ("grace_period", self.grace_period),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.poll_interval > self.deadline {
            return Err(ConfigError::Invalid(format!(
                "poll_interval ({}) exceeds deadline ({})",
                humantime::format_duration(self.poll_interval),
                humantime::format_duration(self.deadline)
            )));
        }
        Ok(())
    }

    /// Default config file location: `~/.config/evwatch/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("evwatch").join("config.toml"))
    }

    /// Load defaults, then `path` (or `EVWATCH_CONFIG`, or the default
    /// location if it exists), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let mut parser = EnvParser::new();
        let env_path = parser.get_optional_path("CONFIG").value;

        let (file, file_source) = match path.map(Path::to_path_buf).or(env_path) {
            Some(explicit) => {
                let file = read_config_file(&explicit)?;
                (file, ConfigSource::File(explicit))
            }
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(default) => {
                    let file = read_config_file(&default)?;
                    (file, ConfigSource::File(default))
                }
                None => (ConfigFile::default(), ConfigSource::Default),
            },
        };

        let defaults = WatchConfig::default();
        let layer = |env: Sourced<Duration>, file_value: Duration, default: Duration| {
            if !env.is_default() || file_value == default {
                env
            } else {
                Sourced::new(file_value, file_source.clone())
            }
        };

        let deadline = layer(
            parser.get_duration("DEADLINE", file.watch.deadline, MIN_DURATION, MAX_DURATION),
            file.watch.deadline,
            defaults.deadline,
        );
        let poll_interval = layer(
            parser.get_duration("POLL_INTERVAL", file.watch.poll_interval, MIN_DURATION, MAX_DURATION),
            file.watch.poll_interval,
            defaults.poll_interval,
        );
        let grace_period = layer(
            parser.get_duration("GRACE_PERIOD", file.watch.grace_period, MIN_DURATION, MAX_DURATION),
            file.watch.grace_period,
            defaults.grace_period,
        );

        let file_level = file.log_level.clone();
        let mut log_level = parser.get_log_level("LOG_LEVEL", file_level.as_deref().unwrap_or("info"));
        if log_level.is_default() && file_level.is_some() {
            log_level.source = file_source.clone();
        }

        let errors = parser.take_errors();
        if !errors.is_empty() {
            return Err(ConfigError::Environment(errors));
        }

        let loaded = LoadedConfig {
            deadline,
            poll_interval,
            grace_period,
            log_level,
        };
        loaded.watch().validate()?;
        debug!(config = ?loaded.watch(), source = %file_source, "Loaded watch config");
        Ok(loaded)
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Serde adapter for durations written as `"500ms"` / `"10s"`.
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(de::Error::custom)
    }
}
