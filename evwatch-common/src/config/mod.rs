//! Configuration for evwatch.
//!
//! - Environment variable parsing with type safety (`EVWATCH_*`)
//! - TOML config file with human-readable durations
//! - Source tracking for debugging
//! - Validation before a watch starts

pub mod env;
pub mod source;
pub mod watch;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};
pub use watch::{
    ConfigError, DEFAULT_DEADLINE, DEFAULT_GRACE_PERIOD, DEFAULT_POLL_INTERVAL, LoadedConfig,
    WatchConfig,
};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
