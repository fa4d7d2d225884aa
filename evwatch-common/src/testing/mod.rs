//! Test support shared by unit and integration tests.

pub mod scenario;

pub use scenario::{ScenarioLog, ScenarioMark, ScenarioStep, init_global_test_logging};
