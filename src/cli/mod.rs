//! Command-line interface for plugin-runner.
//!
//! Provides the consumer (`run`) plus operator commands for enqueueing,
//! migrations, failed-job inspection and plugin instrumentation.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
