//! mqtt-bench-common - Shared types for the load-test agent
//!
//! Pure data with no I/O: the typed configuration record, option names,
//! test modes, defaults, and the execution result.
//!
//! ## Modules
//!
//! - [`config`]: Resolved configuration record
//! - [`defaults`]: Default configuration values
//! - [`mode`]: Test modes, emqtt-bench sub-commands, install methods
//! - [`option_key`]: Recognized option names and their env var mapping
//! - [`run_result`]: Outcome of a load-test run

pub mod config;
pub mod defaults;
pub mod mode;
pub mod option_key;
pub mod run_result;

pub use config::BenchConfig;
pub use mode::{InstallMethod, SubCommand, TestMode};
pub use option_key::OptionKey;
pub use run_result::ExecutionResult;

/// Timestamp used in per-run log file names, e.g. `20240131-154502`
pub fn file_timestamp() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}
