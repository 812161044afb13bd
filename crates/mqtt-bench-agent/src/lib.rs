//! mqtt-bench-agent - MQTT load-test agent for cloud instances
//!
//! Resolves the benchmark configuration from instance metadata and the
//! environment, installs emqtt-bench, tunes the host, runs the load test and
//! reports the outcome.

pub mod args;
pub mod error;
pub mod install;
pub mod logging;
pub mod packages;
pub mod platform;
pub mod process;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod service;
pub mod sources;
pub mod tuning;

#[cfg(test)]
mod testing;
