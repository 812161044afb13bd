//! Agent error types
//!
//! Typed errors for the fatal conditions callers need to tell apart.
//! Orchestration code wraps them in `anyhow` with context.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration resolution errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// broker-host was not supplied by metadata or the environment
    #[error("broker-host is required but was not found in instance metadata or BROKER_HOST")]
    MissingBrokerHost,

    /// Resolved record failed validation
    #[error("invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

/// Host preparation errors
#[derive(Debug, Error)]
pub enum PrepareError {
    /// CPU architecture has no emqtt-bench build
    #[error("unsupported architecture: {0} (expected x86_64/amd64 or aarch64/arm64)")]
    UnsupportedArchitecture(String),

    /// Every download location failed
    #[error("failed to download {artifact} from {attempts} location(s)")]
    DownloadExhausted { artifact: String, attempts: usize },

    /// Build finished without producing the launcher
    #[error("build output missing: {}", .0.display())]
    BuildOutputMissing(PathBuf),

    /// Release archive did not contain the launcher
    #[error("emqtt-bench binary not found at {} after installation", .0.display())]
    BinaryMissing(PathBuf),

    /// No supported package manager on this host
    #[error("no supported package manager found (apt-get, dnf, yum)")]
    NoPackageManager,

    /// Package-manager operation kept failing
    #[error("package manager {operation} failed after {attempts} attempt(s)")]
    PackageOperationFailed { operation: String, attempts: u32 },
}

/// Test execution errors
#[derive(Debug, Error)]
pub enum RunError {
    /// Background subscriber died before publishing started
    #[error("subscriber exited during the {settle_secs}s settle period (exit code {exit_code})")]
    SubscriberExited { settle_secs: u64, exit_code: i32 },

    /// Process could not be started
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
