//! Outcome of one load-test run
//!
//! Created by the test runner when the run completes and never modified
//! afterwards; the reporter serializes it into the run summary.

use crate::mode::TestMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of a single load-test run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// Mode that was run
    pub mode: TestMode,
    /// Final exit code (timeouts in subscribe mode are already normalized to 0)
    pub exit_code: i32,
    /// Combined test log
    pub log_path: PathBuf,
    /// Subscriber log in full mode (also merged into `log_path`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber_log_path: Option<PathBuf>,
    /// Wall-clock duration in seconds
    pub duration_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Whether the run counts as successful
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Exit code suitable for the agent process (0..=255)
    pub fn process_exit_code(&self) -> u8 {
        u8::try_from(self.exit_code).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(exit_code: i32) -> ExecutionResult {
        let now = Utc::now();
        ExecutionResult {
            mode: TestMode::Publish,
            exit_code,
            log_path: PathBuf::from("/var/log/emqtt-bench/test-publish.log"),
            subscriber_log_path: None,
            duration_secs: 61.5,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn test_success() {
        assert!(result(0).success());
        assert!(!result(2).success());
    }

    #[test]
    fn test_process_exit_code_clamps() {
        assert_eq!(result(3).process_exit_code(), 3);
        assert_eq!(result(-1).process_exit_code(), 1);
        assert_eq!(result(300).process_exit_code(), 1);
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&result(0)).unwrap();
        assert!(json.contains("\"mode\":\"publish\""));
        assert!(json.contains("\"exit_code\":0"));
        assert!(!json.contains("subscriber_log_path"));
    }
}
