//! Run reporting: configuration preamble, final summary, log retention
//!
//! Reporting is best-effort. Write failures become warnings and never change
//! the outcome of a run.

use crate::args::REDACTED;
use crate::logging::RunLogger;
use crate::platform::Platform;
use crate::resolver::ResolvedConfig;
use crate::runner::RunLogPaths;
use anyhow::{Context, Result};
use mqtt_bench_common::{BenchConfig, ExecutionResult, OptionKey, TestMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use strum::IntoEnumIterator;

/// Length of a `YYYYMMDD-HHMMSS` file timestamp
const TIMESTAMP_LEN: usize = 15;

/// Machine-readable summary written next to the run logs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub mode: TestMode,
    pub exit_code: i32,
    pub success: bool,
    pub broker: String,
    pub client_count: u32,
    pub bench_version: String,
    pub agent_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    fn base(config: &BenchConfig, mode: TestMode, exit_code: i32) -> Self {
        Self {
            mode,
            exit_code,
            success: exit_code == 0,
            broker: format!("{}:{}", config.broker_host, config.broker_port),
            client_count: config.client_count,
            bench_version: config.bench_version.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            result: None,
            error: None,
        }
    }

    pub fn completed(config: &BenchConfig, result: &ExecutionResult) -> Self {
        Self {
            result: Some(result.clone()),
            ..Self::base(config, result.mode, result.exit_code)
        }
    }

    pub fn failed(config: &BenchConfig, mode: TestMode, error: &anyhow::Error) -> Self {
        Self {
            error: Some(format!("{:#}", error)),
            ..Self::base(config, mode, 1)
        }
    }
}

/// Display form of one option's value
pub fn display_value(config: &BenchConfig, key: OptionKey) -> String {
    match key {
        OptionKey::BrokerHost => config.broker_host.clone(),
        OptionKey::BrokerPort => config.broker_port.to_string(),
        OptionKey::ClientCount => config.client_count.to_string(),
        OptionKey::ConnectInterval => format!("{}ms", config.connect_interval_ms),
        OptionKey::Qos => config.qos.to_string(),
        OptionKey::Topic => config.topic.clone(),
        OptionKey::PayloadSize => format!("{} bytes", config.payload_size),
        OptionKey::MessageInterval => format!("{}ms", config.message_interval_ms),
        OptionKey::Duration => format!("{}s", config.duration_secs),
        OptionKey::Username => config.username.clone(),
        OptionKey::Password if config.password.is_empty() => String::new(),
        OptionKey::Password => REDACTED.to_string(),
        OptionKey::UseSsl => config.use_ssl.to_string(),
        OptionKey::SslCertfile => config.ssl_certfile.clone(),
        OptionKey::SslKeyfile => config.ssl_keyfile.clone(),
        OptionKey::UseWebsocket => config.use_websocket.to_string(),
        OptionKey::TestMode => config.test_mode.to_string(),
        OptionKey::InstallMethod => config.install_method.to_string(),
        OptionKey::BenchVersion => config.bench_version.clone(),
        OptionKey::InstallDir => config.install_dir.display().to_string(),
        OptionKey::SourceRepo => config.source_repo.clone(),
        OptionKey::DownloadMirror => config.download_mirror.clone().unwrap_or_default(),
        OptionKey::LogDir => config.log_dir.display().to_string(),
        OptionKey::LogRetention => config.log_retention.to_string(),
        OptionKey::KillStalePackageManager => config.kill_stale_package_manager.to_string(),
    }
}

/// Writes the human-readable report into the run log
pub struct Reporter {
    logger: RunLogger,
}

impl Reporter {
    pub fn new(logger: RunLogger) -> Self {
        Self { logger }
    }

    /// Every resolved option with its source
    pub fn preamble(&self, resolved: &ResolvedConfig) {
        self.logger.info("===== emqtt-bench agent configuration =====");
        for key in OptionKey::iter() {
            let source = resolved
                .source_of(key)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "default".to_string());
            let value = display_value(&resolved.config, key);
            let value = if value.is_empty() { "(unset)" } else { value.as_str() };
            self.logger
                .info(&format!("  {:<28} {} [{}]", key.name(), value, source));
        }
        self.logger.info(&format!(
            "  {:<28} {}",
            "messages-per-publisher",
            resolved.config.publish_message_count()
        ));
    }

    /// Host platform and the launcher that will run
    pub fn environment(&self, platform: &Platform, binary: &Path) {
        self.logger.info(&format!(
            "Host: {} {} ({}), build tag {}{}",
            platform.os.id,
            platform.os.version_id,
            platform.arch,
            platform.build_tag,
            if platform.recognized { "" } else { " (fallback)" }
        ));
        self.logger
            .info(&format!("emqtt-bench binary: {}", binary.display()));
    }

    /// Final summary for a completed run
    pub fn summary(&self, config: &BenchConfig, result: &ExecutionResult, paths: &RunLogPaths) {
        self.logger.info("===== run summary =====");
        self.logger.info(&format!("  mode:        {}", result.mode));
        self.logger
            .info(&format!("  exit code:   {}", result.exit_code));
        self.logger
            .info(&format!("  duration:    {:.1}s", result.duration_secs));
        self.logger.info(&format!(
            "  finished at: {}",
            result.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        self.logger
            .info(&format!("  test log:    {}", result.log_path.display()));
        if let Some(sub_log) = &result.subscriber_log_path {
            self.logger
                .info(&format!("  sub log:     {}", sub_log.display()));
        }
        self.write_summary(&paths.summary, &RunSummary::completed(config, result));
    }

    /// Summary for a run that failed before producing a result
    pub fn failure(
        &self,
        config: &BenchConfig,
        mode: TestMode,
        error: &anyhow::Error,
        paths: &RunLogPaths,
    ) {
        self.logger
            .error(&format!("{} test aborted: {:#}", mode, error));
        self.write_summary(&paths.summary, &RunSummary::failed(config, mode, error));
    }

    fn write_summary(&self, path: &Path, summary: &RunSummary) {
        match write_json(path, summary) {
            Ok(()) => self
                .logger
                .info(&format!("  summary:     {}", path.display())),
            Err(e) => self
                .logger
                .warn(&format!("Failed to write summary {}: {:#}", path.display(), e)),
        }
    }
}

fn write_json(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Run timestamp embedded in a log file name, if it is one of ours
fn run_timestamp(file_name: &str) -> Option<&str> {
    let is_ours = ["startup-", "test-", "sub-", "summary-"]
        .iter()
        .any(|prefix| file_name.starts_with(prefix));
    if !is_ours {
        return None;
    }
    let stem = file_name
        .strip_suffix(".log")
        .or_else(|| file_name.strip_suffix(".json"))?;
    let ts = stem.get(stem.len().checked_sub(TIMESTAMP_LEN)?..)?;
    let (date, time) = ts.split_once('-')?;
    let well_formed = date.len() == 8
        && time.len() == 6
        && date.bytes().chain(time.bytes()).all(|b| b.is_ascii_digit());
    well_formed.then_some(ts)
}

/// Delete log files of all but the newest `keep` runs; returns files removed
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> Result<usize> {
    let entries: Vec<(String, std::path::PathBuf)> = std::fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read {}", log_dir.display()))?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let ts = run_timestamp(&name)?.to_string();
            Some((ts, entry.path()))
        })
        .collect();

    let runs: BTreeSet<&str> = entries.iter().map(|(ts, _)| ts.as_str()).collect();
    let expired: BTreeSet<&str> = runs.iter().rev().skip(keep).copied().collect();

    let mut removed = 0;
    for (ts, path) in &entries {
        if expired.contains(ts.as_str()) && std::fs::remove_file(path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
