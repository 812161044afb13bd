//! Host tuning for large client counts: file descriptors and TCP sysctls
//!
//! Every step is best-effort; failures are logged as warnings.

use crate::logging::RunLogger;
use crate::process::{CommandConfig, run_command_streaming};
use anyhow::{Context, Result};
use std::path::Path;

/// Descriptor limit requested for the agent and its children
pub const NOFILE_LIMIT: u64 = 1_000_000;

pub const SYSCTL_CONF_PATH: &str = "/etc/sysctl.d/99-mqtt-bench.conf";

/// Kernel settings for many concurrent outbound connections
pub fn sysctl_content() -> String {
    format!(
        r##"# Written by mqtt-bench-agent
# one outbound port per simulated client
net.ipv4.ip_local_port_range = 1024 65535
net.ipv4.tcp_tw_reuse = 1
net.core.somaxconn = 32768
fs.file-max = {limit}
fs.nr_open = {limit}
"##,
        limit = NOFILE_LIMIT * 2
    )
}

/// Raise the open-file limit of this process; children inherit it
pub fn raise_nofile_limit(logger: &RunLogger) -> Option<u64> {
    match rlimit::increase_nofile_limit(NOFILE_LIMIT) {
        Ok(limit) => {
            if limit < NOFILE_LIMIT {
                logger.warn(&format!(
                    "Open-file limit capped at {} (wanted {})",
                    limit, NOFILE_LIMIT
                ));
            } else {
                logger.info(&format!("Open-file limit set to {}", limit));
            }
            Some(limit)
        }
        Err(e) => {
            logger.warn(&format!("Failed to raise open-file limit: {}", e));
            None
        }
    }
}

fn write_sysctl_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, sysctl_content())
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Write the sysctl drop-in and reload kernel settings
pub async fn apply_sysctl(logger: &RunLogger) {
    if let Err(e) = write_sysctl_file(Path::new(SYSCTL_CONF_PATH)) {
        logger.warn(&format!("Skipping kernel tuning: {:#}", e));
        return;
    }
    match run_command_streaming(
        logger,
        "sysctl",
        &["--system", "--quiet"],
        &CommandConfig::for_probe(),
    )
    .await
    {
        Ok(true) => logger.info(&format!("Applied kernel tuning from {}", SYSCTL_CONF_PATH)),
        Ok(false) => logger.warn("sysctl --system reported errors; some settings may not apply"),
        Err(e) => logger.warn(&format!("Failed to run sysctl: {:#}", e)),
    }
}

/// Apply all host tuning
pub async fn tune_host(logger: &RunLogger) {
    logger.info("=== Host tuning ===");
    raise_nofile_limit(logger);
    apply_sysctl(logger).await;
}
