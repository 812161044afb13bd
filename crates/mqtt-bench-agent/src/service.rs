//! systemd unit installation for unattended runs at boot

use crate::logging::RunLogger;
use crate::process::{CommandConfig, run_command_streaming};
use anyhow::{Context, Result};
use std::path::Path;

pub const SERVICE_NAME: &str = "mqtt-bench";
pub const UNIT_PATH: &str = "/etc/systemd/system/mqtt-bench.service";

/// Unit file text running `<agent> run`
pub fn unit_content(agent: &Path) -> String {
    format!(
        r##"[Unit]
Description=MQTT load test agent (emqtt-bench)
Wants=network-online.target
After=network-online.target
# Limit to 3 restarts within a 10-minute (600 second) interval
StartLimitIntervalSec=600
StartLimitBurst=3

[Service]
Type=simple
Restart=on-failure
RestartSec=30
LimitNOFILE=1000000
Environment="RUST_LOG=info"
ExecStart={agent} run

[Install]
WantedBy=multi-user.target
"##,
        agent = agent.display()
    )
}

/// Write the unit file, reload systemd and enable the service
pub async fn install_service(
    agent: &Path,
    unit_path: &Path,
    enable_now: bool,
    logger: &RunLogger,
) -> Result<()> {
    logger.info(&format!("Writing {}", unit_path.display()));
    std::fs::write(unit_path, unit_content(agent))
        .with_context(|| format!("Failed to write {}", unit_path.display()))?;

    systemctl(&["daemon-reload"], logger).await?;
    if enable_now {
        systemctl(&["enable", "--now", SERVICE_NAME], logger).await?;
    } else {
        systemctl(&["enable", SERVICE_NAME], logger).await?;
    }
    logger.info(&format!("{} service enabled", SERVICE_NAME));
    Ok(())
}

async fn systemctl(args: &[&str], logger: &RunLogger) -> Result<()> {
    let ok = run_command_streaming(logger, "systemctl", args, &CommandConfig::for_probe()).await?;
    if !ok {
        anyhow::bail!("systemctl {} failed", args.join(" "));
    }
    Ok(())
}
