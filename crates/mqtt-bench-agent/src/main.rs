//! mqtt-bench-agent: provisions emqtt-bench and runs one MQTT load test
//!
//! Designed to run at instance boot (see `service`); every knob is read from
//! instance metadata or the environment, so no arguments are required.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use mqtt_bench_agent::error::PrepareError;
use mqtt_bench_agent::install::prepare_environment;
use mqtt_bench_agent::logging::{self, FileSink, RunLogger};
use mqtt_bench_agent::platform::Platform;
use mqtt_bench_agent::report::{Reporter, prune_old_logs};
use mqtt_bench_agent::resolver::{ConfigResolver, ResolvedConfig};
use mqtt_bench_agent::runner::{RunLogPaths, TestRunner};
use mqtt_bench_agent::service::{UNIT_PATH, install_service};
use mqtt_bench_agent::sources::{EnvSource, MetadataSource};
use mqtt_bench_agent::tuning;
use mqtt_bench_common::defaults::DEFAULT_METADATA_URL;
use mqtt_bench_common::{TestMode, file_timestamp};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mqtt-bench-agent")]
#[command(about = "Provisions emqtt-bench and runs an MQTT load test", version)]
struct Args {
    /// Instance metadata attribute endpoint
    #[arg(long, global = true, env = "MQTT_BENCH_METADATA_URL", default_value = DEFAULT_METADATA_URL)]
    metadata_url: String,

    /// Ignore instance metadata; use only the environment and defaults
    #[arg(long, global = true)]
    no_metadata: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install emqtt-bench (if needed) and run the load test (default)
    Run(RunArgs),
    /// Install emqtt-bench only
    Install,
    /// Print the resolved configuration as JSON
    Config,
    /// Install a systemd unit that runs this agent at boot
    Service {
        /// Also start the service now
        #[arg(long)]
        now: bool,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct RunArgs {
    /// Override the configured test mode (connect, publish, subscribe, full)
    #[arg(long)]
    mode: Option<TestMode>,

    /// Use the already installed binary
    #[arg(long)]
    skip_install: bool,

    /// Skip file-descriptor and sysctl tuning
    #[arg(long)]
    skip_tuning: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();
    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting mqtt-bench-agent");

    let metadata_url = (!args.no_metadata).then_some(args.metadata_url.as_str());
    let outcome = match args.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(run_args) => run(metadata_url, run_args).await,
        Command::Install => install(metadata_url).await.map(|()| ExitCode::SUCCESS),
        Command::Config => print_config(metadata_url).await.map(|()| ExitCode::SUCCESS),
        Command::Service { now } => service(now).await.map(|()| ExitCode::SUCCESS),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Resolve the configuration; a missing broker host is fatal here
async fn resolve(metadata_url: Option<&str>) -> Result<ResolvedConfig> {
    let metadata = match metadata_url {
        Some(url) => MetadataSource::connect(url).await?,
        None => None,
    };
    let resolved = ConfigResolver::new(metadata, EnvSource).resolve().await?;
    Ok(resolved)
}

async fn run(metadata_url: Option<&str>, args: RunArgs) -> Result<ExitCode> {
    let mut resolved = resolve(metadata_url).await?;
    if let Some(mode) = args.mode {
        resolved.override_test_mode(mode);
    }
    let config = resolved.config.clone();
    let mode = config.test_mode;

    let paths = RunLogPaths::new(&config.log_dir, mode, &file_timestamp());
    let logger = run_logger(&paths.startup);
    let reporter = Reporter::new(logger.clone());
    reporter.preamble(&resolved);

    match prune_old_logs(&config.log_dir, config.log_retention as usize) {
        Ok(0) => {}
        Ok(removed) => logger.info(&format!("Pruned {} old log file(s)", removed)),
        Err(e) => logger.warn(&format!("Log pruning skipped: {:#}", e)),
    }

    if !args.skip_tuning {
        tuning::tune_host(&logger).await;
    }

    let prepared = if args.skip_install {
        already_installed(&config.binary_path())
    } else {
        prepare_environment(&config, &logger).await
    };
    let (platform, binary) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            logger.error(&format!("Environment preparation failed: {:#}", e));
            return Ok(ExitCode::FAILURE);
        }
    };
    reporter.environment(&platform, &binary);

    let runner = TestRunner::new(&config, binary, paths.clone(), logger.clone());
    match runner.run(mode).await {
        Ok(result) => {
            reporter.summary(&config, &result, &paths);
            Ok(ExitCode::from(result.process_exit_code()))
        }
        Err(e) => {
            reporter.failure(&config, mode, &e, &paths);
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Console logger that also appends to the startup log when it can be opened
fn run_logger(startup_log: &Path) -> RunLogger {
    match FileSink::open(startup_log) {
        Ok(sink) => RunLogger::new().with_sink(Arc::new(sink)),
        Err(e) => {
            let logger = RunLogger::new();
            logger.warn(&format!(
                "Cannot open {} ({}), logging to console only",
                startup_log.display(),
                e
            ));
            logger
        }
    }
}

/// Platform and launcher for `--skip-install`
fn already_installed(binary: &Path) -> Result<(Platform, PathBuf)> {
    if !binary.is_file() {
        return Err(PrepareError::BinaryMissing(binary.to_path_buf()).into());
    }
    Ok((Platform::detect()?, binary.to_path_buf()))
}

async fn install(metadata_url: Option<&str>) -> Result<()> {
    let resolved = resolve(metadata_url).await?;
    let logger = RunLogger::new();
    let (platform, binary) = prepare_environment(&resolved.config, &logger).await?;
    Reporter::new(logger).environment(&platform, &binary);
    println!("{}", binary.display());
    Ok(())
}

async fn print_config(metadata_url: Option<&str>) -> Result<()> {
    let resolved = resolve(metadata_url).await?;
    let messages_per_publisher = resolved.config.publish_message_count();
    let sources: BTreeMap<&str, _> = resolved
        .provenance
        .iter()
        .map(|(key, source)| (key.name(), source))
        .collect();
    let output = serde_json::json!({
        "config": &resolved.config,
        "sources": sources,
        "messages_per_publisher": messages_per_publisher,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to serialize configuration")?
    );
    Ok(())
}

async fn service(now: bool) -> Result<()> {
    let agent = std::env::current_exe().context("Failed to locate the agent executable")?;
    install_service(&agent, Path::new(UNIT_PATH), now, &RunLogger::new()).await
}
