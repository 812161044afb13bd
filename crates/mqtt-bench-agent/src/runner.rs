//! Load-test execution
//!
//! Runs emqtt-bench in the configured mode, streams its output to the
//! console and to the per-run test log, and produces an [`ExecutionResult`].

use crate::args::{CommandPlan, redact};
use crate::error::RunError;
use crate::logging::{ConsoleSink, FileSink, LogSink, RunLogger, TeeSink};
use crate::process::{BenchProcess, ExitOutcome};
use anyhow::{Context, Result};
use chrono::Utc;
use mqtt_bench_common::defaults::SETTLE_PERIOD_SECS;
use mqtt_bench_common::{BenchConfig, ExecutionResult, SubCommand, TestMode};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Waits around the full-mode subscriber, and the stop grace period
#[derive(Debug, Clone)]
pub struct RunnerTimings {
    /// Subscriber warm-up before publishing starts
    pub settle: Duration,
    /// Time for in-flight messages to arrive after publishing ends
    pub post_publish_settle: Duration,
    /// SIGTERM to SIGKILL escalation delay
    pub term_grace: Duration,
}

impl Default for RunnerTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(SETTLE_PERIOD_SECS),
            post_publish_settle: Duration::from_secs(SETTLE_PERIOD_SECS),
            term_grace: Duration::from_secs(10),
        }
    }
}

/// Log files of one run, all sharing a timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogPaths {
    pub startup: PathBuf,
    pub test: PathBuf,
    pub subscriber: PathBuf,
    pub summary: PathBuf,
}

impl RunLogPaths {
    pub fn new(log_dir: &Path, mode: TestMode, timestamp: &str) -> Self {
        Self {
            startup: log_dir.join(format!("startup-{}.log", timestamp)),
            test: log_dir.join(format!("test-{}-{}.log", mode, timestamp)),
            subscriber: log_dir.join(format!("sub-{}.log", timestamp)),
            summary: log_dir.join(format!("summary-{}.json", timestamp)),
        }
    }
}

/// Executes one load test
pub struct TestRunner<'a> {
    config: &'a BenchConfig,
    binary: PathBuf,
    paths: RunLogPaths,
    logger: RunLogger,
    timings: RunnerTimings,
    echo: bool,
}

impl<'a> TestRunner<'a> {
    pub fn new(config: &'a BenchConfig, binary: PathBuf, paths: RunLogPaths, logger: RunLogger) -> Self {
        Self {
            config,
            binary,
            paths,
            logger,
            timings: RunnerTimings::default(),
            echo: true,
        }
    }

    pub fn with_timings(mut self, timings: RunnerTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Echo child output to stdout (on by default)
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Run `mode` to completion
    pub async fn run(&self, mode: TestMode) -> Result<ExecutionResult> {
        let plan = CommandPlan::for_mode(self.config, mode);
        let started_at = Utc::now();
        let clock = Instant::now();

        self.logger.info(&format!(
            "Starting {} test against {}:{} with {} clients",
            mode, self.config.broker_host, self.config.broker_port, self.config.client_count
        ));
        self.logger
            .info(&format!("Test output: {}", self.paths.test.display()));

        let exit_code = match mode {
            TestMode::Connect => self.run_foreground(&plan, SubCommand::Conn).await?,
            TestMode::Publish => self.run_foreground(&plan, SubCommand::Pub).await?,
            TestMode::Subscribe => self.run_subscribe(&plan).await?,
            TestMode::Full => self.run_full(&plan).await?,
        };

        let result = ExecutionResult {
            mode,
            exit_code,
            log_path: self.paths.test.clone(),
            subscriber_log_path: (mode == TestMode::Full).then(|| self.paths.subscriber.clone()),
            duration_secs: clock.elapsed().as_secs_f64(),
            started_at,
            finished_at: Utc::now(),
        };

        if result.success() {
            self.logger.info(&format!("{} test completed successfully", mode));
        } else {
            self.logger.error(&format!(
                "{} test failed with exit code {}",
                mode, result.exit_code
            ));
        }
        Ok(result)
    }

    /// connect / publish: the process ends by itself
    async fn run_foreground(&self, plan: &CommandPlan, command: SubCommand) -> Result<i32> {
        let mut process = self.start(plan, command, &self.paths.test)?;
        let outcome = process
            .wait()
            .await
            .with_context(|| format!("Failed waiting for emqtt-bench {}", command))?;
        Ok(outcome.code())
    }

    /// subscribe: stopped after the configured duration
    async fn run_subscribe(&self, plan: &CommandPlan) -> Result<i32> {
        let mut process = self.start(plan, SubCommand::Sub, &self.paths.test)?;
        let limit = Duration::from_secs(self.config.duration_secs);
        let outcome = process
            .wait_timeout(limit, self.timings.term_grace)
            .await
            .context("Failed waiting for emqtt-bench sub")?;

        Ok(match outcome {
            ExitOutcome::TimedOut => {
                self.logger.info(&format!(
                    "Subscribe test completed after {}s",
                    self.config.duration_secs
                ));
                0
            }
            other => other.code(),
        })
    }

    /// full: background subscriber, foreground publisher
    async fn run_full(&self, plan: &CommandPlan) -> Result<i32> {
        let mut subscriber = self.start(plan, SubCommand::Sub, &self.paths.subscriber)?;
        self.logger.info(&format!(
            "Subscriber started (pid {}), waiting {}s before publishing",
            subscriber.pid().unwrap_or_default(),
            self.timings.settle.as_secs()
        ));
        tokio::time::sleep(self.timings.settle).await;

        if !subscriber.is_alive().context("Failed to poll subscriber")? {
            let outcome = subscriber.wait().await.context("Failed reaping subscriber")?;
            self.merge_subscriber_log();
            return Err(RunError::SubscriberExited {
                settle_secs: self.timings.settle.as_secs(),
                exit_code: outcome.code(),
            }
            .into());
        }

        let publish = self.run_foreground(plan, SubCommand::Pub).await;

        tokio::time::sleep(self.timings.post_publish_settle).await;
        self.logger.info("Stopping subscriber");
        match subscriber.terminate(self.timings.term_grace).await {
            Ok(outcome) => self
                .logger
                .info(&format!("Subscriber stopped ({:?})", outcome)),
            Err(e) => self.logger.warn(&format!("Failed to stop subscriber: {}", e)),
        }
        self.merge_subscriber_log();

        publish
    }

    fn start(&self, plan: &CommandPlan, command: SubCommand, log: &Path) -> Result<BenchProcess> {
        let args = plan
            .args_for(command)
            .with_context(|| format!("{} is not part of the {} plan", command, plan.mode))?;

        self.logger.info(&format!(
            "Running: {} {}",
            self.binary.display(),
            redact(args).join(" ")
        ));

        let file = FileSink::open(log)
            .with_context(|| format!("Failed to open log file {}", log.display()))?;
        let mut sinks: Vec<Arc<dyn LogSink>> = vec![Arc::new(file)];
        if self.echo {
            sinks.push(Arc::new(ConsoleSink));
        }
        let output: Arc<dyn LogSink> = Arc::new(TeeSink::new(sinks));

        Ok(BenchProcess::spawn(command.to_string(), &self.binary, args, output)?)
    }

    /// Append the subscriber log to the combined test log
    fn merge_subscriber_log(&self) {
        let merge = || -> std::io::Result<()> {
            let content = std::fs::read_to_string(&self.paths.subscriber)?;
            let mut test_log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.paths.test)?;
            writeln!(test_log, "===== subscriber output =====")?;
            test_log.write_all(content.as_bytes())?;
            Ok(())
        };
        if let Err(e) = merge() {
            self.logger
                .warn(&format!("Failed to merge subscriber log: {}", e));
        }
    }
}
