//! Child process execution with streamed output
//!
//! Two layers:
//! - [`run_command_streaming`] runs a setup command (package manager, tar,
//!   git, make) to completion under a timeout, streaming every output line
//!   into the run log.
//! - [`BenchProcess`] is an explicit handle for emqtt-bench invocations with
//!   start / poll-alive / signal / wait / wait-with-timeout / terminate.

use crate::error::RunError;
use crate::logging::{LogSink, RunLogger};
use anyhow::{Context, Result};
use mqtt_bench_common::defaults::TIMEOUT_EXIT_CODE;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time allowed for output pumps to drain after a process exits
const STREAM_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for setup command execution
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Command timeout (kills process if exceeded)
    pub timeout: Duration,
}

impl CommandConfig {
    /// Package-manager and download helpers (10 minute timeout)
    pub fn for_setup() -> Self {
        Self::with_timeout_secs(600)
    }

    /// Source builds (30 minute timeout)
    pub fn for_build() -> Self {
        Self::with_timeout_secs(1800)
    }

    /// Short probes (30 second timeout)
    pub fn for_probe() -> Self {
        Self::with_timeout_secs(30)
    }

    pub fn with_timeout_secs(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

/// Run a setup command and stream its output into the run log
///
/// # Returns
/// * `Ok(true)` if command succeeded
/// * `Ok(false)` if command failed with non-zero exit
/// * `Err` if timeout, spawn failure, or other error
pub async fn run_command_streaming(
    logger: &RunLogger,
    cmd: &str,
    args: &[&str],
    config: &CommandConfig,
) -> Result<bool> {
    info!(
        cmd = %cmd,
        args = ?args,
        timeout_secs = config.timeout.as_secs(),
        "Running command"
    );

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", cmd))?;

    let stdout = child.stdout.take().context("Failed to capture stdout")?;
    let stderr = child.stderr.take().context("Failed to capture stderr")?;

    let sink: Arc<dyn LogSink> = Arc::new(LoggerSink {
        logger: logger.clone(),
        prefix: cmd.to_string(),
    });
    let pumps = [
        spawn_pump(stdout, sink.clone()),
        spawn_pump(stderr, sink),
    ];

    let success = match tokio::time::timeout(config.timeout, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(e)) => return Err(e).context("Failed waiting for command"),
        Err(_) => {
            warn!(
                cmd = %cmd,
                timeout_secs = config.timeout.as_secs(),
                "Command timed out, killing process"
            );
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill timed-out process");
            }
            anyhow::bail!(
                "Command '{}' timed out after {}s",
                cmd,
                config.timeout.as_secs()
            );
        }
    };

    for pump in pumps {
        let _ = tokio::time::timeout(STREAM_FLUSH_TIMEOUT, pump).await;
    }

    Ok(success)
}

/// Routes setup command output through the run logger
struct LoggerSink {
    logger: RunLogger,
    prefix: String,
}

impl LogSink for LoggerSink {
    fn write_line(&self, line: &str) {
        self.logger.info(&format!("[{}] {}", self.prefix, line));
    }
}

fn spawn_pump<R>(reader: R, sink: Arc<dyn LogSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.write_line(&line);
        }
    })
}

/// How a benchmark process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with this code
    Exited(i32),
    /// Killed by a signal it did not handle
    Signaled(i32),
    /// Stopped because its wall-clock timeout expired
    TimedOut,
}

impl ExitOutcome {
    /// Shell-style exit code: signals map to `128 + n`, timeouts to 124
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => 128 + sig,
            Self::TimedOut => TIMEOUT_EXIT_CODE,
        }
    }

    pub fn success(self) -> bool {
        self == Self::Exited(0)
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(sig)) => Self::Signaled(sig),
            (None, None) => Self::Exited(1),
        }
    }
}

/// Handle to a running emqtt-bench process
pub struct BenchProcess {
    label: String,
    child: Child,
    pid: Option<u32>,
    pumps: Vec<JoinHandle<()>>,
    outcome: Option<ExitOutcome>,
}

impl BenchProcess {
    /// Start `program args...`, streaming stdout and stderr into `output`
    pub fn spawn(
        label: impl Into<String>,
        program: &Path,
        args: &[String],
        output: Arc<dyn LogSink>,
    ) -> Result<Self, RunError> {
        let label = label.into();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.display().to_string(),
                source,
            })?;

        let pid = child.id();
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, output));
        }

        debug!(label = %label, pid = ?pid, "Started benchmark process");
        Ok(Self {
            label,
            child,
            pid,
            pumps,
            outcome: None,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Non-blocking liveness check
    pub fn is_alive(&mut self) -> io::Result<bool> {
        if self.outcome.is_some() {
            return Ok(false);
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.outcome = Some(status.into());
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Deliver a signal to the process
    pub fn signal(&self, sig: Signal) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> io::Result<ExitOutcome> {
        let outcome = match self.outcome {
            Some(outcome) => outcome,
            None => self.child.wait().await?.into(),
        };
        self.finish(outcome).await;
        Ok(outcome)
    }

    /// Wait at most `timeout`; past that, terminate and report [`ExitOutcome::TimedOut`]
    pub async fn wait_timeout(
        &mut self,
        timeout: Duration,
        grace: Duration,
    ) -> io::Result<ExitOutcome> {
        if self.outcome.is_some() {
            return self.wait().await;
        }
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let outcome = status?.into();
                self.finish(outcome).await;
                Ok(outcome)
            }
            Err(_) => {
                info!(
                    label = %self.label,
                    timeout_secs = timeout.as_secs(),
                    "Process reached its time limit, stopping it"
                );
                self.terminate(grace).await?;
                Ok(ExitOutcome::TimedOut)
            }
        }
    }

    /// SIGTERM, then SIGKILL if the process outlives `grace`
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitOutcome> {
        if !self.is_alive()? {
            return self.wait().await;
        }

        self.signal(Signal::SIGTERM)?;
        let outcome = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status?.into(),
            Err(_) => {
                warn!(
                    label = %self.label,
                    grace_secs = grace.as_secs(),
                    "Process ignored SIGTERM, killing"
                );
                self.child.kill().await?;
                ExitOutcome::Signaled(Signal::SIGKILL as i32)
            }
        };
        self.finish(outcome).await;
        Ok(outcome)
    }

    async fn finish(&mut self, outcome: ExitOutcome) {
        self.outcome = Some(outcome);
        for pump in self.pumps.drain(..) {
            match tokio::time::timeout(STREAM_FLUSH_TIMEOUT, pump).await {
                Err(_) => warn!(label = %self.label, "Timed out draining process output"),
                Ok(Err(e)) if e.is_panic() => warn!("Output pump panicked: {:?}", e),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::path::PathBuf;

    fn sh(script: &str) -> (PathBuf, Vec<String>) {
        (
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_run_command_streaming_echo() {
        let sink = Arc::new(MemorySink::new());
        let logger = RunLogger::new().with_sink(sink.clone());

        let result = run_command_streaming(&logger, "echo", &["hello"], &CommandConfig::for_probe())
            .await;

        assert!(result.unwrap());
        assert!(sink.contains("[echo] hello"));
    }

    #[tokio::test]
    async fn test_run_command_streaming_failure() {
        let logger = RunLogger::new();
        let result = run_command_streaming(&logger, "false", &[], &CommandConfig::for_probe()).await;
        assert!(!result.unwrap());
    }

    #[tokio::test]
    async fn test_run_command_streaming_not_found() {
        let logger = RunLogger::new();
        let result = run_command_streaming(
            &logger,
            "this-command-does-not-exist-12345",
            &[],
            &CommandConfig::for_probe(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_command_streaming_timeout() {
        let logger = RunLogger::new();
        let result =
            run_command_streaming(&logger, "sleep", &["5"], &CommandConfig::with_timeout_secs(1))
                .await;
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_bench_process_captures_output_and_code() {
        let sink = Arc::new(MemorySink::new());
        let (program, args) = sh("echo out; echo err >&2; exit 3");

        let mut process = BenchProcess::spawn("test", &program, &args, sink.clone()).unwrap();
        let outcome = process.wait().await.unwrap();

        assert_eq!(outcome, ExitOutcome::Exited(3));
        assert_eq!(outcome.code(), 3);
        assert!(sink.contains("out"));
        assert!(sink.contains("err"));
    }

    #[tokio::test]
    async fn test_wait_timeout_reports_timed_out() {
        let sink = Arc::new(MemorySink::new());
        let (program, args) = sh("exec sleep 30");

        let mut process = BenchProcess::spawn("sleeper", &program, &args, sink).unwrap();
        let outcome = process
            .wait_timeout(Duration::from_millis(200), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(outcome, ExitOutcome::TimedOut);
        assert_eq!(outcome.code(), 124);
        assert!(!process.is_alive().unwrap());
    }

    #[tokio::test]
    async fn test_is_alive_and_terminate() {
        let sink = Arc::new(MemorySink::new());
        let (program, args) = sh("exec sleep 30");

        let mut process = BenchProcess::spawn("sleeper", &program, &args, sink).unwrap();
        assert!(process.pid().is_some());
        assert!(process.is_alive().unwrap());

        let outcome = process.terminate(Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGTERM as i32));
        assert!(!process.is_alive().unwrap());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let sink = Arc::new(MemorySink::new());
        let (program, args) = sh("trap '' TERM; while true; do sleep 0.1; done");

        let mut process = BenchProcess::spawn("stubborn", &program, &args, sink).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = process.terminate(Duration::from_millis(300)).await.unwrap();

        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_is_alive_false_after_exit() {
        let sink = Arc::new(MemorySink::new());
        let (program, args) = sh("exit 0");

        let mut process = BenchProcess::spawn("quick", &program, &args, sink).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!process.is_alive().unwrap());
        assert_eq!(process.wait().await.unwrap(), ExitOutcome::Exited(0));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let sink = Arc::new(MemorySink::new());
        let result = BenchProcess::spawn(
            "missing",
            Path::new("/nonexistent/emqtt_bench"),
            &[],
            sink,
        );
        assert!(matches!(result, Err(RunError::Spawn { .. })));
    }
}
