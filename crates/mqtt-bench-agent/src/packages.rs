//! Package-manager access guarded by lock waiting and bounded retries
//!
//! Fresh cloud instances often run unattended upgrades at boot, so every
//! update/install first waits (bounded) for the package lock, optionally
//! terminates stale manager processes, and is retried on failure.

use crate::error::PrepareError;
use crate::logging::RunLogger;
use crate::platform::find_in_path;
use crate::process::{CommandConfig, run_command_streaming};
use anyhow::Result;
use backon::{ConstantBuilder, Retryable};
use mqtt_bench_common::defaults::{
    LOCK_MAX_WAIT_SECS, LOCK_POLL_INTERVAL_SECS, PACKAGE_RETRY_ATTEMPTS,
    PACKAGE_RETRY_BACKOFF_SECS,
};
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

/// Supported system package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
}

impl PackageManager {
    /// First supported manager found on `PATH`
    pub fn detect() -> Option<Self> {
        [Self::Apt, Self::Dnf, Self::Yum]
            .into_iter()
            .find(|pm| find_in_path(pm.program()).is_some())
    }

    pub fn program(self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
        }
    }

    /// Files held open while the manager is working
    pub fn lock_files(self) -> &'static [&'static str] {
        match self {
            Self::Apt => &[
                "/var/lib/dpkg/lock-frontend",
                "/var/lib/dpkg/lock",
                "/var/lib/apt/lists/lock",
                "/var/cache/apt/archives/lock",
            ],
            Self::Dnf => &["/var/lib/rpm/.rpm.lock", "/var/cache/dnf/metadata_lock.pid"],
            Self::Yum => &["/var/lib/rpm/.rpm.lock", "/var/run/yum.pid"],
        }
    }

    /// Process names (as matched by `pgrep -x`) that hold the lock
    pub fn process_names(self) -> &'static [&'static str] {
        match self {
            // Process names are truncated to 15 characters
            Self::Apt => &["apt", "apt-get", "dpkg", "unattended-upgr"],
            Self::Dnf => &["dnf", "dnf-automatic", "rpm"],
            Self::Yum => &["yum", "yum-cron", "rpm"],
        }
    }

    /// Refresh package metadata
    pub fn update_command(self) -> (String, Vec<String>) {
        match self {
            Self::Apt => apt(&["update", "-q"]),
            Self::Dnf | Self::Yum => (
                self.program().to_string(),
                vec!["makecache".to_string(), "-y".to_string(), "-q".to_string()],
            ),
        }
    }

    /// Install packages non-interactively
    pub fn install_command(self, packages: &[&str]) -> (String, Vec<String>) {
        match self {
            Self::Apt => {
                let mut args = vec!["install", "-y", "-q", "--no-install-recommends"];
                args.extend_from_slice(packages);
                apt(&args)
            }
            Self::Dnf | Self::Yum => {
                let mut args = vec!["install".to_string(), "-y".to_string(), "-q".to_string()];
                args.extend(packages.iter().map(|p| p.to_string()));
                (self.program().to_string(), args)
            }
        }
    }

    /// Package providing a command-line tool
    pub fn package_for(self, tool: &'static str) -> &'static str {
        match tool {
            "erl" => "erlang",
            "gcc" if self == Self::Apt => "build-essential",
            other => other,
        }
    }
}

/// apt-get runs with a non-interactive frontend
fn apt(args: &[&str]) -> (String, Vec<String>) {
    let mut full = vec![
        "DEBIAN_FRONTEND=noninteractive".to_string(),
        "apt-get".to_string(),
    ];
    full.extend(args.iter().map(|a| a.to_string()));
    ("env".to_string(), full)
}

/// Reports whether a package manager currently holds its lock
pub trait LockProbe {
    fn is_locked(&self, manager: PackageManager) -> impl Future<Output = bool>;
}

/// Probe using `fuser` on the lock files and `pgrep` on manager processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLockProbe;

impl LockProbe for SystemLockProbe {
    async fn is_locked(&self, manager: PackageManager) -> bool {
        for &file in manager.lock_files() {
            if Path::new(file).exists() && quiet_success("fuser", &["-s", file]).await {
                debug!(file, "Lock file in use");
                return true;
            }
        }
        for &name in manager.process_names() {
            if quiet_success("pgrep", &["-x", name]).await {
                debug!(process = name, "Package manager process running");
                return true;
            }
        }
        false
    }
}

/// Exit status of a silent probe command; a missing tool counts as failure
async fn quiet_success(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Bounds for lock polling
#[derive(Debug, Clone)]
pub struct LockWaitConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for LockWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(LOCK_POLL_INTERVAL_SECS),
            max_wait: Duration::from_secs(LOCK_MAX_WAIT_SECS),
        }
    }
}

/// Result of waiting for the package lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWait {
    Released { waited: Duration },
    TimedOut { waited: Duration },
}

/// Poll until the lock is free or `config.max_wait` has passed.
///
/// Never fails: a lock still held at the bound is reported as
/// [`LockWait::TimedOut`] and the caller proceeds anyway.
pub async fn wait_for_lock<P: LockProbe>(
    probe: &P,
    manager: PackageManager,
    config: &LockWaitConfig,
    logger: &RunLogger,
) -> LockWait {
    let start = Instant::now();
    let mut announced = false;

    loop {
        let waited = start.elapsed();
        if !probe.is_locked(manager).await {
            if announced {
                logger.info(&format!(
                    "{} lock released after {}s",
                    manager,
                    waited.as_secs()
                ));
            }
            return LockWait::Released { waited };
        }
        if waited >= config.max_wait {
            logger.warn(&format!(
                "{} lock still held after {}s, proceeding anyway",
                manager,
                waited.as_secs()
            ));
            return LockWait::TimedOut { waited };
        }
        if !announced {
            logger.info(&format!(
                "{} is busy, waiting up to {}s for its lock",
                manager,
                config.max_wait.as_secs()
            ));
            announced = true;
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

/// SIGTERM every stale manager process, then SIGKILL survivors after `grace`.
///
/// `launcher` prefixes each `pkill` (empty to run it directly).
pub async fn kill_stale(
    manager: PackageManager,
    launcher: &[String],
    grace: Duration,
    logger: &RunLogger,
) {
    logger.warn(&format!("Terminating stale {} processes", manager));
    for name in manager.process_names() {
        signal_by_name(launcher, "-TERM", name, logger).await;
    }
    tokio::time::sleep(grace).await;
    for name in manager.process_names() {
        signal_by_name(launcher, "-KILL", name, logger).await;
    }
}

async fn signal_by_name(launcher: &[String], signal: &str, name: &str, logger: &RunLogger) {
    let (program, args) = launch(launcher, "pkill", &[signal, "-x", name]);
    // pkill exits 1 when nothing matched
    if let Err(e) = run_command_streaming(logger, program, &args, &CommandConfig::for_probe()).await
    {
        logger.warn(&format!("pkill {} {} failed: {:#}", signal, name, e));
    }
}

/// Program and arguments for `program args`, run through `launcher` if set
fn launch<'a>(
    launcher: &'a [String],
    program: &'a str,
    args: &[&'a str],
) -> (&'a str, Vec<&'a str>) {
    match launcher.split_first() {
        Some((first, rest)) => {
            let mut full: Vec<&str> = rest.iter().map(String::as_str).collect();
            full.push(program);
            full.extend_from_slice(args);
            (first.as_str(), full)
        }
        None => (program, args.to_vec()),
    }
}

/// Attempts and fixed backoff for package operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: PACKAGE_RETRY_ATTEMPTS,
            backoff: Duration::from_secs(PACKAGE_RETRY_BACKOFF_SECS),
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    logger: &RunLogger,
    op: F,
) -> Result<T, PrepareError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retries = policy.attempts.saturating_sub(1) as usize;
    op.retry(
        ConstantBuilder::default()
            .with_delay(policy.backoff)
            .with_max_times(retries),
    )
    .notify(|e: &anyhow::Error, delay| {
        logger.warn(&format!(
            "Package {} failed: {:#}; retrying in {}s",
            operation,
            e,
            delay.as_secs()
        ));
    })
    .await
    .map_err(|e| {
        logger.error(&format!("Package {} failed: {:#}", operation, e));
        PrepareError::PackageOperationFailed {
            operation: operation.to_string(),
            attempts: policy.attempts.max(1),
        }
    })
}

/// Package-manager front end used by the environment preparer
pub struct PackageInstaller<P = SystemLockProbe> {
    manager: PackageManager,
    probe: P,
    lock_wait: LockWaitConfig,
    retry: RetryPolicy,
    kill_stale: bool,
    launcher: Vec<String>,
    logger: RunLogger,
}

impl PackageInstaller<SystemLockProbe> {
    /// Installer for the host's package manager.
    ///
    /// Commands go through `sudo -n` when the agent is not running as root.
    pub fn detect(kill_stale: bool, logger: RunLogger) -> Result<Self, PrepareError> {
        let manager = PackageManager::detect().ok_or(PrepareError::NoPackageManager)?;
        let installer = Self::new(manager, SystemLockProbe, kill_stale, logger);
        if !nix::unistd::geteuid().is_root() && find_in_path("sudo").is_some() {
            return Ok(installer.with_launcher(["sudo", "-n"]));
        }
        Ok(installer)
    }
}

impl<P: LockProbe> PackageInstaller<P> {
    pub fn new(manager: PackageManager, probe: P, kill_stale: bool, logger: RunLogger) -> Self {
        Self {
            manager,
            probe,
            lock_wait: LockWaitConfig::default(),
            retry: RetryPolicy::default(),
            kill_stale,
            launcher: Vec::new(),
            logger,
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: LockWaitConfig) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Prefix every package-manager and `pkill` invocation with `launcher`
    pub fn with_launcher<I, S>(mut self, launcher: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launcher = launcher.into_iter().map(Into::into).collect();
        self
    }

    pub fn manager(&self) -> PackageManager {
        self.manager
    }

    /// Refresh package metadata
    pub async fn update(&self) -> Result<(), PrepareError> {
        let (program, args) = self.manager.update_command();
        self.run_guarded("update", &program, &args).await
    }

    /// Install packages
    pub async fn install(&self, packages: &[&str]) -> Result<(), PrepareError> {
        if packages.is_empty() {
            return Ok(());
        }
        let (program, args) = self.manager.install_command(packages);
        self.run_guarded("install", &program, &args).await
    }

    async fn run_guarded(
        &self,
        operation: &str,
        program: &str,
        args: &[String],
    ) -> Result<(), PrepareError> {
        let this = self;
        with_retry(&self.retry, operation, &self.logger, move || {
            this.attempt(program, args)
        })
        .await
    }

    async fn attempt(&self, program: &str, args: &[String]) -> Result<()> {
        self.prepare_lock().await;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let (launched, full_args) = launch(&self.launcher, program, &args);
        let ok =
            run_command_streaming(&self.logger, launched, &full_args, &CommandConfig::for_setup())
                .await?;
        if !ok {
            anyhow::bail!("{} {} exited with failure", program, args.join(" "));
        }
        Ok(())
    }

    /// Wait for the lock, terminating stale holders if allowed
    async fn prepare_lock(&self) {
        let wait = wait_for_lock(&self.probe, self.manager, &self.lock_wait, &self.logger).await;
        if matches!(wait, LockWait::TimedOut { .. }) && self.kill_stale {
            kill_stale(
                self.manager,
                &self.launcher,
                self.lock_wait.poll_interval,
                &self.logger,
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Locked for the first `held_polls` probes
    struct FakeProbe {
        held_polls: u32,
        polls: AtomicU32,
    }

    impl FakeProbe {
        fn new(held_polls: u32) -> Self {
            Self {
                held_polls,
                polls: AtomicU32::new(0),
            }
        }
    }

    impl LockProbe for FakeProbe {
        async fn is_locked(&self, _manager: PackageManager) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) < self.held_polls
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_lock_free_immediately() {
        let probe = FakeProbe::new(0);
        let result = wait_for_lock(
            &probe,
            PackageManager::Apt,
            &LockWaitConfig::default(),
            &RunLogger::new(),
        )
        .await;
        assert_eq!(
            result,
            LockWait::Released {
                waited: Duration::ZERO
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_lock_released_after_polls() {
        let probe = FakeProbe::new(3);
        let result = wait_for_lock(
            &probe,
            PackageManager::Apt,
            &LockWaitConfig::default(),
            &RunLogger::new(),
        )
        .await;
        assert_eq!(
            result,
            LockWait::Released {
                waited: Duration::from_secs(15)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_lock_is_bounded() {
        let sink = Arc::new(MemorySink::new());
        let logger = RunLogger::new().with_sink(sink.clone());
        let probe = FakeProbe::new(u32::MAX);

        let result = wait_for_lock(&probe, PackageManager::Dnf, &LockWaitConfig::default(), &logger)
            .await;

        assert_eq!(
            result,
            LockWait::TimedOut {
                waited: Duration::from_secs(300)
            }
        );
        // One probe at t=0 plus one per 5s poll up to the bound
        assert_eq!(probe.polls.load(Ordering::SeqCst), 61);
        assert!(sink.contains("proceeding anyway"));
    }

    /// Stand-in launcher that appends each command line to `record`
    fn recording_launcher(dir: &Path, record: &Path) -> String {
        let path = dir.join("launcher");
        std::fs::write(
            &path,
            format!("#!/bin/sh\necho \"$@\" >> {}\n", record.display()),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn short_lock_wait() -> LockWaitConfig {
        LockWaitConfig {
            poll_interval: Duration::from_millis(20),
            max_wait: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_install_proceeds_after_lock_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("commands");
        let sink = Arc::new(MemorySink::new());
        let logger = RunLogger::new().with_sink(sink.clone());

        let installer =
            PackageInstaller::new(PackageManager::Dnf, FakeProbe::new(u32::MAX), false, logger)
                .with_lock_wait(short_lock_wait())
                .with_launcher([recording_launcher(dir.path(), &record)]);
        let start = Instant::now();
        installer.install(&["git", "make"]).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(sink.contains("proceeding anyway"));
        assert!(!sink.contains("Terminating stale"));
        assert_eq!(
            std::fs::read_to_string(&record).unwrap(),
            "dnf install -y -q git make\n"
        );
    }

    #[tokio::test]
    async fn test_stale_holders_killed_before_install() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("commands");
        let sink = Arc::new(MemorySink::new());
        let logger = RunLogger::new().with_sink(sink.clone());

        let installer =
            PackageInstaller::new(PackageManager::Yum, FakeProbe::new(u32::MAX), true, logger)
                .with_lock_wait(short_lock_wait())
                .with_launcher([recording_launcher(dir.path(), &record)]);
        installer.update().await.unwrap();

        let commands = std::fs::read_to_string(&record).unwrap();
        let commands: Vec<&str> = commands.lines().collect();
        assert_eq!(
            commands,
            vec![
                "pkill -TERM -x yum",
                "pkill -TERM -x yum-cron",
                "pkill -TERM -x rpm",
                "pkill -KILL -x yum",
                "pkill -KILL -x yum-cron",
                "pkill -KILL -x rpm",
                "yum makecache -y -q",
            ]
        );
        assert!(sink.contains("Terminating stale yum processes"));
    }

    #[test]
    fn test_launch_prefixes_command() {
        let sudo = vec!["sudo".to_string(), "-n".to_string()];
        assert_eq!(
            launch(&sudo, "pkill", &["-TERM", "-x", "dnf"]),
            ("sudo", vec!["-n", "pkill", "-TERM", "-x", "dnf"])
        );
        assert_eq!(launch(&[], "dnf", &["makecache"]), ("dnf", vec!["makecache"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::default(), "update", &RunLogger::new(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(anyhow::anyhow!("lock held"));
            }
            Ok::<_, anyhow::Error>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_fatal() {
        let sink = Arc::new(MemorySink::new());
        let logger = RunLogger::new().with_sink(sink.clone());
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = with_retry(&RetryPolicy::default(), "install", &logger, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("network unreachable"))
        })
        .await;

        assert!(matches!(
            result,
            Err(PrepareError::PackageOperationFailed { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(
            sink.lines().iter().filter(|l| l.contains("retrying in 10s")).count(),
            2
        );
    }

    #[test]
    fn test_apt_commands_are_noninteractive() {
        let (program, args) = PackageManager::Apt.install_command(&["git", "make"]);
        assert_eq!(program, "env");
        assert_eq!(args[0], "DEBIAN_FRONTEND=noninteractive");
        assert_eq!(args[1], "apt-get");
        assert!(args.contains(&"-y".to_string()));
        assert_eq!(&args[args.len() - 2..], ["git", "make"]);
    }

    #[test]
    fn test_rpm_commands() {
        let (program, args) = PackageManager::Dnf.install_command(&["erlang"]);
        assert_eq!(program, "dnf");
        assert_eq!(args, ["install", "-y", "-q", "erlang"]);

        let (program, args) = PackageManager::Yum.update_command();
        assert_eq!(program, "yum");
        assert_eq!(args[0], "makecache");
    }

    #[test]
    fn test_process_names_fit_pgrep() {
        for pm in [PackageManager::Apt, PackageManager::Dnf, PackageManager::Yum] {
            assert!(pm.process_names().iter().all(|n| n.len() <= 15));
        }
    }

    #[test]
    fn test_package_for_tool() {
        assert_eq!(PackageManager::Apt.package_for("erl"), "erlang");
        assert_eq!(PackageManager::Apt.package_for("gcc"), "build-essential");
        assert_eq!(PackageManager::Yum.package_for("gcc"), "gcc");
        assert_eq!(PackageManager::Yum.package_for("git"), "git");
    }
}
