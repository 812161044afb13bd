//! emqtt-bench installation: release download or source build
//!
//! Both paths leave a release tree in the install directory with the
//! launcher at `<install-dir>/bin/emqtt_bench`, and record the installed
//! version in a marker file so that service restarts skip reinstalling.

use crate::error::PrepareError;
use crate::logging::RunLogger;
use crate::packages::PackageInstaller;
use crate::platform::{FALLBACK_BUILD_TAG, Platform, find_in_path};
use crate::process::{CommandConfig, run_command_streaming};
use anyhow::{Context, Result};
use mqtt_bench_common::defaults::RELEASE_BASE_URL;
use mqtt_bench_common::{BenchConfig, InstallMethod};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Marker file recording the installed version
pub const INSTALLED_VERSION_MARKER: &str = ".installed-version";

/// Launcher location inside a finished source build
pub const BUILD_OUTPUT_REL_PATH: &str = "_build/emqtt_bench/rel/emqtt_bench/bin/emqtt_bench";

/// Tools a source build needs on `PATH`
const BUILD_TOOLS: &[&str] = &["git", "make", "gcc", "erl"];

/// Release archive file name
pub fn artifact_name(version: &str, build_tag: &str, arch: &str) -> String {
    format!("emqtt-bench-{}-{}-{}.tar.gz", version, build_tag, arch)
}

/// Ordered download URLs for a release archive.
///
/// Mirror first (if configured), then the GitHub release under both tag
/// spellings. When the host OS has its own build tag, the same locations
/// are tried again with the fallback tag.
pub fn download_candidates(config: &BenchConfig, platform: &Platform) -> Vec<String> {
    let version = config.bench_version.trim_start_matches('v');
    let mut tags = vec![platform.build_tag];
    if platform.build_tag != FALLBACK_BUILD_TAG {
        tags.push(FALLBACK_BUILD_TAG);
    }

    let mut candidates = Vec::new();
    for tag in tags {
        let artifact = artifact_name(version, tag, platform.arch.as_ref());
        if let Some(mirror) = config.download_mirror.as_deref() {
            candidates.push(format!("{}/{}", mirror.trim_end_matches('/'), artifact));
        }
        candidates.push(format!("{}/{}/{}", RELEASE_BASE_URL, version, artifact));
        candidates.push(format!("{}/v{}/{}", RELEASE_BASE_URL, version, artifact));
    }
    candidates.dedup();
    candidates
}

/// Version recorded by a previous installation, if its launcher still exists
pub fn installed_version(install_dir: &Path) -> Option<String> {
    if !install_dir.join(mqtt_bench_common::config::BENCH_BINARY_REL_PATH).is_file() {
        return None;
    }
    let version = std::fs::read_to_string(install_dir.join(INSTALLED_VERSION_MARKER)).ok()?;
    Some(version.trim().to_string())
}

/// Installs emqtt-bench according to the configured method
pub struct Installer<'a> {
    config: &'a BenchConfig,
    platform: &'a Platform,
    logger: RunLogger,
    client: reqwest::Client,
    build_tools: &'static [&'static str],
}

impl<'a> Installer<'a> {
    pub fn new(config: &'a BenchConfig, platform: &'a Platform, logger: RunLogger) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to build download HTTP client")?;
        Ok(Self {
            config,
            platform,
            logger,
            client,
            build_tools: BUILD_TOOLS,
        })
    }

    /// Tools checked (and installed if missing) before a source build
    pub fn with_build_tools(mut self, tools: &'static [&'static str]) -> Self {
        self.build_tools = tools;
        self
    }

    /// Make sure the launcher is installed and return its path
    pub async fn ensure_installed(&self) -> Result<PathBuf> {
        let binary = self.config.binary_path();
        let wanted = self.config.bench_version.trim_start_matches('v');

        if installed_version(&self.config.install_dir).as_deref() == Some(wanted) {
            self.logger.info(&format!(
                "emqtt-bench {} already installed at {}",
                wanted,
                binary.display()
            ));
            return Ok(binary);
        }

        std::fs::create_dir_all(&self.config.install_dir).with_context(|| {
            format!(
                "Failed to create install dir {}",
                self.config.install_dir.display()
            )
        })?;

        match self.config.install_method {
            InstallMethod::Binary => self.install_release().await?,
            InstallMethod::Source => self.build_from_source().await?,
        }

        if !binary.is_file() {
            return Err(PrepareError::BinaryMissing(binary).into());
        }
        std::fs::write(self.config.install_dir.join(INSTALLED_VERSION_MARKER), wanted)
            .context("Failed to write installed-version marker")?;

        self.logger
            .info(&format!("emqtt-bench {} installed at {}", wanted, binary.display()));
        Ok(binary)
    }

    async fn install_release(&self) -> Result<()> {
        self.logger.info(&format!(
            "=== Installing emqtt-bench {} release ({}/{}) ===",
            self.config.bench_version, self.platform.build_tag, self.platform.arch
        ));
        if !self.platform.recognized {
            self.logger.warn(&format!(
                "Unrecognized OS '{}' {}, using {} build",
                self.platform.os.id, self.platform.os.version_id, FALLBACK_BUILD_TAG
            ));
        }

        let candidates = download_candidates(self.config, self.platform);
        let archive = self.config.install_dir.join("emqtt-bench.tar.gz");
        let url = download_first(&self.client, &candidates, &archive, &self.logger).await?;
        self.logger.info(&format!("Downloaded {}", url));

        if find_in_path("tar").is_none() {
            let packages = PackageInstaller::detect(
                self.config.kill_stale_package_manager,
                self.logger.clone(),
            )?;
            packages.install(&["tar"]).await?;
        }

        let install_dir = self.config.install_dir.to_string_lossy();
        let archive_path = archive.to_string_lossy();
        let extracted = run_command_streaming(
            &self.logger,
            "tar",
            &["-xzf", &archive_path, "-C", &install_dir],
            &CommandConfig::for_setup(),
        )
        .await?;
        if let Err(e) = std::fs::remove_file(&archive) {
            self.logger
                .warn(&format!("Failed to remove {}: {}", archive.display(), e));
        }
        if !extracted {
            anyhow::bail!("Failed to extract {}", archive.display());
        }
        Ok(())
    }

    async fn build_from_source(&self) -> Result<()> {
        self.logger.info(&format!(
            "=== Building emqtt-bench {} from {} ===",
            self.config.bench_version, self.config.source_repo
        ));
        self.ensure_build_tools().await?;

        let src_dir = self.config.install_dir.join("src");
        let src = src_dir.to_string_lossy();
        self.checkout_source(&src_dir).await?;

        let built =
            run_command_streaming(&self.logger, "make", &["-C", &src], &CommandConfig::for_build())
                .await?;
        if !built {
            anyhow::bail!("make failed in {}", src_dir.display());
        }

        let output = src_dir.join(BUILD_OUTPUT_REL_PATH);
        if !output.is_file() {
            return Err(PrepareError::BuildOutputMissing(output).into());
        }

        // Copy the release tree (bin/, lib/, releases/) into the install dir
        let release_dir = src_dir.join("_build/emqtt_bench/rel/emqtt_bench/.");
        let release = release_dir.to_string_lossy();
        let install_dir = self.config.install_dir.to_string_lossy();
        let copied = run_command_streaming(
            &self.logger,
            "cp",
            &["-a", &release, &install_dir],
            &CommandConfig::for_setup(),
        )
        .await?;
        if !copied {
            anyhow::bail!("Failed to copy build output into {}", install_dir);
        }
        Ok(())
    }

    /// Leave `src_dir` checked out at the configured version tag.
    ///
    /// An existing tree is moved to the tag, fetching it first; if that fails
    /// the tree is cloned again. A tree at another version is never built.
    async fn checkout_source(&self, src_dir: &Path) -> Result<()> {
        let version = self.config.bench_version.as_str();
        let src = src_dir.to_string_lossy();

        if src_dir.join(".git").is_dir() {
            self.logger
                .info(&format!("Switching existing source tree to {}", version));
            let refspec = format!("refs/tags/{0}:refs/tags/{0}", version);
            let fetched = self
                .git(&["-C", &src, "fetch", "--depth", "1", "--force", "origin", &refspec])
                .await;
            if !matches!(fetched, Ok(true)) {
                self.logger
                    .warn(&format!("git fetch of {} failed, trying the local tag", version));
            }

            let tag = format!("refs/tags/{}", version);
            let checked_out = self
                .git(&["-C", &src, "checkout", "--force", "--detach", &tag])
                .await;
            if matches!(checked_out, Ok(true)) {
                return Ok(());
            }

            self.logger.warn(&format!(
                "Cannot check out {} in {}, cloning again",
                version,
                src_dir.display()
            ));
            std::fs::remove_dir_all(src_dir)
                .with_context(|| format!("Failed to remove {}", src_dir.display()))?;
        }

        let cloned = self
            .git(&[
                "clone",
                "--depth",
                "1",
                "--branch",
                version,
                &self.config.source_repo,
                &src,
            ])
            .await?;
        if !cloned {
            anyhow::bail!(
                "Failed to clone {} at {}",
                self.config.source_repo,
                version
            );
        }
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<bool> {
        run_command_streaming(&self.logger, "git", args, &CommandConfig::for_setup()).await
    }

    async fn ensure_build_tools(&self) -> Result<()> {
        let missing: Vec<&'static str> = self
            .build_tools
            .iter()
            .copied()
            .filter(|tool| find_in_path(tool).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        self.logger
            .info(&format!("Installing missing build tools: {}", missing.join(", ")));
        let packages =
            PackageInstaller::detect(self.config.kill_stale_package_manager, self.logger.clone())?;
        let mut names: Vec<&str> = missing
            .iter()
            .map(|&tool| packages.manager().package_for(tool))
            .collect();
        names.dedup();

        packages.update().await?;
        packages.install(&names).await?;
        Ok(())
    }
}

/// Detect the host and make sure emqtt-bench is installed.
///
/// Returns the detected platform and the launcher path.
pub async fn prepare_environment(
    config: &BenchConfig,
    logger: &RunLogger,
) -> Result<(Platform, PathBuf)> {
    let platform = Platform::detect()?;
    let binary = {
        let installer = Installer::new(config, &platform, logger.clone())?;
        installer.ensure_installed().await?
    };
    Ok((platform, binary))
}

/// Download the first candidate that answers 2xx into `dest`; returns its URL.
///
/// Each failing candidate is logged as a warning.
pub async fn download_first(
    client: &reqwest::Client,
    candidates: &[String],
    dest: &Path,
    logger: &RunLogger,
) -> Result<String, PrepareError> {
    for url in candidates {
        logger.info(&format!("Downloading {}", url));
        match download(client, url, dest).await {
            Ok(bytes) => {
                logger.info(&format!("Saved {} bytes to {}", bytes, dest.display()));
                return Ok(url.clone());
            }
            Err(e) => {
                logger.warn(&format!("Download failed from {}: {:#}", url, e));
                let _ = tokio::fs::remove_file(dest).await;
            }
        }
    }

    let artifact = candidates
        .first()
        .and_then(|url| url.rsplit('/').next())
        .unwrap_or_default()
        .to_string();
    Err(PrepareError::DownloadExhausted {
        artifact,
        attempts: candidates.len(),
    })
}

async fn download(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64> {
    let mut response = client
        .get(url)
        .send()
        .await
        .context("request failed")?
        .error_for_status()
        .context("server returned an error status")?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.context("transfer interrupted")? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::platform::{Architecture, OsRelease};
    use crate::testing::{Route, serve_http, test_config};
    use std::sync::Arc;

    fn platform(id: &str, version: &str) -> Platform {
        Platform::new(
            Architecture::Amd64,
            OsRelease {
                id: id.to_string(),
                id_like: Vec::new(),
                version_id: version.to_string(),
            },
        )
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(
            artifact_name("0.4.25", "ubuntu22.04", "arm64"),
            "emqtt-bench-0.4.25-ubuntu22.04-arm64.tar.gz"
        );
    }

    #[test]
    fn test_candidates_order_with_mirror_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.bench_version = "0.4.25".to_string();
        config.download_mirror = Some("https://mirror.example.com/bench/".to_string());

        let candidates = download_candidates(&config, &platform("debian", "12"));
        let primary = "emqtt-bench-0.4.25-debian12-amd64.tar.gz";
        let fallback = "emqtt-bench-0.4.25-ubuntu20.04-amd64.tar.gz";
        assert_eq!(
            candidates,
            vec![
                format!("https://mirror.example.com/bench/{}", primary),
                format!("{}/0.4.25/{}", RELEASE_BASE_URL, primary),
                format!("{}/v0.4.25/{}", RELEASE_BASE_URL, primary),
                format!("https://mirror.example.com/bench/{}", fallback),
                format!("{}/0.4.25/{}", RELEASE_BASE_URL, fallback),
                format!("{}/v0.4.25/{}", RELEASE_BASE_URL, fallback),
            ]
        );
    }

    #[test]
    fn test_candidates_without_fallback_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.bench_version = "v0.4.25".to_string();

        let candidates = download_candidates(&config, &platform("gentoo", "2"));
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].ends_with("/0.4.25/emqtt-bench-0.4.25-ubuntu20.04-amd64.tar.gz"));
        assert!(candidates[1].contains("/v0.4.25/"));
    }

    #[tokio::test]
    async fn test_download_first_skips_failures() {
        let base = serve_http(vec![
            Route::status("/a/bench.tar.gz", 500),
            Route::ok("/c/bench.tar.gz", "archive-bytes"),
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bench.tar.gz");
        let sink = Arc::new(MemorySink::new());
        let logger = RunLogger::new().with_sink(sink.clone());

        let candidates = vec![
            format!("{}/a/bench.tar.gz", base),
            format!("{}/b/bench.tar.gz", base),
            format!("{}/c/bench.tar.gz", base),
        ];
        let url = download_first(&reqwest::Client::new(), &candidates, &dest, &logger)
            .await
            .unwrap();

        assert_eq!(url, candidates[2]);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "archive-bytes");
        let warnings = sink
            .lines()
            .into_iter()
            .filter(|l| l.contains("[WARN] Download failed"))
            .count();
        assert_eq!(warnings, 2);
    }

    #[tokio::test]
    async fn test_download_exhausted() {
        let base = serve_http(vec![]).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("bench.tar.gz");

        let candidates = vec![
            format!("{}/x/emqtt-bench-1-t-amd64.tar.gz", base),
            format!("{}/y/emqtt-bench-1-t-amd64.tar.gz", base),
        ];
        let result =
            download_first(&reqwest::Client::new(), &candidates, &dest, &RunLogger::new()).await;

        match result {
            Err(PrepareError::DownloadExhausted { artifact, attempts }) => {
                assert_eq!(artifact, "emqtt-bench-1-t-amd64.tar.gz");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected DownloadExhausted, got {:?}", other.map(|_| ())),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_ensure_installed_short_circuits_on_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.bench_version = "0.4.25".to_string();
        // Unreachable mirror: any download attempt would fail
        config.download_mirror = Some("http://127.0.0.1:9".to_string());

        let bin_dir = config.install_dir.join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        crate::testing::fake_bench_binary(&bin_dir, "exit 0");
        std::fs::write(config.install_dir.join(INSTALLED_VERSION_MARKER), "0.4.25\n").unwrap();

        let platform = platform("ubuntu", "22.04");
        let installer = Installer::new(&config, &platform, RunLogger::new()).unwrap();
        let binary = installer.ensure_installed().await.unwrap();
        assert_eq!(binary, config.binary_path());
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=bench", "-c", "user.email=bench@example.com"])
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    /// Commit a Makefile whose launcher prints `version-<version>`, and tag it
    fn tag_release(repo: &Path, version: &str) {
        let bin_dir = Path::new(BUILD_OUTPUT_REL_PATH).parent().unwrap();
        let makefile = format!(
            "all:\n\tmkdir -p {dir}\n\tprintf '#!/bin/sh\\necho version-{version}\\n' > {bin}\n\tchmod +x {bin}\n",
            dir = bin_dir.display(),
            bin = BUILD_OUTPUT_REL_PATH,
        );
        std::fs::write(repo.join("Makefile"), makefile).unwrap();
        git(repo, &["add", "Makefile"]);
        git(repo, &["commit", "-q", "-m", version]);
        git(repo, &["tag", version]);
    }

    #[tokio::test]
    async fn test_source_build_follows_version_change() {
        if find_in_path("git").is_none() || find_in_path("make").is_none() {
            eprintln!("git or make not installed, skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        std::fs::create_dir_all(&upstream).unwrap();
        git(&upstream, &["init", "-q"]);
        tag_release(&upstream, "0.4.20");
        tag_release(&upstream, "0.4.25");

        let mut config = test_config(dir.path());
        config.install_method = InstallMethod::Source;
        config.source_repo = format!("file://{}", upstream.display());
        let platform = platform("ubuntu", "22.04");

        for version in ["0.4.20", "0.4.25"] {
            config.bench_version = version.to_string();
            let installer = Installer::new(&config, &platform, RunLogger::new())
                .unwrap()
                .with_build_tools(&["git", "make"]);
            let binary = installer.ensure_installed().await.unwrap();

            let output = std::process::Command::new(&binary).output().unwrap();
            assert_eq!(
                String::from_utf8_lossy(&output.stdout).trim(),
                format!("version-{}", version)
            );
            assert_eq!(installed_version(&config.install_dir).as_deref(), Some(version));
        }

        // A version that does not exist upstream fails instead of rebuilding 0.4.25
        config.bench_version = "0.9.9".to_string();
        let installer = Installer::new(&config, &platform, RunLogger::new())
            .unwrap()
            .with_build_tools(&["git", "make"]);
        assert!(installer.ensure_installed().await.is_err());
        assert_eq!(installed_version(&config.install_dir).as_deref(), Some("0.4.25"));
    }

    #[test]
    fn test_installed_version_requires_binary() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INSTALLED_VERSION_MARKER), "0.4.25").unwrap();
        assert_eq!(installed_version(dir.path()), None);

        let bin_dir = dir.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        crate::testing::fake_bench_binary(&bin_dir, "exit 0");
        assert_eq!(installed_version(dir.path()).as_deref(), Some("0.4.25"));
    }
}
