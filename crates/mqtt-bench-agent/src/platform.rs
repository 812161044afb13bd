//! Host platform detection: CPU architecture, OS build tag, tool lookup

use crate::error::PrepareError;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Build tag used when the OS is not recognized.
///
/// Ubuntu 20.04 builds link against the oldest glibc of the supported
/// tags, so they run on the widest range of distributions.
pub const FALLBACK_BUILD_TAG: &str = "ubuntu20.04";

/// CPU architectures with published emqtt-bench builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// Architecture of the running host, from the kernel's machine name.
    ///
    /// Falls back to the build target if `uname(2)` fails.
    pub fn detect() -> Result<Self, PrepareError> {
        let machine = nix::sys::utsname::uname()
            .map(|uts| uts.machine().to_string_lossy().into_owned())
            .unwrap_or_else(|_| std::env::consts::ARCH.to_string());
        Self::from_machine(&machine)
    }

    /// Map a `uname -m` style machine name
    pub fn from_machine(machine: &str) -> Result<Self, PrepareError> {
        match machine.trim() {
            "x86_64" | "amd64" => Ok(Self::Amd64),
            "aarch64" | "arm64" => Ok(Self::Arm64),
            other => Err(PrepareError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

/// Fields of interest from `/etc/os-release`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub version_id: String,
}

impl OsRelease {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("/etc/os-release"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let fields: HashMap<&str, String> = content
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim().trim_matches('"').trim_matches('\'').to_string()))
            .collect();

        Self {
            id: fields.get("ID").cloned().unwrap_or_default().to_ascii_lowercase(),
            id_like: fields
                .get("ID_LIKE")
                .map(|v| v.split_whitespace().map(|s| s.to_ascii_lowercase()).collect())
                .unwrap_or_default(),
            version_id: fields.get("VERSION_ID").cloned().unwrap_or_default(),
        }
    }

    fn major_version(&self) -> Option<u32> {
        self.version_id.split('.').next()?.parse().ok()
    }

    fn is_like(&self, family: &str) -> bool {
        self.id == family || self.id_like.iter().any(|id| id == family)
    }
}

/// Release build tag for an OS, or `None` when the OS is unrecognized
pub fn build_tag(os: &OsRelease) -> Option<&'static str> {
    let major = os.major_version()?;
    match os.id.as_str() {
        "ubuntu" => Some(match major {
            24.. => "ubuntu24.04",
            22..=23 => "ubuntu22.04",
            _ => "ubuntu20.04",
        }),
        "debian" => match major {
            12.. => Some("debian12"),
            11 => Some("debian11"),
            _ => None,
        },
        "amzn" => match major {
            2023.. => Some("amzn2023"),
            2 => Some("amzn2"),
            _ => None,
        },
        "rhel" | "centos" | "rocky" | "almalinux" | "ol" => el_tag(major),
        _ if os.is_like("rhel") || os.is_like("centos") => el_tag(major),
        _ => None,
    }
}

fn el_tag(major: u32) -> Option<&'static str> {
    match major {
        9.. => Some("el9"),
        8 => Some("el8"),
        _ => None,
    }
}

/// Host identity used to pick a download artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub arch: Architecture,
    pub os: OsRelease,
    /// Tag for the detected OS, or the fallback tag
    pub build_tag: &'static str,
    /// Whether `build_tag` came from OS detection
    pub recognized: bool,
}

impl Platform {
    pub fn new(arch: Architecture, os: OsRelease) -> Self {
        let (build_tag, recognized) = match build_tag(&os) {
            Some(tag) => (tag, true),
            None => (FALLBACK_BUILD_TAG, false),
        };
        Self {
            arch,
            os,
            build_tag,
            recognized,
        }
    }

    /// Detect architecture and OS of the running host
    pub fn detect() -> Result<Self> {
        let arch = Architecture::detect()?;
        let os = OsRelease::load().unwrap_or_default();
        Ok(Self::new(arch, os))
    }
}

/// Locate an executable on `PATH`
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
