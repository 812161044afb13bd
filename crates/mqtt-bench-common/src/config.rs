//! Fully resolved benchmark configuration
//!
//! Built once per agent invocation by the resolver and read-only afterwards.
//! Validation is done via `garde::Validate`.

use crate::defaults::*;
use crate::mode::{InstallMethod, TestMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Relative path of the emqtt-bench launcher inside a release tree
pub const BENCH_BINARY_REL_PATH: &str = "bin/emqtt_bench";

/// Configuration record for one load-test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, garde::Validate)]
pub struct BenchConfig {
    /// MQTT broker hostname or address (required)
    #[garde(length(min = 1))]
    pub broker_host: String,

    /// MQTT broker port
    #[garde(range(min = 1))]
    pub broker_port: u16,

    /// Number of simulated clients
    #[garde(range(min = 1))]
    pub client_count: u32,

    /// Delay between client connections in milliseconds
    #[garde(range(min = 1))]
    pub connect_interval_ms: u64,

    /// QoS level (0, 1, or 2)
    #[garde(range(min = 0, max = 2))]
    pub qos: u8,

    /// Topic pattern
    #[garde(length(min = 1))]
    pub topic: String,

    /// Payload size in bytes
    #[garde(range(min = 1))]
    pub payload_size: u32,

    /// Delay between messages in milliseconds
    #[garde(range(min = 1))]
    pub message_interval_ms: u64,

    /// Test duration in seconds
    #[garde(range(min = 1))]
    pub duration_secs: u64,

    #[garde(skip)]
    pub username: String,

    #[serde(skip_serializing, default)]
    #[garde(skip)]
    pub password: String,

    /// Connect over TLS
    #[garde(skip)]
    pub use_ssl: bool,

    /// Client certificate path (TLS only, optional)
    #[garde(skip)]
    pub ssl_certfile: String,

    /// Client key path (TLS only, optional)
    #[garde(skip)]
    pub ssl_keyfile: String,

    /// Connect over WebSocket
    #[garde(skip)]
    pub use_websocket: bool,

    #[garde(skip)]
    pub test_mode: TestMode,

    #[garde(skip)]
    pub install_method: InstallMethod,

    /// emqtt-bench release (or source tag) to install
    #[garde(length(min = 1))]
    pub bench_version: String,

    #[garde(skip)]
    pub install_dir: PathBuf,

    #[garde(length(min = 1))]
    pub source_repo: String,

    /// Extra download location tried before upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub download_mirror: Option<String>,

    #[garde(skip)]
    pub log_dir: PathBuf,

    /// Number of past runs whose logs are kept
    #[garde(range(min = 1))]
    pub log_retention: u32,

    /// Kill package-manager processes still holding the lock after the wait
    #[garde(skip)]
    pub kill_stale_package_manager: bool,
}

impl BenchConfig {
    /// Configuration with every optional field at its default
    pub fn new(broker_host: impl Into<String>) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port: default_port(false),
            client_count: DEFAULT_CLIENT_COUNT,
            connect_interval_ms: DEFAULT_CONNECT_INTERVAL_MS,
            qos: DEFAULT_QOS,
            topic: DEFAULT_TOPIC.to_string(),
            payload_size: DEFAULT_PAYLOAD_SIZE,
            message_interval_ms: DEFAULT_MESSAGE_INTERVAL_MS,
            duration_secs: DEFAULT_DURATION_SECS,
            username: String::new(),
            password: String::new(),
            use_ssl: false,
            ssl_certfile: String::new(),
            ssl_keyfile: String::new(),
            use_websocket: false,
            test_mode: TestMode::default(),
            install_method: InstallMethod::default(),
            bench_version: DEFAULT_BENCH_VERSION.to_string(),
            install_dir: PathBuf::from(DEFAULT_INSTALL_DIR),
            source_repo: DEFAULT_SOURCE_REPO.to_string(),
            download_mirror: None,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            log_retention: DEFAULT_LOG_RETENTION,
            kill_stale_package_manager: false,
        }
    }

    /// Both username and password are set
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Approximate number of messages one publisher sends during the test.
    ///
    /// Never zero: a zero limit means "unlimited" to emqtt-bench.
    pub fn publish_message_count(&self) -> u64 {
        publish_message_count(self.duration_secs, self.message_interval_ms)
    }

    /// Path of the emqtt-bench launcher for a release install
    pub fn binary_path(&self) -> PathBuf {
        self.install_dir.join(BENCH_BINARY_REL_PATH)
    }
}

/// Default broker port given the SSL setting
pub fn default_port(use_ssl: bool) -> u16 {
    if use_ssl {
        DEFAULT_SSL_PORT
    } else {
        DEFAULT_PORT
    }
}

/// `floor(duration_secs * 1000 / interval_ms)`, clamped to at least 1
pub fn publish_message_count(duration_secs: u64, interval_ms: u64) -> u64 {
    if interval_ms == 0 {
        return 1;
    }
    (duration_secs.saturating_mul(1000) / interval_ms).max(1)
}
