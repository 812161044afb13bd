//! Default configuration values
//!
//! Every option that is not supplied by instance metadata or the environment
//! falls back to one of these constants.

/// Plain MQTT broker port
pub const DEFAULT_PORT: u16 = 1883;

/// MQTT-over-TLS broker port, used when SSL is enabled and no port is given
pub const DEFAULT_SSL_PORT: u16 = 8883;

/// Number of simulated clients
pub const DEFAULT_CLIENT_COUNT: u32 = 100;

/// Delay between client connections, in milliseconds
pub const DEFAULT_CONNECT_INTERVAL_MS: u64 = 10;

/// MQTT QoS level for published and subscribed messages
pub const DEFAULT_QOS: u8 = 1;

/// Topic pattern (`%i` expands to the client sequence number)
pub const DEFAULT_TOPIC: &str = "bench/%i";

/// Payload size in bytes
pub const DEFAULT_PAYLOAD_SIZE: u32 = 256;

/// Delay between messages from one publisher, in milliseconds
pub const DEFAULT_MESSAGE_INTERVAL_MS: u64 = 1000;

/// Test duration in seconds
pub const DEFAULT_DURATION_SECS: u64 = 60;

/// emqtt-bench release to install
pub const DEFAULT_BENCH_VERSION: &str = "0.4.25";

/// Installation prefix for the emqtt-bench release
pub const DEFAULT_INSTALL_DIR: &str = "/opt/emqtt-bench";

/// Upstream source repository for source builds
pub const DEFAULT_SOURCE_REPO: &str = "https://github.com/emqx/emqtt-bench.git";

/// Base URL for upstream release downloads
pub const RELEASE_BASE_URL: &str = "https://github.com/emqx/emqtt-bench/releases/download";

/// Directory for run logs and summaries
pub const DEFAULT_LOG_DIR: &str = "/var/log/emqtt-bench";

/// Number of past runs whose logs are kept
pub const DEFAULT_LOG_RETENTION: u32 = 20;

/// Seconds to let a background subscriber connect before publishing
pub const SETTLE_PERIOD_SECS: u64 = 5;

/// Exit code reported for a process stopped by its wall-clock timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Package-manager lock polling interval, in seconds
pub const LOCK_POLL_INTERVAL_SECS: u64 = 5;

/// Maximum total wait for a package-manager lock, in seconds
pub const LOCK_MAX_WAIT_SECS: u64 = 300;

/// Attempts for package-manager update/install operations
pub const PACKAGE_RETRY_ATTEMPTS: u32 = 3;

/// Fixed backoff between package-manager attempts, in seconds
pub const PACKAGE_RETRY_BACKOFF_SECS: u64 = 10;

/// Instance metadata endpoint for custom instance attributes
pub const DEFAULT_METADATA_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/attributes";

/// Header the metadata server requires on every request
pub const METADATA_HEADER: (&str, &str) = ("Metadata-Flavor", "Google");
