//! Configuration resolution: metadata, then environment, then defaults
//!
//! Every option is looked up exactly once. Raw strings are parsed into the
//! typed [`BenchConfig`] here; unparseable or out-of-range values fall back
//! to the default with a warning. Only a missing broker host is fatal.

use crate::error::ConfigError;
use crate::sources::ConfigSource;
use garde::Validate;
use mqtt_bench_common::config::default_port;
use mqtt_bench_common::defaults::*;
use mqtt_bench_common::{BenchConfig, InstallMethod, OptionKey, TestMode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValueSource {
    Metadata,
    Environment,
    Default,
    /// Overridden by an agent command-line flag
    #[serde(rename = "command-line")]
    #[strum(serialize = "command-line")]
    CommandLine,
}

/// Resolved configuration plus per-option provenance
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: BenchConfig,
    pub provenance: BTreeMap<OptionKey, ValueSource>,
}

impl ResolvedConfig {
    pub fn source_of(&self, key: OptionKey) -> Option<ValueSource> {
        self.provenance.get(&key).copied()
    }

    /// Replace the resolved test mode with one given on the command line
    pub fn override_test_mode(&mut self, mode: TestMode) {
        if mode != self.config.test_mode {
            info!(from = %self.config.test_mode, to = %mode, "Test mode overridden");
        }
        self.config.test_mode = mode;
        self.provenance.insert(OptionKey::TestMode, ValueSource::CommandLine);
    }
}

/// Resolves options from a metadata source and an environment source
pub struct ConfigResolver<M, E> {
    metadata: M,
    env: E,
}

impl<M: ConfigSource, E: ConfigSource> ConfigResolver<M, E> {
    pub fn new(metadata: M, env: E) -> Self {
        Self { metadata, env }
    }

    /// Resolve every option and validate the record
    pub async fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let mut provenance = BTreeMap::new();

        let (broker_host, source) = self
            .lookup(OptionKey::BrokerHost)
            .await
            .ok_or(ConfigError::MissingBrokerHost)?;
        provenance.insert(OptionKey::BrokerHost, source);
        let mut config = BenchConfig::new(broker_host);

        // The port default depends on SSL, so SSL goes first
        config.use_ssl = self.flag(OptionKey::UseSsl, false, &mut provenance).await;
        config.broker_port = self
            .parsed(
                OptionKey::BrokerPort,
                default_port(config.use_ssl),
                |p: &u16| *p > 0,
                &mut provenance,
            )
            .await;
        config.client_count = self
            .parsed(OptionKey::ClientCount, DEFAULT_CLIENT_COUNT, |n: &u32| *n > 0, &mut provenance)
            .await;
        config.connect_interval_ms = self
            .parsed(
                OptionKey::ConnectInterval,
                DEFAULT_CONNECT_INTERVAL_MS,
                |n: &u64| *n > 0,
                &mut provenance,
            )
            .await;
        config.qos = self
            .parsed(OptionKey::Qos, DEFAULT_QOS, |q: &u8| *q <= 2, &mut provenance)
            .await;
        config.topic = self.text(OptionKey::Topic, DEFAULT_TOPIC, &mut provenance).await;
        config.payload_size = self
            .parsed(OptionKey::PayloadSize, DEFAULT_PAYLOAD_SIZE, |n: &u32| *n > 0, &mut provenance)
            .await;
        config.message_interval_ms = self
            .parsed(
                OptionKey::MessageInterval,
                DEFAULT_MESSAGE_INTERVAL_MS,
                |n: &u64| *n > 0,
                &mut provenance,
            )
            .await;
        config.duration_secs = self
            .parsed(OptionKey::Duration, DEFAULT_DURATION_SECS, |n: &u64| *n > 0, &mut provenance)
            .await;
        config.username = self.text(OptionKey::Username, "", &mut provenance).await;
        config.password = self.text(OptionKey::Password, "", &mut provenance).await;
        config.ssl_certfile = self.text(OptionKey::SslCertfile, "", &mut provenance).await;
        config.ssl_keyfile = self.text(OptionKey::SslKeyfile, "", &mut provenance).await;
        config.use_websocket = self.flag(OptionKey::UseWebsocket, false, &mut provenance).await;
        config.test_mode = self
            .parsed(OptionKey::TestMode, TestMode::default(), |_| true, &mut provenance)
            .await;
        config.install_method = self
            .parsed(OptionKey::InstallMethod, InstallMethod::default(), |_| true, &mut provenance)
            .await;
        config.bench_version = self
            .text(OptionKey::BenchVersion, DEFAULT_BENCH_VERSION, &mut provenance)
            .await;
        config.install_dir = PathBuf::from(
            self.text(OptionKey::InstallDir, DEFAULT_INSTALL_DIR, &mut provenance)
                .await,
        );
        config.source_repo = self
            .text(OptionKey::SourceRepo, DEFAULT_SOURCE_REPO, &mut provenance)
            .await;
        let mirror = self.text(OptionKey::DownloadMirror, "", &mut provenance).await;
        config.download_mirror = (!mirror.is_empty()).then_some(mirror);
        config.log_dir =
            PathBuf::from(self.text(OptionKey::LogDir, DEFAULT_LOG_DIR, &mut provenance).await);
        config.log_retention = self
            .parsed(OptionKey::LogRetention, DEFAULT_LOG_RETENTION, |n: &u32| *n > 0, &mut provenance)
            .await;
        config.kill_stale_package_manager = self
            .flag(OptionKey::KillStalePackageManager, false, &mut provenance)
            .await;

        config.validate()?;
        Ok(ResolvedConfig { config, provenance })
    }

    /// First non-empty raw value, metadata before environment
    async fn lookup(&self, key: OptionKey) -> Option<(String, ValueSource)> {
        if let Some(value) = non_empty(self.metadata.get(key.name()).await) {
            debug!(key = %key, source = self.metadata.name(), "Resolved from metadata");
            return Some((value, ValueSource::Metadata));
        }
        if let Some(value) = non_empty(self.env.get(key.name()).await) {
            debug!(key = %key, source = self.env.name(), "Resolved from environment");
            return Some((value, ValueSource::Environment));
        }
        None
    }

    async fn text(
        &self,
        key: OptionKey,
        default: &str,
        provenance: &mut BTreeMap<OptionKey, ValueSource>,
    ) -> String {
        match self.lookup(key).await {
            Some((value, source)) => {
                provenance.insert(key, source);
                value
            }
            None => {
                provenance.insert(key, ValueSource::Default);
                default.to_string()
            }
        }
    }

    async fn flag(
        &self,
        key: OptionKey,
        default: bool,
        provenance: &mut BTreeMap<OptionKey, ValueSource>,
    ) -> bool {
        let Some((raw, source)) = self.lookup(key).await else {
            provenance.insert(key, ValueSource::Default);
            return default;
        };
        match parse_bool(&raw) {
            Some(value) => {
                provenance.insert(key, source);
                value
            }
            None => {
                warn!(key = %key, value = %raw, default, "Not a boolean, using default");
                provenance.insert(key, ValueSource::Default);
                default
            }
        }
    }

    async fn parsed<T>(
        &self,
        key: OptionKey,
        default: T,
        valid: impl Fn(&T) -> bool,
        provenance: &mut BTreeMap<OptionKey, ValueSource>,
    ) -> T
    where
        T: FromStr + std::fmt::Display,
    {
        let Some((raw, source)) = self.lookup(key).await else {
            provenance.insert(key, ValueSource::Default);
            return default;
        };
        match raw.parse::<T>() {
            Ok(value) if valid(&value) => {
                provenance.insert(key, source);
                value
            }
            _ => {
                warn!(key = %key, value = %raw, default = %default, "Invalid value, using default");
                provenance.insert(key, ValueSource::Default);
                default
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse shell-style booleans
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
