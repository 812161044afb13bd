//! Configuration sources: instance metadata, environment, in-memory maps
//!
//! Every source answers `get(option-name)` with the raw string value, or
//! `None` when it has nothing usable for that key.

use anyhow::{Context, Result};
use mqtt_bench_common::defaults::METADATA_HEADER;
use mqtt_bench_common::option_key::env_var_name;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// A key/value configuration source
pub trait ConfigSource {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Raw value for an option name such as `broker-host`
    fn get(&self, key: &str) -> impl Future<Output = Option<String>>;
}

/// A disabled source yields nothing
impl<S: ConfigSource> ConfigSource for Option<S> {
    fn name(&self) -> &'static str {
        match self {
            Some(source) => source.name(),
            None => "disabled",
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        match self {
            Some(source) => source.get(key).await,
            None => None,
        }
    }
}

/// Cloud instance metadata server (custom instance attributes)
pub struct MetadataSource {
    client: reqwest::Client,
    base_url: String,
}

impl MetadataSource {
    /// Build a client for `base_url` without checking reachability
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(3))
            .build()
            .context("Failed to build metadata HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Build a client and return it only if the server answers at all.
    ///
    /// Any HTTP response counts as reachable; transport errors mean the host
    /// is not on a cloud instance and every lookup would just time out.
    pub async fn connect(base_url: impl Into<String>) -> Result<Option<Self>> {
        let source = Self::new(base_url)?;
        let probe = source
            .client
            .get(format!("{}/", source.base_url))
            .header(METADATA_HEADER.0, METADATA_HEADER.1)
            .send()
            .await;
        match probe {
            Ok(response) => {
                info!(url = %source.base_url, status = %response.status(), "Instance metadata reachable");
                Ok(Some(source))
            }
            Err(e) => {
                info!(url = %source.base_url, error = %e, "Instance metadata unreachable, skipping");
                Ok(None)
            }
        }
    }
}

impl ConfigSource for MetadataSource {
    fn name(&self) -> &'static str {
        "metadata"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let url = format!("{}/{}", self.base_url, key);
        let response = match self
            .client
            .get(&url)
            .header(METADATA_HEADER.0, METADATA_HEADER.1)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(key, error = %e, "Metadata lookup failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(key, status = %response.status(), "Metadata key not set");
            return None;
        }

        let body = response.text().await.ok()?;
        sanitize_metadata_value(&body)
    }
}

/// Trim a metadata response body, rejecting empty bodies and HTML error pages
pub fn sanitize_metadata_value(body: &str) -> Option<String> {
    let value = body.trim();
    if value.is_empty() {
        return None;
    }
    let lower = value.get(..15).unwrap_or(value).to_ascii_lowercase();
    if lower.starts_with("<!doctype") || lower.starts_with("<html") {
        return None;
    }
    Some(value.to_string())
}

/// Process environment; `broker-host` is read from `BROKER_HOST`
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn get(&self, key: &str) -> Option<String> {
        std::env::var(env_var_name(key)).ok()
    }
}

/// Fixed key/value map
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    values: HashMap<String, String>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl ConfigSource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}
