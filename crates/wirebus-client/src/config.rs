//! # Bus Configuration
//!
//! Loaded from an optional JSON file, then overridden by environment
//! variables. Every field has a default so an empty file is valid.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use wirebus_transport::BackoffPolicy;
use wirebus_types::{BusError, StreamLayout};

/// How processes serving the same API share its calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcServingMode {
    /// Every serving process joins one consumer group and calls are
    /// load-balanced between them.
    #[default]
    Compete,
    /// One process at a time serves the API, guarded by a renewable lease.
    Exclusive,
}

/// Consumer loop tuning shared by every subscription of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub block_ms: u64,
    pub retry_delay_ms: u64,
    /// Entries idle this long in another consumer are claimed. Zero disables.
    pub claim_timeout_ms: u64,
    /// Zero retries forever.
    pub max_reconnect_attempts: u32,
    pub backoff_first_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block_ms: 1_000,
            retry_delay_ms: 1_000,
            claim_timeout_ms: 60_000,
            max_reconnect_attempts: 10,
            backoff_first_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

impl ConsumerSettings {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn claim_timeout(&self) -> Option<Duration> {
        (self.claim_timeout_ms > 0).then(|| Duration::from_millis(self.claim_timeout_ms))
    }

    pub fn max_reconnect_attempts(&self) -> Option<u32> {
        (self.max_reconnect_attempts > 0).then_some(self.max_reconnect_attempts)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.backoff_first_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            ..BackoffPolicy::default()
        }
    }
}

/// Configuration of one bus process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Logical service. Processes of one service share event listener groups.
    pub service_name: String,
    /// Unique per process; names the results channel and consumers.
    pub process_name: String,
    /// `memory://` or `redis://host:port/db`.
    pub transport_url: String,
    /// Schema store location. Defaults to the transport URL.
    pub schema_url: Option<String>,
    pub schema_ttl_ms: u64,
    pub rpc_timeout_ms: u64,
    /// Lifetime of a process's results channel once nothing renews it.
    pub result_ttl_ms: u64,
    /// Calls handled at once per served API.
    pub rpc_worker_limit: usize,
    pub rpc_serving_mode: RpcServingMode,
    pub rpc_lease_ttl_ms: u64,
    pub stream_layout: StreamLayout,
    /// Entries kept per stream before trimming.
    pub max_stream_length: usize,
    pub validate_outgoing: bool,
    pub validate_incoming: bool,
    /// Fail calls and fires for APIs whose schema is unknown instead of
    /// sending them unvalidated.
    pub strict_validation: bool,
    pub stop_grace_ms: u64,
    pub consumer: ConsumerSettings,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: random_name("service"),
            process_name: random_name("process"),
            transport_url: "memory://".to_string(),
            schema_url: None,
            schema_ttl_ms: 60_000,
            rpc_timeout_ms: 5_000,
            result_ttl_ms: 60_000,
            rpc_worker_limit: 10,
            rpc_serving_mode: RpcServingMode::Compete,
            rpc_lease_ttl_ms: 10_000,
            stream_layout: StreamLayout::PerApi,
            max_stream_length: wirebus_transport::DEFAULT_MAX_STREAM_LENGTH,
            validate_outgoing: true,
            validate_incoming: true,
            strict_validation: false,
            stop_grace_ms: 10_000,
            consumer: ConsumerSettings::default(),
        }
    }
}

fn random_name(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{prefix}-{suffix:08x}")
}

impl BusConfig {
    /// Defaults with explicit service and process names.
    pub fn named(service_name: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            process_name: process_name.into(),
            ..Self::default()
        }
    }

    /// Load from `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, BusError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    BusError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                let config: Self = serde_json::from_str(&raw).map_err(|e| {
                    BusError::Config(format!("invalid config {}: {e}", path.display()))
                })?;
                info!("Loaded bus configuration from {}", path.display());
                config
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `WIREBUS_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("WIREBUS_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Some(name) = lookup("WIREBUS_PROCESS_NAME") {
            self.process_name = name;
        }
        if let Some(url) = lookup("WIREBUS_TRANSPORT_URL") {
            self.transport_url = url;
        }
        if let Some(url) = lookup("WIREBUS_SCHEMA_URL") {
            self.schema_url = Some(url);
        }
        if let Some(ms) = lookup("WIREBUS_RPC_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.rpc_timeout_ms = ms;
        }
        if let Some(ms) = lookup("WIREBUS_RESULT_TTL_MS").and_then(|v| v.parse().ok()) {
            self.result_ttl_ms = ms;
        }
    }

    /// Check names and limits.
    pub fn validate(&self) -> Result<(), BusError> {
        for (field, value) in [
            ("service_name", &self.service_name),
            ("process_name", &self.process_name),
        ] {
            if value.is_empty() {
                return Err(BusError::Config(format!("{field} must not be empty")));
            }
            if value.contains(':') || value.chars().any(char::is_whitespace) {
                return Err(BusError::Config(format!(
                    "{field} '{value}' must not contain ':' or whitespace"
                )));
            }
        }
        if self.rpc_timeout_ms == 0 {
            return Err(BusError::Config("rpc_timeout_ms must be positive".into()));
        }
        if self.result_ttl_ms == 0 {
            return Err(BusError::Config("result_ttl_ms must be positive".into()));
        }
        if self.rpc_worker_limit == 0 {
            return Err(BusError::Config("rpc_worker_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_millis(self.result_ttl_ms)
    }

    pub fn schema_ttl(&self) -> Duration {
        Duration::from_millis(self.schema_ttl_ms)
    }

    pub fn rpc_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.rpc_lease_ttl_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn schema_url(&self) -> &str {
        self.schema_url.as_deref().unwrap_or(&self.transport_url)
    }
}
