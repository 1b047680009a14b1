// Copyright 2025 Cowboy AI, LLC.

//! Configuration for the lifecycle engine
//!
//! All durations are carried as [`Duration`] and serialized as milliseconds.

use crate::errors::{LifecycleError, LifecycleResult};
use crate::infrastructure::nats_kv_store::NatsKvConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use uuid::Uuid;

/// Serde adapter for durations stored as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as milliseconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    /// Deserialize milliseconds into a duration
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Definition of one external tool service
///
/// Either `command` (locally launched) or `url` (remote) must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceConfig {
    /// Command used to launch a local service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments for `command`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment for `command`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory for `command`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Address of a remote service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Transport hint (e.g. "http", "sse", "stdio")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    /// Extra request headers for remote services
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl ServiceConfig {
    /// Config for a remote service
    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Config for a locally launched service
    pub fn command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Default::default()
        }
    }

    /// Whether the service is reached over the network
    pub fn is_remote(&self) -> bool {
        self.url.is_some()
    }

    /// Check that the config can be used to reach the service
    pub fn validate(&self) -> LifecycleResult<()> {
        let has_command = self
            .command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());

        match self.url.as_deref() {
            Some(url) => validate_url(url)?,
            None if !has_command => {
                return Err(LifecycleError::validation(
                    "service config requires either a command or a url",
                ))
            }
            None => {}
        }
        Ok(())
    }
}

fn validate_url(url: &str) -> LifecycleResult<()> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| LifecycleError::validation(format!("url '{url}' has no scheme")))?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
        return Err(LifecycleError::validation(format!(
            "url '{url}' has an invalid scheme"
        )));
    }
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(LifecycleError::validation(format!("url '{url}' has no host")));
    }
    Ok(())
}

/// Service definitions keyed by service name, as produced by a config source
pub type ServiceDefinitions = BTreeMap<String, ServiceConfig>;

/// Failure thresholds driving HEALTHY → WARNING → RECONNECTING → CIRCUIT_OPEN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HealthThresholds {
    /// Consecutive probe failures before HEALTHY becomes WARNING
    pub warning_failure_threshold: u32,
    /// Consecutive probe failures before WARNING becomes RECONNECTING
    pub reconnecting_failure_threshold: u32,
    /// Consecutive connection failures before RECONNECTING becomes CIRCUIT_OPEN
    pub circuit_open_failure_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_failure_threshold: 1,
            reconnecting_failure_threshold: 2,
            circuit_open_failure_threshold: 5,
        }
    }
}

/// State machine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LifecycleConfig {
    /// Process-wide thresholds
    pub thresholds: HealthThresholds,
    /// Per-tenant overrides, consulted before `thresholds`
    #[serde(default)]
    pub tenant_overrides: HashMap<String, HealthThresholds>,
}

/// Health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthConfig {
    /// Poll interval while HEALTHY
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub healthy_interval: Duration,
    /// Poll interval while WARNING (and while still converging)
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub warning_interval: Duration,
    /// Upper bound for a single probe
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub probe_timeout: Duration,
    /// How long an identity may stay INITIALIZING
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub initialization_timeout: Duration,
    /// How often the initialization sweep runs
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub initialization_sweep_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            healthy_interval: Duration::from_secs(30),
            warning_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            initialization_timeout: Duration::from_secs(30),
            initialization_sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Connection establishment configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionConfig {
    /// Upper bound for a single connect attempt
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Reconnection scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReconnectionConfig {
    /// Scan loop tick
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub scan_interval: Duration,
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub base_delay: Duration,
    /// Delay cap
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub max_delay: Duration,
    /// Retry ceiling before giving up
    pub max_retries: u32,
    /// Lease guarding the scan loop across processes
    pub lease_key: String,
    /// Lease time-to-live
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub lease_ttl: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 10,
            lease_key: "lease:reconnection_scheduler".to_string(),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// Event log replication configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EventSyncConfig {
    /// Consumer id under which offsets are committed
    pub consumer_id: String,
    /// Lease guarding the poll loop
    pub lease_key: String,
    /// Lease time-to-live
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub lease_ttl: Duration,
    /// How often a standby syncer retries lease acquisition
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub lease_retry_interval: Duration,
    /// Poll interval while holding the lease
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub poll_interval: Duration,
    /// Maximum records per fetch
    pub batch_size: usize,
    /// How long dedup entries are honoured
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub dedup_ttl: Duration,
    /// Local cache of recently applied dedup keys
    pub dedup_cache_size: usize,
    /// Trim the queue once it holds more records than this
    ///
    /// Each poll lists the whole queue, so `None` lets poll cost grow without
    /// bound.
    pub max_queue_len: Option<usize>,
}

impl Default for EventSyncConfig {
    fn default() -> Self {
        Self {
            consumer_id: "lifecycle-syncer".to_string(),
            lease_key: "lease:event_syncer".to_string(),
            lease_ttl: Duration::from_secs(30),
            lease_retry_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            dedup_ttl: Duration::from_secs(3600),
            dedup_cache_size: 1024,
            max_queue_len: Some(10_000),
        }
    }
}

/// Entry point configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ApplicationConfig {
    /// Route intents through the durable event log instead of the local bus
    pub durable_queue: bool,
    /// Attempts for a durable append
    pub append_attempts: u32,
    /// Delay after the first failed append, doubled per attempt
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub append_base_delay: Duration,
    /// Poll interval while waiting for convergence
    #[serde(with = "duration_ms")]
    #[schemars(with = "u64")]
    pub wait_poll_interval: Duration,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            durable_queue: false,
            append_attempts: 3,
            append_base_delay: Duration::from_millis(100),
            wait_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoreConfig {
    /// Owner identity used for leases and as event source
    pub instance_id: String,
    /// State machine settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Health probing settings
    #[serde(default)]
    pub health: HealthConfig,
    /// Connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Reconnection settings
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    /// Event log replication settings
    #[serde(default)]
    pub sync: EventSyncConfig,
    /// Entry point settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// NATS backend settings
    #[serde(default)]
    pub nats: NatsKvConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("lifecycle-{}", Uuid::new_v4()),
            lifecycle: LifecycleConfig::default(),
            health: HealthConfig::default(),
            connection: ConnectionConfig::default(),
            reconnection: ReconnectionConfig::default(),
            sync: EventSyncConfig::default(),
            application: ApplicationConfig::default(),
            nats: NatsKvConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Reject settings that would stall or spin the background loops
    pub fn validate(&self) -> LifecycleResult<()> {
        let non_zero = [
            ("health.healthy_interval", self.health.healthy_interval),
            ("health.warning_interval", self.health.warning_interval),
            ("health.probe_timeout", self.health.probe_timeout),
            (
                "health.initialization_sweep_interval",
                self.health.initialization_sweep_interval,
            ),
            ("connection.connect_timeout", self.connection.connect_timeout),
            ("reconnection.scan_interval", self.reconnection.scan_interval),
            ("reconnection.base_delay", self.reconnection.base_delay),
            ("reconnection.lease_ttl", self.reconnection.lease_ttl),
            ("sync.lease_ttl", self.sync.lease_ttl),
            ("sync.poll_interval", self.sync.poll_interval),
            ("sync.lease_retry_interval", self.sync.lease_retry_interval),
            (
                "application.wait_poll_interval",
                self.application.wait_poll_interval,
            ),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(LifecycleError::validation(format!("{name} must be > 0")));
            }
        }

        if self.reconnection.max_delay < self.reconnection.base_delay {
            return Err(LifecycleError::validation(
                "reconnection.max_delay must be >= reconnection.base_delay",
            ));
        }
        if self.application.append_attempts == 0 {
            return Err(LifecycleError::validation(
                "application.append_attempts must be >= 1",
            ));
        }
        if self.sync.batch_size == 0 {
            return Err(LifecycleError::validation("sync.batch_size must be >= 1"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(LifecycleError::validation("instance_id must not be empty"));
        }
        Ok(())
    }
}
