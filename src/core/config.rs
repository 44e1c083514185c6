//! Configuration parsing and validation.
//!
//! Client configuration is loaded from TOML files with CLI overrides, or built
//! programmatically with [`ClientConfig::new`] and the `with_*` methods.
//!
//! ```toml
//! [cluster]
//! hosts = ["10.0.0.1:8091", "10.0.0.2:8091"]
//! mode = "http"
//! bucket = "default"
//!
//! [timeouts]
//! operation_timeout_ms = 2500
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Cluster bootstrap settings.
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Timers.
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// TLS settings for data and management connections.
    #[serde(default)]
    pub tls: TlsSettings,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// How cluster topology is discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMode {
    /// Streaming HTTP feed from the management port.
    #[default]
    Http,
    /// In-band fetch over the data protocol.
    InBand,
}

impl std::fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigMode::Http => write!(f, "http"),
            ConfigMode::InBand => write!(f, "in_band"),
        }
    }
}

impl std::str::FromStr for ConfigMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(ConfigMode::Http),
            "in_band" | "inband" | "cccp" => Ok(ConfigMode::InBand),
            other => anyhow::bail!("unknown config mode '{}', expected 'http' or 'in_band'", other),
        }
    }
}

/// Cluster bootstrap settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Bootstrap hosts as `host:port`. Management ports for `http` mode,
    /// data ports for `in_band` mode.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,

    /// Topology discovery mode.
    #[serde(default)]
    pub mode: ConfigMode,

    /// Bucket name, also the SASL user.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Bucket password.
    #[serde(default)]
    pub password: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            mode: ConfigMode::default(),
            bucket: default_bucket(),
            password: String::new(),
        }
    }
}

/// Timer settings, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Default per-operation timeout.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// TCP (and TLS) connect timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay between marking the topology stale and forcing a refresh.
    #[serde(default = "default_config_invalid_timeout_ms")]
    pub config_invalid_timeout_ms: u64,

    /// How long a polled candidate host stays burned.
    #[serde(default = "default_host_burn_ms")]
    pub host_burn_ms: u64,

    /// Backoff when every candidate host is burned.
    #[serde(default = "default_host_exhausted_backoff_ms")]
    pub host_exhausted_backoff_ms: u64,

    /// Delay before retrying operations rescheduled on busy or internal errors.
    #[serde(default = "default_reschedule_delay_ms")]
    pub reschedule_delay_ms: u64,

    /// Re-fetch interval for in-band topology. Zero disables polling.
    #[serde(default = "default_config_poll_interval_ms")]
    pub config_poll_interval_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            config_invalid_timeout_ms: default_config_invalid_timeout_ms(),
            host_burn_ms: default_host_burn_ms(),
            host_exhausted_backoff_ms: default_host_exhausted_backoff_ms(),
            reschedule_delay_ms: default_reschedule_delay_ms(),
            config_poll_interval_ms: default_config_poll_interval_ms(),
        }
    }
}

impl TimeoutSettings {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn config_invalid_timeout(&self) -> Duration {
        Duration::from_millis(self.config_invalid_timeout_ms)
    }

    pub fn host_burn(&self) -> Duration {
        Duration::from_millis(self.host_burn_ms)
    }

    pub fn host_exhausted_backoff(&self) -> Duration {
        Duration::from_millis(self.host_exhausted_backoff_ms)
    }

    pub fn reschedule_delay(&self) -> Duration {
        Duration::from_millis(self.reschedule_delay_ms)
    }

    pub fn config_poll_interval(&self) -> Option<Duration> {
        (self.config_poll_interval_ms > 0)
            .then(|| Duration::from_millis(self.config_poll_interval_ms))
    }
}

/// TLS settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Use TLS ports and encrypted connections.
    #[serde(default)]
    pub enabled: bool,

    /// PEM bundle of trusted CA certificates.
    #[serde(default)]
    pub ca_path: Option<String>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_hosts() -> Vec<String> {
    vec!["localhost:8091".to_string()]
}

fn default_bucket() -> String {
    "default".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    2500
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_config_invalid_timeout_ms() -> u64 {
    2000
}

fn default_host_burn_ms() -> u64 {
    5000
}

fn default_host_exhausted_backoff_ms() -> u64 {
    1000
}

fn default_reschedule_delay_ms() -> u64 {
    100
}

fn default_config_poll_interval_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Split a semicolon-separated host list (`"a:8091;b:8091"`).
pub fn parse_hosts(hosts: &str) -> Vec<String> {
    hosts
        .split(';')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

impl ClientConfig {
    /// Configuration for the given bootstrap hosts with every other setting defaulted.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::default();
        config.cluster.hosts = hosts.into_iter().map(Into::into).collect();
        config
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.cluster.bucket = bucket.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.cluster.password = password.into();
        self
    }

    pub fn with_mode(mut self, mode: ConfigMode) -> Self {
        self.cluster.mode = mode;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_tls(mut self, ca_path: impl Into<String>) -> Self {
        self.tls.enabled = true;
        self.tls.ca_path = Some(ca_path.into());
        self
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: ClientConfig =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref hosts) = overrides.hosts {
            self.cluster.hosts = parse_hosts(hosts);
        }
        if let Some(ref bucket) = overrides.bucket {
            self.cluster.bucket = bucket.clone();
        }
        if let Some(ref password) = overrides.password {
            self.cluster.password = password.clone();
        }
        if let Some(mode) = overrides.mode {
            self.cluster.mode = mode;
        }
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref ca_path) = overrides.tls_ca_path {
            self.tls.enabled = true;
            self.tls.ca_path = Some(ca_path.clone());
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_cluster()?;
        self.validate_timeouts()?;
        self.validate_tls()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_cluster(&self) -> Result<()> {
        if self.cluster.hosts.is_empty() {
            anyhow::bail!("cluster.hosts must list at least one host");
        }
        for host in &self.cluster.hosts {
            let (name, port) = host
                .rsplit_once(':')
                .with_context(|| format!("cluster.hosts entry '{}' must be host:port", host))?;
            if name.is_empty() {
                anyhow::bail!("cluster.hosts entry '{}' has an empty host name", host);
            }
            port.parse::<u16>()
                .with_context(|| format!("cluster.hosts entry '{}' has an invalid port", host))?;
        }
        if self.cluster.bucket.is_empty() {
            anyhow::bail!("cluster.bucket must not be empty");
        }
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<()> {
        let t = &self.timeouts;
        let required = [
            ("operation_timeout_ms", t.operation_timeout_ms),
            ("connect_timeout_ms", t.connect_timeout_ms),
            ("config_invalid_timeout_ms", t.config_invalid_timeout_ms),
            ("host_burn_ms", t.host_burn_ms),
            ("host_exhausted_backoff_ms", t.host_exhausted_backoff_ms),
            ("reschedule_delay_ms", t.reschedule_delay_ms),
        ];
        for (name, value) in required {
            if value == 0 {
                anyhow::bail!("timeouts.{} must be > 0", name);
            }
        }
        Ok(())
    }

    fn validate_tls(&self) -> Result<()> {
        if !self.tls.enabled {
            return Ok(());
        }
        if !cfg!(feature = "tls") {
            anyhow::bail!("tls.enabled requires the 'tls' feature");
        }
        let Some(ref ca_path) = self.tls.ca_path else {
            anyhow::bail!("tls.ca_path is required when tls.enabled is set");
        };
        #[cfg(not(test))]
        {
            if !Path::new(ca_path).exists() {
                anyhow::bail!("tls.ca_path does not exist: {}", ca_path);
            }
        }
        let _ = ca_path;
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override bootstrap hosts (semicolon separated).
    pub hosts: Option<String>,
    /// Override bucket.
    pub bucket: Option<String>,
    /// Override bucket password.
    pub password: Option<String>,
    /// Override discovery mode.
    pub mode: Option<ConfigMode>,
    /// Override log level.
    pub log_level: Option<String>,
    /// Enable TLS with this CA bundle.
    pub tls_ca_path: Option<String>,
}
