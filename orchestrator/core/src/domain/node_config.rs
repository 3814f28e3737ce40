// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for a Mindr runtime node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Container engine connection and agent image
// - Orchestrator limits, timeouts and resource ceilings
// - Resource monitor polling and stats failure policy
// - Logging settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::runtime::ResourceLimits;

pub const API_VERSION: &str = "mindr.ai/v1";
pub const KIND: &str = "RuntimeConfig";

/// Top-level Kubernetes-style runtime configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "mindr.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "RuntimeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Docker endpoint, e.g. "unix:///var/run/docker.sock" or "tcp://10.0.0.2:2375".
    /// Auto-detected when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_endpoint: Option<String>,

    /// Forward storage requests as `storage_opt` (needs overlay2 + XFS pquota).
    /// Rejections are tolerated and the container is created without the hint.
    #[serde(default = "default_true")]
    pub enable_storage_hints: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_endpoint: None,
            enable_storage_hints: true,
        }
    }
}

/// Settings consumed by the container orchestrator. Fixed for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Image every agent container is created from
    #[serde(default = "default_image")]
    pub image: String,

    /// Container names are `<prefix><agent_id>`
    #[serde(default = "default_container_name_prefix")]
    pub container_name_prefix: String,

    /// Upper bound on simultaneously tracked containers (None = unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_containers: Option<usize>,

    /// Bound on each engine call made by start/stop
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Grace period for non-forced stops before the engine kills the container
    #[serde(default = "default_stop_grace_period", with = "humantime_serde")]
    pub stop_grace_period: Duration,

    #[serde(default)]
    pub resource_limits: ResourceLimits,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_name_prefix: default_container_name_prefix(),
            max_containers: None,
            default_timeout: default_timeout(),
            stop_grace_period: default_stop_grace_period(),
            resource_limits: ResourceLimits::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default)]
    pub stats_failure_policy: StatsFailurePolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            stats_failure_policy: StatsFailurePolicy::default(),
        }
    }
}

/// What the resource monitor does when a stats fetch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StatsFailurePolicy {
    /// Mark the container Failed on the first error
    #[default]
    FailFast,
    /// Tolerate up to N consecutive errors before failing
    Retry { max_consecutive_failures: u32 },
}

impl StatsFailurePolicy {
    /// Whether `consecutive_failures` (>= 1) exhausts the policy.
    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        match self {
            StatsFailurePolicy::FailFast => true,
            StatsFailurePolicy::Retry { max_consecutive_failures } => {
                consecutive_failures > *max_consecutive_failures
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    /// Prometheus exposition; disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g., "info", "mindr_runtime_core=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_bind_address")]
    pub bind_address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            bind_address: default_metrics_bind_address(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_image() -> String {
    "mindr/agent:latest".to_string()
}

fn default_container_name_prefix() -> String {
    "mindr-agent-".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stop_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9464
}

fn default_metrics_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "mindr-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. MINDR_CONFIG_PATH environment variable
    /// 2. ./mindr-runtime.yaml (working directory)
    /// 3. ~/.mindr/runtime.yaml (user home)
    /// 4. /etc/mindr/runtime.yaml (system, Unix) or C:\ProgramData\Mindr\runtime.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MINDR_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./mindr-runtime.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mindr").join("runtime.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/mindr/runtime.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Mindr\\runtime.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse
        if let Some(path) = explicit_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }

        let mut config = if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("MINDR_DOCKER_ENDPOINT") {
            tracing::info!("Environment override: MINDR_DOCKER_ENDPOINT={}", endpoint);
            self.spec.engine.docker_endpoint = Some(endpoint);
        }

        if let Some(val) = lookup("MINDR_POLL_INTERVAL_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    tracing::info!("Environment override: MINDR_POLL_INTERVAL_MS={}", ms);
                    self.spec.runtime.monitor.poll_interval = Duration::from_millis(ms);
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for MINDR_POLL_INTERVAL_MS: '{}'. Expected positive milliseconds. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Some(level) = lookup("MINDR_LOG_LEVEL") {
            tracing::info!("Environment override: MINDR_LOG_LEVEL={}", level);
            let observability = self.spec.observability.get_or_insert_with(Default::default);
            observability
                .logging
                .get_or_insert_with(LoggingConfig::default)
                .level = level;
        }
    }

    /// Logging settings, falling back to defaults when the section is absent
    pub fn logging(&self) -> LoggingConfig {
        self.spec
            .observability
            .as_ref()
            .and_then(|o| o.logging.clone())
            .unwrap_or_default()
    }

    /// Metrics settings, if exposition is configured and enabled
    pub fn metrics(&self) -> Option<MetricsConfig> {
        self.spec
            .observability
            .as_ref()
            .and_then(|o| o.metrics.clone())
            .filter(|m| m.enabled)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let runtime = &self.spec.runtime;
        if runtime.image.is_empty() {
            anyhow::bail!("spec.runtime.image cannot be empty");
        }
        if runtime.max_containers == Some(0) {
            anyhow::bail!("spec.runtime.max_containers must be at least 1");
        }
        if runtime.default_timeout.is_zero() {
            anyhow::bail!("spec.runtime.default_timeout cannot be zero");
        }
        if runtime.monitor.poll_interval.is_zero() {
            anyhow::bail!("spec.runtime.monitor.poll_interval cannot be zero");
        }
        runtime
            .resource_limits
            .validate()
            .map_err(|e| anyhow::anyhow!("spec.runtime.{}", e))?;

        if let Some(logging) = self.spec.observability.as_ref().and_then(|o| o.logging.as_ref()) {
            if logging.format != "json" && logging.format != "text" {
                anyhow::bail!(
                    "Invalid logging format '{}'. Expected 'json' or 'text'",
                    logging.format
                );
            }
        }

        if let Some(metrics) = self.metrics() {
            if metrics.port == 0 {
                anyhow::bail!("spec.observability.metrics.port cannot be 0");
            }
            if metrics.bind_address.parse::<std::net::IpAddr>().is_err() {
                anyhow::bail!(
                    "Invalid metrics bind_address '{}'. Expected an IP address",
                    metrics.bind_address
                );
            }
        }

        Ok(())
    }
}
