// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::container::ResourceUsage;

/// Version of the [`RawUsageSnapshot`] layout understood by the monitor.
pub const USAGE_SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Engine-assigned container handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Engine creation parameters derived from an agent's runtime spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerCreateSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub memory_bytes: u64,
    /// CPU quota in the engine's unit (Docker: 1 CPU = 1e9 nano CPUs)
    pub nano_cpus: i64,
    /// Best-effort hint; most storage drivers cannot enforce it
    pub storage_bytes_hint: Option<u64>,
}

impl ContainerCreateSpec {
    pub fn nano_cpus_from_fraction(cpu_fraction: f64) -> i64 {
        (cpu_fraction * 1e9).round() as i64
    }

    /// Docker-style `KEY=VALUE` list, sorted for deterministic requests.
    pub fn env_list(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();
        env
    }
}

/// Cumulative CPU counters as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuCounters {
    pub total_usage: u64,
    pub system_usage: u64,
}

/// Point-in-time usage report returned by [`ContainerEngine::stats`].
///
/// Only the fields the monitor consumes are modelled. Adapters must fail with
/// [`EngineError::MalformedStats`] rather than fill in defaults for required
/// fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUsageSnapshot {
    pub schema_version: u32,
    pub read_at: DateTime<Utc>,
    pub cpu: CpuCounters,
    /// Counters from the engine's own previous reading, when it provides one
    #[serde(default)]
    pub precpu: Option<CpuCounters>,
    pub online_cpus: u32,
    pub memory_usage_bytes: u64,
    #[serde(default)]
    pub storage_used_bytes: u64,
    #[serde(default)]
    pub network_rx_bytes: u64,
    #[serde(default)]
    pub network_tx_bytes: u64,
}

/// CPU utilisation from two counter readings:
/// `((cpu_delta / system_delta) * online_cpus) * 100`.
pub fn cpu_percent(cpu_delta: f64, system_delta: f64, online_cpus: u32) -> f64 {
    if system_delta <= 0.0 || cpu_delta < 0.0 {
        return 0.0;
    }
    (cpu_delta / system_delta) * online_cpus as f64 * 100.0
}

impl RawUsageSnapshot {
    /// Normalizes this snapshot against the previous one taken for the same
    /// container.
    pub fn normalize(&self, previous: Option<&RawUsageSnapshot>) -> ResourceUsage {
        let baseline = previous.map(|p| p.cpu).or(self.precpu);
        let cpu_usage_percent = match baseline {
            Some(base) => cpu_percent(
                self.cpu.total_usage as f64 - base.total_usage as f64,
                self.cpu.system_usage as f64 - base.system_usage as f64,
                self.online_cpus,
            ),
            None => 0.0,
        };

        let (in_rate, out_rate) = match previous {
            Some(prev) => {
                let elapsed = (self.read_at - prev.read_at)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();
                if elapsed > 0.0 {
                    (
                        self.network_rx_bytes.saturating_sub(prev.network_rx_bytes) as f64 / elapsed,
                        self.network_tx_bytes.saturating_sub(prev.network_tx_bytes) as f64 / elapsed,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };

        ResourceUsage {
            memory_used_bytes: self.memory_usage_bytes,
            cpu_usage_percent,
            storage_used_bytes: self.storage_used_bytes,
            network_bytes_in: self.network_rx_bytes,
            network_bytes_out: self.network_tx_bytes,
            network_in_bytes_per_sec: in_rate,
            network_out_bytes_per_sec: out_rate,
        }
    }
}

/// Orchestrator-wide resource ceilings. Immutable once the orchestrator is
/// built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// CPU ceiling as a fraction of one core; compared against
    /// `cpu_usage_percent / 100`
    pub cpu_fraction: f64,
    pub storage_bytes: u64,
    pub network_inbound_bytes_per_sec: u64,
    pub network_outbound_bytes_per_sec: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_fraction: 1.0,
            storage_bytes: 1024 * 1024 * 1024,
            network_inbound_bytes_per_sec: 10 * 1024 * 1024,
            network_outbound_bytes_per_sec: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Storage,
    NetworkInbound,
    NetworkOutbound,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::Storage => "storage",
            ResourceKind::NetworkInbound => "network_inbound",
            ResourceKind::NetworkOutbound => "network_outbound",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitBreach {
    pub resource: ResourceKind,
    pub observed: f64,
    pub limit: f64,
}

impl ResourceLimits {
    /// Every dimension of `usage` strictly above its ceiling.
    pub fn breaches(&self, usage: &ResourceUsage) -> Vec<LimitBreach> {
        let checks = [
            (ResourceKind::Memory, usage.memory_used_bytes as f64, self.memory_bytes as f64),
            (ResourceKind::Cpu, usage.cpu_usage_percent, self.cpu_fraction * 100.0),
            (ResourceKind::Storage, usage.storage_used_bytes as f64, self.storage_bytes as f64),
            (
                ResourceKind::NetworkInbound,
                usage.network_in_bytes_per_sec,
                self.network_inbound_bytes_per_sec as f64,
            ),
            (
                ResourceKind::NetworkOutbound,
                usage.network_out_bytes_per_sec,
                self.network_outbound_bytes_per_sec as f64,
            ),
        ];

        checks
            .into_iter()
            .filter(|(_, observed, limit)| observed > limit)
            .map(|(resource, observed, limit)| LimitBreach { resource, observed, limit })
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.memory_bytes == 0 {
            return Err("resource_limits.memory_bytes must be positive".to_string());
        }
        if !self.cpu_fraction.is_finite() || self.cpu_fraction <= 0.0 {
            return Err("resource_limits.cpu_fraction must be a positive number".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
    #[error("Failed to create container: {0}")]
    CreateFailed(String),
    #[error("Failed to start container: {0}")]
    StartFailed(String),
    #[error("Failed to stop container: {0}")]
    StopFailed(String),
    #[error("Failed to remove container: {0}")]
    RemoveFailed(String),
    #[error("Failed to read container stats: {0}")]
    StatsFailed(String),
    #[error("Malformed stats payload: missing field '{0}'")]
    MalformedStats(String),
    #[error("Container not found: {0}")]
    NotFound(String),
}

/// Narrow contract over the external container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create(&self, spec: ContainerCreateSpec) -> Result<ContainerId, EngineError>;
    async fn start(&self, id: &ContainerId) -> Result<(), EngineError>;
    /// Stops the container, waiting at most `grace` before killing it.
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), EngineError>;
    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError>;
    async fn stats(&self, id: &ContainerId) -> Result<RawUsageSnapshot, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(total: u64, system: u64, rx: u64, at: DateTime<Utc>) -> RawUsageSnapshot {
        RawUsageSnapshot {
            schema_version: USAGE_SNAPSHOT_SCHEMA_VERSION,
            read_at: at,
            cpu: CpuCounters { total_usage: total, system_usage: system },
            precpu: None,
            online_cpus: 2,
            memory_usage_bytes: 1024,
            storage_used_bytes: 0,
            network_rx_bytes: rx,
            network_tx_bytes: 0,
        }
    }

    #[test]
    fn test_cpu_percent_delta_of_deltas() {
        assert_eq!(cpu_percent(100.0, 1000.0, 2), 20.0);
        assert_eq!(cpu_percent(100.0, 0.0, 2), 0.0);
        assert_eq!(cpu_percent(-5.0, 1000.0, 2), 0.0);
    }

    #[test]
    fn test_normalize_against_previous_sample() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(2);
        let prev = snapshot(1_000, 10_000, 0, t0);
        let cur = snapshot(1_100, 11_000, 4_000, t1);

        let usage = cur.normalize(Some(&prev));
        assert_eq!(usage.cpu_usage_percent, 20.0);
        assert_eq!(usage.network_bytes_in, 4_000);
        assert_eq!(usage.network_in_bytes_per_sec, 2_000.0);
        assert_eq!(usage.memory_used_bytes, 1024);
    }

    #[test]
    fn test_first_sample_uses_engine_precpu() {
        let mut first = snapshot(1_100, 11_000, 0, Utc::now());
        assert_eq!(first.normalize(None).cpu_usage_percent, 0.0);

        first.precpu = Some(CpuCounters { total_usage: 1_000, system_usage: 10_000 });
        assert_eq!(first.normalize(None).cpu_usage_percent, 20.0);
    }

    #[test]
    fn test_limit_breaches() {
        let limits = ResourceLimits {
            memory_bytes: 256 * 1024 * 1024,
            ..Default::default()
        };
        let mut usage = ResourceUsage {
            memory_used_bytes: 128 * 1024 * 1024,
            cpu_usage_percent: 50.0,
            ..Default::default()
        };
        assert!(limits.breaches(&usage).is_empty());

        usage.memory_used_bytes = 300 * 1024 * 1024;
        usage.cpu_usage_percent = 150.0;
        let breaches = limits.breaches(&usage);
        let kinds: Vec<_> = breaches.iter().map(|b| b.resource).collect();
        assert_eq!(kinds, vec![ResourceKind::Memory, ResourceKind::Cpu]);
    }

    #[test]
    fn test_nano_cpus_translation() {
        assert_eq!(ContainerCreateSpec::nano_cpus_from_fraction(0.5), 500_000_000);
        assert_eq!(ContainerCreateSpec::nano_cpus_from_fraction(2.0), 2_000_000_000);
    }
}
