// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Container Status Model
//!
//! Value types describing one tracked agent container: its logical key
//! ([`AgentId`]), its lifecycle [`ContainerState`], the last sampled
//! [`ResourceUsage`] and the per-start [`AgentRuntimeSpec`] request.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Status registry records and start requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::runtime::ContainerId;

const MAX_AGENT_ID_LEN: usize = 128;

/// Logical agent key. Unique within the status registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Agent ids end up inside engine container names, so only a conservative
    /// character set is accepted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.is_empty() {
            return Err(ValidationError::InvalidSpec("agent_id cannot be empty".to_string()));
        }
        if self.0.len() > MAX_AGENT_ID_LEN {
            return Err(ValidationError::InvalidSpec(format!(
                "agent_id exceeds {} characters",
                MAX_AGENT_ID_LEN
            )));
        }
        if let Some(c) = self
            .0
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(ValidationError::InvalidSpec(format!(
                "agent_id '{}' contains unsupported character '{}'",
                self.0, c
            )));
        }
        Ok(())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Stopped,
    Failed,
}

impl ContainerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Stopped | ContainerState::Failed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Last sampled usage of a container. Always replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_used_bytes: u64,
    /// Percentage of a single core (200.0 = two cores fully busy)
    pub cpu_usage_percent: f64,
    pub storage_used_bytes: u64,
    /// Cumulative bytes received since container start
    pub network_bytes_in: u64,
    /// Cumulative bytes sent since container start
    pub network_bytes_out: u64,
    #[serde(default)]
    pub network_in_bytes_per_sec: f64,
    #[serde(default)]
    pub network_out_bytes_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Engine-assigned handle
    pub id: ContainerId,
    pub agent_id: AgentId,
    pub state: ContainerState,
    pub start_time: DateTime<Utc>,
    pub resource_usage: ResourceUsage,
}

impl ContainerStatus {
    pub fn new(id: ContainerId, agent_id: AgentId) -> Self {
        Self {
            id,
            agent_id,
            state: ContainerState::Created,
            start_time: Utc::now(),
            resource_usage: ResourceUsage::default(),
        }
    }

    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.start_time).to_std().unwrap_or_default()
    }
}

/// Resource requests of one agent, translated into engine creation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResources {
    pub memory_bytes: u64,
    /// Fraction of one CPU core (0.5 = half a core)
    pub cpu_fraction: f64,
    /// Advisory only. Engines are not required to enforce it.
    pub storage_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeSpec {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub resources: AgentResources,
    /// Opaque agent configuration forwarded to the container as `AGENT_CONFIG`
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentRuntimeSpec {
    pub fn new(agent_id: impl Into<AgentId>, resources: AgentResources) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: None,
            version: None,
            capabilities: vec![],
            resources,
            config: serde_json::Value::Null,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.agent_id.validate()?;

        let res = &self.resources;
        if res.memory_bytes == 0 {
            return Err(ValidationError::InvalidSpec("memory_bytes must be positive".to_string()));
        }
        if !res.cpu_fraction.is_finite() || res.cpu_fraction <= 0.0 {
            return Err(ValidationError::InvalidSpec(format!(
                "cpu_fraction must be a positive number, got {}",
                res.cpu_fraction
            )));
        }
        if res.timeout.is_zero() {
            return Err(ValidationError::InvalidSpec("timeout cannot be zero".to_string()));
        }
        Ok(())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("agent {0} already has a container")]
    AlreadyRunning(AgentId),
    #[error("container limit of {0} reached")]
    CapacityExhausted(usize),
    #[error("invalid runtime spec: {0}")]
    InvalidSpec(String),
}
