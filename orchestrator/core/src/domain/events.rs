// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::container::{AgentId, ContainerStatus};
use crate::domain::runtime::LimitBreach;

/// Closed set of event kinds listeners can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerEventKind {
    #[serde(rename = "container.created")]
    ContainerCreated,
    #[serde(rename = "container.started")]
    ContainerStarted,
    #[serde(rename = "container.stopped")]
    ContainerStopped,
    #[serde(rename = "container.failed")]
    ContainerFailed,
    #[serde(rename = "resource.limit.exceeded")]
    ResourceLimitExceeded,
}

impl ContainerEventKind {
    pub const ALL: [ContainerEventKind; 5] = [
        ContainerEventKind::ContainerCreated,
        ContainerEventKind::ContainerStarted,
        ContainerEventKind::ContainerStopped,
        ContainerEventKind::ContainerFailed,
        ContainerEventKind::ResourceLimitExceeded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerEventKind::ContainerCreated => "container.created",
            ContainerEventKind::ContainerStarted => "container.started",
            ContainerEventKind::ContainerStopped => "container.stopped",
            ContainerEventKind::ContainerFailed => "container.failed",
            ContainerEventKind::ResourceLimitExceeded => "resource.limit.exceeded",
        }
    }
}

impl fmt::Display for ContainerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle and resource events. Every variant carries a snapshot of the
/// status taken at emission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerEvent {
    ContainerCreated {
        status: ContainerStatus,
        created_at: DateTime<Utc>,
    },
    ContainerStarted {
        status: ContainerStatus,
        started_at: DateTime<Utc>,
    },
    ContainerStopped {
        status: ContainerStatus,
        stopped_at: DateTime<Utc>,
    },
    ContainerFailed {
        status: ContainerStatus,
        error: String,
        failed_at: DateTime<Utc>,
    },
    ResourceLimitExceeded {
        status: ContainerStatus,
        breaches: Vec<LimitBreach>,
        detected_at: DateTime<Utc>,
    },
}

impl ContainerEvent {
    pub fn created(status: ContainerStatus) -> Self {
        Self::ContainerCreated { status, created_at: Utc::now() }
    }

    pub fn started(status: ContainerStatus) -> Self {
        Self::ContainerStarted { status, started_at: Utc::now() }
    }

    pub fn stopped(status: ContainerStatus) -> Self {
        Self::ContainerStopped { status, stopped_at: Utc::now() }
    }

    pub fn failed(status: ContainerStatus, error: impl Into<String>) -> Self {
        Self::ContainerFailed { status, error: error.into(), failed_at: Utc::now() }
    }

    pub fn limit_exceeded(status: ContainerStatus, breaches: Vec<LimitBreach>) -> Self {
        Self::ResourceLimitExceeded { status, breaches, detected_at: Utc::now() }
    }

    pub fn kind(&self) -> ContainerEventKind {
        match self {
            ContainerEvent::ContainerCreated { .. } => ContainerEventKind::ContainerCreated,
            ContainerEvent::ContainerStarted { .. } => ContainerEventKind::ContainerStarted,
            ContainerEvent::ContainerStopped { .. } => ContainerEventKind::ContainerStopped,
            ContainerEvent::ContainerFailed { .. } => ContainerEventKind::ContainerFailed,
            ContainerEvent::ResourceLimitExceeded { .. } => ContainerEventKind::ResourceLimitExceeded,
        }
    }

    pub fn status(&self) -> &ContainerStatus {
        match self {
            ContainerEvent::ContainerCreated { status, .. }
            | ContainerEvent::ContainerStarted { status, .. }
            | ContainerEvent::ContainerStopped { status, .. }
            | ContainerEvent::ContainerFailed { status, .. }
            | ContainerEvent::ResourceLimitExceeded { status, .. } => status,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.status().agent_id
    }
}
