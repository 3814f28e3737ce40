// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Status Registry
//!
//! Maps each agent to the [`ContainerEntry`] tracking its container. The map
//! is sharded (`dashmap`) and its guards are never held across an `.await`;
//! all mutation of one entry's status goes through that entry's own mutex,
//! so agents never contend with each other.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Single source of truth for tracked containers

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::container::{
    AgentId, ContainerState, ContainerStatus, ResourceUsage, ValidationError,
};

/// Registry record for one agent's container.
pub(crate) struct ContainerEntry {
    status: Mutex<ContainerStatus>,
    /// Token of the monitor currently bound to this entry
    monitor: Mutex<CancellationToken>,
    /// Serializes stop paths for this agent
    pub(crate) stop_lock: tokio::sync::Mutex<()>,
}

impl ContainerEntry {
    pub(crate) fn new(status: ContainerStatus) -> Self {
        Self {
            status: Mutex::new(status),
            monitor: Mutex::new(CancellationToken::new()),
            stop_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Copy of the current status
    pub(crate) fn snapshot(&self) -> ContainerStatus {
        self.status.lock().clone()
    }

    pub(crate) fn state(&self) -> ContainerState {
        self.status.lock().state
    }

    /// Apply `f` under the entry lock and return the resulting snapshot
    pub(crate) fn update(&self, f: impl FnOnce(&mut ContainerStatus)) -> ContainerStatus {
        let mut status = self.status.lock();
        f(&mut status);
        status.clone()
    }

    /// Replace the usage sample, unless the entry stopped running or the
    /// caller's monitor was cancelled meanwhile.
    pub(crate) fn record_usage(
        &self,
        usage: ResourceUsage,
        monitor: &CancellationToken,
    ) -> Option<ContainerStatus> {
        let mut status = self.status.lock();
        if monitor.is_cancelled() || status.state != ContainerState::Running {
            return None;
        }
        status.resource_usage = usage;
        Some(status.clone())
    }

    /// Running -> Failed, under the same conditions as [`Self::record_usage`]
    pub(crate) fn mark_failed(&self, monitor: &CancellationToken) -> Option<ContainerStatus> {
        let mut status = self.status.lock();
        if monitor.is_cancelled() || status.state != ContainerState::Running {
            return None;
        }
        status.state = ContainerState::Failed;
        Some(status.clone())
    }

    /// Cancel the bound monitor and hand out a fresh token for a new one
    pub(crate) fn arm_monitor(&self) -> CancellationToken {
        let mut current = self.monitor.lock();
        current.cancel();
        *current = CancellationToken::new();
        current.clone()
    }

    pub(crate) fn cancel_monitor(&self) {
        self.monitor.lock().cancel();
    }
}

#[derive(Default)]
pub(crate) struct StatusRegistry {
    entries: DashMap<AgentId, Arc<ContainerEntry>>,
    /// Agents with a start in flight
    pending: DashSet<AgentId>,
}

impl StatusRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim `agent_id` for an in-flight start. The claim is released when
    /// the returned guard drops.
    pub(crate) fn reserve<'a>(
        &'a self,
        agent_id: &AgentId,
        max_containers: Option<usize>,
    ) -> Result<impl Sized + 'a, ValidationError> {
        if !self.pending.insert(agent_id.clone()) {
            return Err(ValidationError::AlreadyRunning(agent_id.clone()));
        }
        let guard = scopeguard::guard(agent_id.clone(), move |id| {
            self.pending.remove(&id);
        });

        if self.entries.contains_key(agent_id) {
            return Err(ValidationError::AlreadyRunning(agent_id.clone()));
        }
        if let Some(max) = max_containers {
            // A start that already inserted its entry is still pending until
            // its guard drops
            let in_flight = self
                .pending
                .iter()
                .filter(|id| !self.entries.contains_key(id.key()))
                .count();
            if self.entries.len() + in_flight > max {
                return Err(ValidationError::CapacityExhausted(max));
            }
        }
        Ok(guard)
    }

    pub(crate) fn insert(&self, agent_id: AgentId, entry: Arc<ContainerEntry>) {
        self.entries.insert(agent_id, entry);
    }

    pub(crate) fn get(&self, agent_id: &AgentId) -> Option<Arc<ContainerEntry>> {
        self.entries.get(agent_id).map(|e| Arc::clone(e.value()))
    }

    /// Whether `entry` is still the one registered for `agent_id`
    pub(crate) fn is_current(&self, agent_id: &AgentId, entry: &Arc<ContainerEntry>) -> bool {
        self.entries
            .get(agent_id)
            .map_or(false, |e| Arc::ptr_eq(e.value(), entry))
    }

    /// Remove the entry for `agent_id` if it is still `entry`
    pub(crate) fn remove(&self, agent_id: &AgentId, entry: &Arc<ContainerEntry>) -> bool {
        self.entries
            .remove_if(agent_id, |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    pub(crate) fn snapshot(&self, agent_id: &AgentId) -> Option<ContainerStatus> {
        self.get(agent_id).map(|entry| entry.snapshot())
    }

    pub(crate) fn entries(&self) -> Vec<Arc<ContainerEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
