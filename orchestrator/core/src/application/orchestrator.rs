// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Container Orchestrator
//!
//! Public entry point of the runtime: validates start requests, drives the
//! [`ContainerEngine`] through create/start/stop/remove, owns the status
//! registry and binds one [`ResourceMonitor`] to every running container.
//!
//! ## Start
//! 1. Validate the spec and reserve the agent id (duplicates and capacity)
//! 2. `create` then `start` through the engine; on failure remove whatever
//!    was created and leave no registry entry behind
//! 3. Insert the entry as `Created`, publish `ContainerCreated`, move it to
//!    `Running`, publish `ContainerStarted`, spawn the monitor
//!
//! ## Stop
//! Serialized per agent. Cancels the monitor, stops and removes the container,
//! marks the entry `Stopped`, drops it from the registry and publishes
//! `ContainerStopped`. When the engine refuses, the entry stays as it was and
//! its monitor is re-armed so the caller can retry.
//!
//! Every engine call made on behalf of a caller is bounded by the configured
//! default timeout.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Container lifecycle orchestration

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::monitor::ResourceMonitor;
use crate::application::registry::{ContainerEntry, StatusRegistry};
use crate::domain::container::{
    AgentId, AgentRuntimeSpec, ContainerState, ContainerStatus, ValidationError,
};
use crate::domain::events::ContainerEvent;
use crate::domain::node_config::RuntimeConfig;
use crate::domain::runtime::{ContainerCreateSpec, ContainerEngine, ContainerId, EngineError};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("No container tracked for agent {0}")]
    NotFound(AgentId),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Engine {operation} call timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Skip the grace period and kill the container right away
    pub force: bool,
}

impl StopOptions {
    pub fn force() -> Self {
        Self { force: true }
    }
}

pub(crate) struct OrchestratorInner {
    pub(crate) engine: Arc<dyn ContainerEngine>,
    pub(crate) event_bus: EventBus,
    pub(crate) config: RuntimeConfig,
    registry: StatusRegistry,
}

/// Cheaply cloneable handle to the orchestrator
#[derive(Clone)]
pub struct ContainerOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl ContainerOrchestrator {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: RuntimeConfig, event_bus: EventBus) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                engine,
                event_bus,
                config,
                registry: StatusRegistry::new(),
            }),
        }
    }

    /// Create and start a container for `spec.agent_id`
    pub async fn start(&self, spec: AgentRuntimeSpec) -> Result<ContainerStatus, OrchestratorError> {
        self.inner.start(spec).await
    }

    /// Stop and remove the container of `agent_id`
    pub async fn stop(&self, agent_id: &AgentId, options: StopOptions) -> Result<(), OrchestratorError> {
        self.inner.stop(agent_id, options).await
    }

    /// Snapshot of the agent's status, if tracked
    pub fn status(&self, agent_id: &AgentId) -> Option<ContainerStatus> {
        self.inner.registry.snapshot(agent_id)
    }

    /// Snapshots of all tracked containers, optionally only those in `state`,
    /// ordered by agent id
    pub fn list(&self, state: Option<ContainerState>) -> Vec<ContainerStatus> {
        let mut statuses: Vec<ContainerStatus> = self
            .inner
            .registry
            .entries()
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|status| state.map_or(true, |s| status.state == s))
            .collect();
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }

    /// Force-stop every tracked container. All stops are attempted; the first
    /// error is returned.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        let agents: Vec<AgentId> = self
            .inner
            .registry
            .entries()
            .iter()
            .map(|entry| entry.snapshot().agent_id)
            .collect();
        info!(count = agents.len(), "Shutting down all agent containers");

        let results = futures::future::join_all(
            agents
                .iter()
                .map(|agent_id| self.inner.stop(agent_id, StopOptions::force())),
        )
        .await;

        let mut first_error = None;
        for (agent_id, result) in agents.iter().zip(results) {
            match result {
                Ok(()) | Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => {
                    error!(agent_id = %agent_id, "Failed to stop container during shutdown: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }
}

impl OrchestratorInner {
    async fn start(self: &Arc<Self>, spec: AgentRuntimeSpec) -> Result<ContainerStatus, OrchestratorError> {
        spec.validate()?;
        let agent_id = spec.agent_id.clone();
        let _reservation = self.registry.reserve(&agent_id, self.config.max_containers)?;

        let create_spec = self.translate(&spec)?;
        let container_name = create_spec.name.clone();
        let timeout = self.config.default_timeout;

        let container_id = match bounded("create", timeout, self.engine.create(create_spec)).await {
            Ok(id) => id,
            Err(e) => {
                if matches!(e, OrchestratorError::Timeout { .. }) {
                    // The engine may still create it; names are valid handles
                    warn!(
                        agent_id = %agent_id,
                        container = %container_name,
                        "Create timed out, removing any container left behind"
                    );
                    self.rollback(&ContainerId::new(container_name)).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = bounded("start", timeout, self.engine.start(&container_id)).await {
            warn!(agent_id = %agent_id, "Failed to start container, rolling back: {}", e);
            self.rollback(&container_id).await;
            return Err(e);
        }

        let entry = Arc::new(ContainerEntry::new(ContainerStatus::new(
            container_id,
            agent_id.clone(),
        )));
        self.registry.insert(agent_id.clone(), entry.clone());
        metrics::gauge!("mindr_containers_tracked").set(self.registry.len() as f64);
        self.event_bus.publish(ContainerEvent::created(entry.snapshot()));

        let status = entry.update(|s| s.state = ContainerState::Running);
        self.event_bus.publish(ContainerEvent::started(status.clone()));
        metrics::counter!("mindr_containers_started_total").increment(1);
        info!(agent_id = %agent_id, container_id = %status.id, "Agent container running");

        self.spawn_monitor(&entry, false);
        Ok(status)
    }

    async fn stop(self: &Arc<Self>, agent_id: &AgentId, options: StopOptions) -> Result<(), OrchestratorError> {
        let entry = self
            .registry
            .get(agent_id)
            .ok_or_else(|| OrchestratorError::NotFound(agent_id.clone()))?;
        self.stop_entry(agent_id, &entry, options).await
    }

    /// Stop the container tracked by `entry`. Fails with `NotFound` once
    /// `entry` is no longer the one registered for `agent_id`.
    pub(crate) async fn stop_entry(
        self: &Arc<Self>,
        agent_id: &AgentId,
        entry: &Arc<ContainerEntry>,
        options: StopOptions,
    ) -> Result<(), OrchestratorError> {
        let _stopping = entry.stop_lock.lock().await;
        // Stopped by someone else, possibly replaced by a newer start
        if !self.registry.is_current(agent_id, entry) {
            return Err(OrchestratorError::NotFound(agent_id.clone()));
        }

        entry.cancel_monitor();
        let container_id = entry.snapshot().id;
        let grace = if options.force {
            Duration::ZERO
        } else {
            self.config.stop_grace_period
        };

        if let Err(e) = self.stop_and_remove(&container_id, grace).await {
            warn!(agent_id = %agent_id, force = options.force, "Failed to stop container: {}", e);
            if entry.state() == ContainerState::Running {
                self.spawn_monitor(entry, true);
            }
            return Err(e);
        }

        let status = entry.update(|s| s.state = ContainerState::Stopped);
        self.registry.remove(agent_id, entry);
        metrics::gauge!("mindr_containers_tracked").set(self.registry.len() as f64);
        metrics::counter!("mindr_containers_stopped_total").increment(1);
        info!(agent_id = %agent_id, container_id = %container_id, "Agent container stopped");

        self.event_bus.publish(ContainerEvent::stopped(status));
        Ok(())
    }

    async fn stop_and_remove(&self, id: &ContainerId, grace: Duration) -> Result<(), OrchestratorError> {
        // The engine may legitimately use the whole grace period
        let stop_timeout = self.config.default_timeout + grace;
        match bounded("stop", stop_timeout, self.engine.stop(id, grace)).await {
            Ok(()) => {}
            Err(OrchestratorError::Engine(EngineError::NotFound(_))) => {
                debug!(container_id = %id, "Container already gone before stop");
            }
            Err(e) => return Err(e),
        }

        match bounded("remove", self.config.default_timeout, self.engine.remove(id)).await {
            Ok(()) | Err(OrchestratorError::Engine(EngineError::NotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Best-effort removal of a container whose start failed
    async fn rollback(&self, id: &ContainerId) {
        match bounded("remove", self.config.default_timeout, self.engine.remove(id)).await {
            Ok(()) => debug!(container_id = %id, "Rolled back container"),
            Err(OrchestratorError::Engine(EngineError::NotFound(_))) => {}
            Err(e) => {
                error!(container_id = %id, "Rollback failed, container may be orphaned: {}", e);
            }
        }
    }

    /// Bind a fresh monitor to `entry`. A re-armed monitor waits one polling
    /// interval before its first sample.
    fn spawn_monitor(self: &Arc<Self>, entry: &Arc<ContainerEntry>, rearmed: bool) {
        let token = entry.arm_monitor();
        let monitor = ResourceMonitor::new(self, entry, token);
        if rearmed {
            monitor.delayed().spawn();
        } else {
            monitor.spawn();
        }
    }

    /// Map an agent spec onto engine creation parameters
    fn translate(&self, spec: &AgentRuntimeSpec) -> Result<ContainerCreateSpec, OrchestratorError> {
        let agent_config = serde_json::to_string(spec).map_err(|e| {
            ValidationError::InvalidSpec(format!("agent config is not serializable: {}", e))
        })?;

        let env = HashMap::from([
            ("AGENT_ID".to_string(), spec.agent_id.to_string()),
            ("AGENT_CONFIG".to_string(), agent_config),
            (
                "AGENT_TIMEOUT_MS".to_string(),
                spec.resources.timeout.as_millis().to_string(),
            ),
        ]);
        let labels = HashMap::from([
            ("mindr.managed".to_string(), "true".to_string()),
            ("mindr.agent.id".to_string(), spec.agent_id.to_string()),
        ]);

        Ok(ContainerCreateSpec {
            name: format!("{}{}", self.config.container_name_prefix, spec.agent_id),
            image: self.config.image.clone(),
            env,
            labels,
            memory_bytes: spec.resources.memory_bytes,
            nano_cpus: ContainerCreateSpec::nano_cpus_from_fraction(spec.resources.cpu_fraction),
            storage_bytes_hint: (spec.resources.storage_bytes > 0).then_some(spec.resources.storage_bytes),
        })
    }
}

async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, OrchestratorError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(OrchestratorError::Engine),
        Err(_) => Err(OrchestratorError::Timeout {
            operation,
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::AgentResources;
    use crate::domain::runtime::{CpuCounters, RawUsageSnapshot, USAGE_SNAPSHOT_SCHEMA_VERSION};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingEngine {
        stopped: Mutex<Vec<ContainerId>>,
    }

    #[async_trait]
    impl ContainerEngine for RecordingEngine {
        async fn create(&self, spec: ContainerCreateSpec) -> Result<ContainerId, EngineError> {
            Ok(ContainerId::new(format!("{}-id", spec.name)))
        }

        async fn start(&self, _id: &ContainerId) -> Result<(), EngineError> {
            Ok(())
        }

        async fn stop(&self, id: &ContainerId, _grace: Duration) -> Result<(), EngineError> {
            self.stopped.lock().push(id.clone());
            Ok(())
        }

        async fn remove(&self, _id: &ContainerId) -> Result<(), EngineError> {
            Ok(())
        }

        async fn stats(&self, _id: &ContainerId) -> Result<RawUsageSnapshot, EngineError> {
            Ok(RawUsageSnapshot {
                schema_version: USAGE_SNAPSHOT_SCHEMA_VERSION,
                read_at: chrono::Utc::now(),
                cpu: CpuCounters { total_usage: 0, system_usage: 0 },
                precpu: None,
                online_cpus: 1,
                memory_usage_bytes: 0,
                storage_used_bytes: 0,
                network_rx_bytes: 0,
                network_tx_bytes: 0,
            })
        }
    }

    fn agent_spec(agent: &str) -> AgentRuntimeSpec {
        AgentRuntimeSpec::new(
            agent,
            AgentResources {
                memory_bytes: 64 * 1024 * 1024,
                cpu_fraction: 1.0,
                storage_bytes: 0,
                timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_stale_entry_cannot_stop_newer_container() {
        let engine = Arc::new(RecordingEngine::default());
        let mut config = RuntimeConfig::default();
        config.monitor.poll_interval = Duration::from_secs(60);
        let orchestrator = ContainerOrchestrator::new(engine.clone(), config, EventBus::new(16));
        let a1 = AgentId::new("a1");

        orchestrator.start(agent_spec("a1")).await.unwrap();
        let stale = Arc::new(ContainerEntry::new(ContainerStatus::new(
            ContainerId::new("old-container"),
            a1.clone(),
        )));

        let result = orchestrator
            .inner
            .stop_entry(&a1, &stale, StopOptions::force())
            .await;

        assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
        assert!(engine.stopped.lock().is_empty());
        assert_eq!(orchestrator.status(&a1).unwrap().state, ContainerState::Running);
    }
}
