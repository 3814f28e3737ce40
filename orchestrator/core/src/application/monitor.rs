// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Resource Monitor - one polling task per running container
//!
//! Each tick samples usage from the engine, normalizes it, stores it on the
//! bound registry entry and checks it against the orchestrator's limits. A
//! breach is published and routed through the orchestrator's stop path; the
//! monitor never removes its entry itself.
//!
//! Cancellation is cooperative and observed between ticks, so a monitor may
//! outlive the stop that cancelled it by up to one polling interval.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Usage sampling and limit enforcement

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::orchestrator::{OrchestratorError, OrchestratorInner, StopOptions};
use crate::application::registry::ContainerEntry;
use crate::domain::container::{AgentId, ContainerState};
use crate::domain::events::ContainerEvent;
use crate::domain::node_config::MonitorConfig;
use crate::domain::runtime::{ContainerEngine, ContainerId, RawUsageSnapshot, ResourceLimits};
use crate::infrastructure::event_bus::EventBus;

pub(crate) struct ResourceMonitor {
    agent_id: AgentId,
    container_id: ContainerId,
    entry: Weak<ContainerEntry>,
    orchestrator: Weak<OrchestratorInner>,
    engine: Arc<dyn ContainerEngine>,
    event_bus: EventBus,
    limits: ResourceLimits,
    config: MonitorConfig,
    shutdown: CancellationToken,
    previous: Option<RawUsageSnapshot>,
    consecutive_failures: u32,
    /// Skip the immediate first sample
    delay_first_tick: bool,
}

impl ResourceMonitor {
    pub(crate) fn new(
        orchestrator: &Arc<OrchestratorInner>,
        entry: &Arc<ContainerEntry>,
        shutdown: CancellationToken,
    ) -> Self {
        let status = entry.snapshot();
        Self {
            agent_id: status.agent_id,
            container_id: status.id,
            entry: Arc::downgrade(entry),
            orchestrator: Arc::downgrade(orchestrator),
            engine: orchestrator.engine.clone(),
            event_bus: orchestrator.event_bus.clone(),
            limits: orchestrator.config.resource_limits.clone(),
            config: orchestrator.config.monitor.clone(),
            shutdown,
            previous: None,
            consecutive_failures: 0,
            delay_first_tick: false,
        }
    }

    /// Take the first sample one polling interval from now instead of
    /// immediately
    pub(crate) fn delayed(mut self) -> Self {
        self.delay_first_tick = true;
        self
    }

    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!(
            agent_id = %self.agent_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting resource monitor"
        );

        let period = self.config.poll_interval;
        let first = if self.delay_first_tick {
            Instant::now() + period
        } else {
            Instant::now()
        };
        let mut tick = interval_at(first, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!(agent_id = %self.agent_id, "Resource monitor cancelled");
                    break;
                }
                _ = tick.tick() => {
                    if self.poll_once().await.is_break() {
                        break;
                    }
                }
            }
        }

        debug!(agent_id = %self.agent_id, "Resource monitor stopped");
    }

    async fn poll_once(&mut self) -> ControlFlow<()> {
        // Orchestrator removed the entry (or was dropped)
        let Some(entry) = self.entry.upgrade() else {
            return ControlFlow::Break(());
        };
        if entry.state() != ContainerState::Running {
            return ControlFlow::Break(());
        }

        let snapshot = match self.engine.stats(&self.container_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.consecutive_failures += 1;
                if !self.config.stats_failure_policy.is_exhausted(self.consecutive_failures) {
                    warn!(
                        agent_id = %self.agent_id,
                        consecutive_failures = self.consecutive_failures,
                        "Failed to read container stats, retrying next tick: {}",
                        e
                    );
                    return ControlFlow::Continue(());
                }

                if let Some(status) = entry.mark_failed(&self.shutdown) {
                    error!(agent_id = %self.agent_id, "Container marked failed: {}", e);
                    metrics::counter!("mindr_containers_failed_total").increment(1);
                    self.event_bus.publish(ContainerEvent::failed(status, e.to_string()));
                }
                return ControlFlow::Break(());
            }
        };
        self.consecutive_failures = 0;

        let usage = snapshot.normalize(self.previous.as_ref());
        self.previous = Some(snapshot);

        let Some(status) = entry.record_usage(usage, &self.shutdown) else {
            return ControlFlow::Break(());
        };

        let breaches = self.limits.breaches(&status.resource_usage);
        if breaches.is_empty() {
            return ControlFlow::Continue(());
        }

        for breach in &breaches {
            warn!(
                agent_id = %self.agent_id,
                resource = breach.resource.as_str(),
                observed = breach.observed,
                limit = breach.limit,
                "Resource limit exceeded"
            );
            metrics::counter!(
                "mindr_resource_limit_breaches_total",
                "resource" => breach.resource.as_str()
            )
            .increment(1);
        }
        self.event_bus
            .publish(ContainerEvent::limit_exceeded(status, breaches));

        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return ControlFlow::Break(());
        };
        match orchestrator
            .stop_entry(&self.agent_id, &entry, StopOptions::force())
            .await
        {
            Ok(()) => info!(agent_id = %self.agent_id, "Container stopped after limit breach"),
            // A caller stop got there first, or the agent was restarted
            Err(OrchestratorError::NotFound(_)) => {}
            Err(e) => error!(
                agent_id = %self.agent_id,
                "Failed to stop container after limit breach: {}",
                e
            ),
        }
        ControlFlow::Break(())
    }
}
