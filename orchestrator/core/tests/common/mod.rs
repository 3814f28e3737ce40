// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use mindr_runtime_core::domain::container::{AgentResources, AgentRuntimeSpec};
use mindr_runtime_core::domain::events::ContainerEvent;
use mindr_runtime_core::domain::node_config::RuntimeConfig;
use mindr_runtime_core::domain::runtime::{
    ContainerCreateSpec, ContainerEngine, ContainerId, CpuCounters, EngineError, RawUsageSnapshot,
    ResourceLimits, USAGE_SNAPSHOT_SCHEMA_VERSION,
};
use mindr_runtime_core::infrastructure::event_bus::{EventBus, EventReceiver};
use mindr_runtime_core::ContainerOrchestrator;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

/// Fails every stats call
pub const ALWAYS: u32 = u32::MAX;

/// In-memory engine with programmable failures
#[derive(Default)]
pub struct FakeEngine {
    next_id: AtomicU64,
    pub memory_usage: AtomicU64,
    /// Number of upcoming stats calls that fail ([`ALWAYS`] = all of them)
    pub failing_stats: AtomicU32,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub hang_create: AtomicBool,
    pub hang_stop: AtomicBool,
    pub stats_calls: AtomicU32,
    pub created: Mutex<Vec<ContainerCreateSpec>>,
    pub stopped: Mutex<Vec<(ContainerId, Duration)>>,
    pub removed: Mutex<Vec<ContainerId>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_memory(&self, bytes: u64) {
        self.memory_usage.store(bytes, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn stop_count(&self) -> usize {
        self.stopped.lock().len()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create(&self, spec: ContainerCreateSpec) -> Result<ContainerId, EngineError> {
        if self.hang_create.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().push(spec);
        Ok(ContainerId::new(format!("fake-{}", n)))
    }

    async fn start(&self, id: &ContainerId) -> Result<(), EngineError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::StartFailed(format!("{} refused to start", id)));
        }
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), EngineError> {
        if self.hang_stop.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(EngineError::StopFailed(format!("{} is stuck", id)));
        }
        self.stopped.lock().push((id.clone(), grace));
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.removed.lock().push(id.clone());
        Ok(())
    }

    async fn stats(&self, id: &ContainerId) -> Result<RawUsageSnapshot, EngineError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_stats.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != ALWAYS {
                self.failing_stats.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(EngineError::StatsFailed(format!("{} stats unavailable", id)));
        }

        Ok(RawUsageSnapshot {
            schema_version: USAGE_SNAPSHOT_SCHEMA_VERSION,
            read_at: Utc::now(),
            cpu: CpuCounters {
                total_usage: 0,
                system_usage: 0,
            },
            precpu: None,
            online_cpus: 1,
            memory_usage_bytes: self.memory_usage.load(Ordering::SeqCst),
            storage_used_bytes: 0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        })
    }
}

pub fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.default_timeout = Duration::from_secs(2);
    config.stop_grace_period = Duration::from_millis(50);
    config.monitor.poll_interval = Duration::from_millis(20);
    config.resource_limits = ResourceLimits {
        memory_bytes: 256 * MIB,
        ..ResourceLimits::default()
    };
    config
}

pub fn spec(agent: &str) -> AgentRuntimeSpec {
    AgentRuntimeSpec::new(
        agent,
        AgentResources {
            memory_bytes: 256 * MIB,
            cpu_fraction: 0.5,
            storage_bytes: 0,
            timeout: Duration::from_secs(30),
        },
    )
}

pub fn setup(config: RuntimeConfig) -> (ContainerOrchestrator, Arc<FakeEngine>) {
    let engine = FakeEngine::new();
    let orchestrator = ContainerOrchestrator::new(engine.clone(), config, EventBus::new(100));
    (orchestrator, engine)
}

pub async fn next_event(events: &mut EventReceiver) -> ContainerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
