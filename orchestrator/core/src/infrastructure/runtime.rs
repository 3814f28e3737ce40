// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::node_config::EngineConfig;
use crate::domain::runtime::{
    ContainerCreateSpec, ContainerEngine, ContainerId, CpuCounters, EngineError,
    RawUsageSnapshot, USAGE_SNAPSHOT_SCHEMA_VERSION,
};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StatsOptionsBuilder, StopContainerOptionsBuilder,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// [`ContainerEngine`] backed by a Docker daemon.
pub struct DockerEngine {
    docker: Docker,
    enable_storage_hints: bool,
}

impl DockerEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let docker = match config.docker_endpoint.as_deref() {
            Some(endpoint) => connect_endpoint(endpoint)?,
            None => Docker::connect_with_local_defaults().map_err(|e| {
                EngineError::Unavailable(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - On Linux: current user not in 'docker' group",
                    e
                ))
            })?,
        };

        Ok(Self {
            docker,
            enable_storage_hints: config.enable_storage_hints,
        })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(|e| {
            EngineError::Unavailable(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    fn create_body(&self, spec: &ContainerCreateSpec, with_storage: bool) -> ContainerCreateBody {
        let mut host_config = HostConfig {
            memory: Some(spec.memory_bytes as i64),
            nano_cpus: Some(spec.nano_cpus),
            ..Default::default()
        };
        if with_storage {
            if let Some(bytes) = spec.storage_bytes_hint {
                host_config.storage_opt = Some([("size".to_string(), format!("{}b", bytes))].into());
            }
        }

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env_list()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

fn connect_endpoint(endpoint: &str) -> Result<Docker, EngineError> {
    let unavailable = |e: BollardError| {
        EngineError::Unavailable(format!(
            "Failed to connect to Docker at {}: {}\n\n\
             Ensure Docker is running and the endpoint is correct.",
            endpoint, e
        ))
    };

    if let Some(path) = endpoint.strip_prefix("unix://") {
        #[cfg(unix)]
        return Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION).map_err(unavailable);
        #[cfg(not(unix))]
        return Err(EngineError::Unavailable(format!(
            "Unix socket endpoint {} is not supported on this platform",
            path
        )));
    }

    let address = endpoint
        .strip_prefix("tcp://")
        .map(|rest| format!("http://{}", rest))
        .unwrap_or_else(|| endpoint.to_string());
    Docker::connect_with_http(&address, 120, bollard::API_DEFAULT_VERSION).map_err(unavailable)
}

fn is_status(e: &BollardError, code: u16) -> bool {
    matches!(e, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

fn map_error(e: BollardError, id: &ContainerId, wrap: fn(String) -> EngineError) -> EngineError {
    if is_status(&e, 404) {
        EngineError::NotFound(id.to_string())
    } else {
        wrap(e.to_string())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: ContainerCreateSpec) -> Result<ContainerId, EngineError> {
        let options = CreateContainerOptionsBuilder::default().name(&spec.name).build();
        let storage_requested = self.enable_storage_hints && spec.storage_bytes_hint.is_some();

        let response = match self
            .docker
            .create_container(Some(options.clone()), self.create_body(&spec, storage_requested))
            .await
        {
            Ok(res) => res,
            Err(e) if storage_requested && e.to_string().contains("storage-opt") => {
                // Storage quotas need overlay2 on XFS with pquota; the size is
                // only a hint, so retry without it.
                warn!(
                    container = %spec.name,
                    "Storage hint rejected by Docker ({}). Creating container without a disk limit",
                    e
                );
                self.docker
                    .create_container(Some(options), self.create_body(&spec, false))
                    .await
                    .map_err(|e| EngineError::CreateFailed(e.to_string()))?
            }
            Err(e) => return Err(EngineError::CreateFailed(e.to_string())),
        };

        for warning in &response.warnings {
            warn!(container = %spec.name, "Docker create warning: {}", warning);
        }
        info!(container = %spec.name, id = %response.id, "Created agent container");
        Ok(ContainerId::new(response.id))
    }

    async fn start(&self, id: &ContainerId) -> Result<(), EngineError> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|e| map_error(e, id, EngineError::StartFailed))?;
        info!(id = %id, "Started agent container");
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptionsBuilder::default()
            .t(grace.as_secs().min(i32::MAX as u64) as i32)
            .build();

        match self.docker.stop_container(id.as_str(), Some(options)).await {
            Ok(()) => {}
            // 304: container already stopped
            Err(e) if is_status(&e, 304) => debug!(id = %id, "Container was already stopped"),
            Err(e) => return Err(map_error(e, id, EngineError::StopFailed)),
        }
        info!(id = %id, "Stopped agent container");
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), EngineError> {
        let options = RemoveContainerOptionsBuilder::default()
            .force(true)
            .v(true)
            .build();

        self.docker
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_error(e, id, EngineError::RemoveFailed))?;
        info!(id = %id, "Removed agent container");
        Ok(())
    }

    async fn stats(&self, id: &ContainerId) -> Result<RawUsageSnapshot, EngineError> {
        let options = StatsOptionsBuilder::default()
            .stream(false)
            .one_shot(false)
            .build();

        let mut stream = Box::pin(self.docker.stats(id.as_str(), Some(options)));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| EngineError::StatsFailed(format!("empty stats stream for {}", id)))?
            .map_err(|e| map_error(e, id, EngineError::StatsFailed))?;

        let document = serde_json::to_value(&stats)
            .map_err(|e| EngineError::StatsFailed(format!("unreadable stats payload: {}", e)))?;
        parse_stats(&document, Utc::now())
    }
}

fn lookup<'a>(doc: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(doc, |node, key| node.get(*key))
}

fn require_u64(doc: &Value, path: &[&str]) -> Result<u64, EngineError> {
    lookup(doc, path)
        .and_then(Value::as_u64)
        .ok_or_else(|| EngineError::MalformedStats(path.join(".")))
}

/// Extracts a [`RawUsageSnapshot`] from a Docker stats document.
pub fn parse_stats(doc: &Value, read_at: DateTime<Utc>) -> Result<RawUsageSnapshot, EngineError> {
    let cpu = CpuCounters {
        total_usage: require_u64(doc, &["cpu_stats", "cpu_usage", "total_usage"])?,
        system_usage: require_u64(doc, &["cpu_stats", "system_cpu_usage"])?,
    };

    // Older daemons omit online_cpus but list per-core usage
    let online_cpus = match lookup(doc, &["cpu_stats", "online_cpus"]).and_then(Value::as_u64) {
        Some(n) => n as u32,
        None => lookup(doc, &["cpu_stats", "cpu_usage", "percpu_usage"])
            .and_then(Value::as_array)
            .map(|cores| cores.len() as u32)
            .filter(|n| *n > 0)
            .ok_or_else(|| EngineError::MalformedStats("cpu_stats.online_cpus".to_string()))?,
    };

    let precpu = match (
        lookup(doc, &["precpu_stats", "cpu_usage", "total_usage"]).and_then(Value::as_u64),
        lookup(doc, &["precpu_stats", "system_cpu_usage"]).and_then(Value::as_u64),
    ) {
        (Some(total_usage), Some(system_usage)) if system_usage > 0 => {
            Some(CpuCounters { total_usage, system_usage })
        }
        _ => None,
    };

    let memory_usage_bytes = require_u64(doc, &["memory_stats", "usage"])?;

    // Containers without a network have no `networks` section
    let (network_rx_bytes, network_tx_bytes) = doc
        .get("networks")
        .and_then(Value::as_object)
        .map(|ifaces| {
            ifaces.values().fold((0u64, 0u64), |(rx, tx), iface| {
                (
                    rx + iface.get("rx_bytes").and_then(Value::as_u64).unwrap_or(0),
                    tx + iface.get("tx_bytes").and_then(Value::as_u64).unwrap_or(0),
                )
            })
        })
        .unwrap_or((0, 0));

    // Docker only reports storage counters on Windows
    let storage_used_bytes = lookup(doc, &["storage_stats", "size_rw_bytes"])
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(RawUsageSnapshot {
        schema_version: USAGE_SNAPSHOT_SCHEMA_VERSION,
        read_at,
        cpu,
        precpu,
        online_cpus,
        memory_usage_bytes,
        storage_used_bytes,
        network_rx_bytes,
        network_tx_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "cpu_stats": {
                "cpu_usage": { "total_usage": 1_100u64 },
                "system_cpu_usage": 11_000u64,
                "online_cpus": 2
            },
            "precpu_stats": {
                "cpu_usage": { "total_usage": 1_000u64 },
                "system_cpu_usage": 10_000u64
            },
            "memory_stats": { "usage": 314_572_800u64 },
            "networks": {
                "eth0": { "rx_bytes": 1_000u64, "tx_bytes": 200u64 },
                "eth1": { "rx_bytes": 24u64, "tx_bytes": 6u64 }
            }
        })
    }

    #[test]
    fn test_parse_complete_stats() {
        let snapshot = parse_stats(&sample(), Utc::now()).unwrap();
        assert_eq!(snapshot.schema_version, USAGE_SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(snapshot.cpu.total_usage, 1_100);
        assert_eq!(snapshot.online_cpus, 2);
        assert_eq!(snapshot.memory_usage_bytes, 300 * 1024 * 1024);
        assert_eq!(snapshot.network_rx_bytes, 1_024);
        assert_eq!(snapshot.network_tx_bytes, 206);
        assert_eq!(
            snapshot.precpu,
            Some(CpuCounters { total_usage: 1_000, system_usage: 10_000 })
        );
        assert_eq!(snapshot.normalize(None).cpu_usage_percent, 20.0);
    }

    #[test]
    fn test_missing_required_field_is_an_error() {
        let mut doc = sample();
        doc["memory_stats"].as_object_mut().unwrap().remove("usage");
        match parse_stats(&doc, Utc::now()) {
            Err(EngineError::MalformedStats(field)) => assert_eq!(field, "memory_stats.usage"),
            other => panic!("unexpected result: {:?}", other),
        }

        let mut doc = sample();
        doc["cpu_stats"].as_object_mut().unwrap().remove("system_cpu_usage");
        assert!(matches!(
            parse_stats(&doc, Utc::now()),
            Err(EngineError::MalformedStats(_))
        ));
    }

    #[test]
    fn test_online_cpus_fallback_and_optional_sections() {
        let doc = json!({
            "cpu_stats": {
                "cpu_usage": { "total_usage": 5u64, "percpu_usage": [1u64, 2u64, 2u64, 0u64] },
                "system_cpu_usage": 50u64
            },
            "precpu_stats": { "cpu_usage": { "total_usage": 0u64 } },
            "memory_stats": { "usage": 10u64 }
        });
        let snapshot = parse_stats(&doc, Utc::now()).unwrap();
        assert_eq!(snapshot.online_cpus, 4);
        assert_eq!(snapshot.precpu, None);
        assert_eq!(snapshot.network_rx_bytes, 0);

        let mut doc = doc;
        doc["cpu_stats"]["cpu_usage"]
            .as_object_mut()
            .unwrap()
            .remove("percpu_usage");
        assert!(matches!(
            parse_stats(&doc, Utc::now()),
            Err(EngineError::MalformedStats(f)) if f == "cpu_stats.online_cpus"
        ));
    }
}
