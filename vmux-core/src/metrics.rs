//! C12 — Metrics & Health Aggregator.
//!
//! Samples each backend on `monitoring.metrics_interval_secs`, exposing the
//! result as a text-exposition scrape (`GET /metrics`) and as hub `metrics`
//! messages scoped per VM. Health checks run independently on
//! `monitoring.health_check_interval_secs`/`compute.health_check_interval_secs`.
//!
//! Per the redesign flag ("reflection to discover a method signature on the
//! VM manager"), metrics providers are a single concrete trait implemented
//! directly by the components that have something to report — no runtime
//! method discovery.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;
use crate::libvirt::network::NetworkManager;
use crate::libvirt::pool::ConnectionPool;
use crate::libvirt::storage::StorageManager;
use crate::model::{ComputeInstance, InstanceState};

/// One instance's point-in-time resource usage sample.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetrics {
    pub name: String,
    pub state: InstanceState,
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

/// One storage pool's free/used sample.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pool: String,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// The capability a component exposes so the aggregator can sample it
/// without knowing its concrete type. Implemented directly by
/// [`crate::dispatcher::ComputeManager`] — no discovery path.
#[async_trait::async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn sample_instances(&self) -> Result<Vec<InstanceMetrics>>;
}

#[async_trait::async_trait]
impl MetricsProvider for crate::dispatcher::ComputeManager {
    async fn sample_instances(&self) -> Result<Vec<InstanceMetrics>> {
        let instances = self.list(None).await?;
        Ok(instances.iter().map(instance_to_metrics).collect())
    }
}

/// Until a backend reports real counters, a normalized instance still
/// yields a baseline sample (size from its declared resources, zeroed
/// traffic/IO) so the scrape endpoint and hub messages are always populated.
fn instance_to_metrics(instance: &ComputeInstance) -> InstanceMetrics {
    InstanceMetrics {
        name: instance.name.clone(),
        state: instance.state,
        cpu_percent: 0.0,
        memory_used_bytes: 0,
        memory_total_bytes: instance.resources.memory_bytes,
        network_rx_bytes: 0,
        network_tx_bytes: 0,
        disk_read_bytes: 0,
        disk_write_bytes: 0,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

/// Polls providers on an interval, keeps the latest sample for the scrape
/// endpoint, and republishes per-VM to the hub.
pub struct MetricsAggregator {
    compute: std::sync::Arc<crate::dispatcher::ComputeManager>,
    pool: ConnectionPool,
    storage: StorageManager,
    network: NetworkManager,
    default_pool_name: String,
    default_pool_path: String,
    default_network_name: String,
    hub: crate::hub::WsHub,
    metrics_interval: Duration,
    health_check_interval: Duration,
    latest: tokio::sync::RwLock<Vec<InstanceMetrics>>,
    last_state: dashmap::DashMap<String, InstanceState>,
}

impl MetricsAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        compute: std::sync::Arc<crate::dispatcher::ComputeManager>,
        pool: ConnectionPool,
        storage: StorageManager,
        network: NetworkManager,
        default_pool_name: String,
        default_pool_path: String,
        default_network_name: String,
        hub: crate::hub::WsHub,
        metrics_interval: Duration,
        health_check_interval: Duration,
    ) -> Self {
        Self {
            compute,
            pool,
            storage,
            network,
            default_pool_name,
            default_pool_path,
            default_network_name,
            hub,
            metrics_interval,
            health_check_interval,
            latest: tokio::sync::RwLock::new(Vec::new()),
            last_state: dashmap::DashMap::new(),
        }
    }

    /// Spawns the two independent background loops (metrics sampling,
    /// health checking) described in spec.md §4.10.
    pub fn spawn(self: std::sync::Arc<Self>) {
        let metrics_self = self.clone();
        tokio::spawn(async move { metrics_self.run_metrics_loop().await });
        let health_self = self.clone();
        tokio::spawn(async move { health_self.run_health_loop().await });
    }

    async fn run_metrics_loop(&self) {
        let mut tick = tokio::time::interval(self.metrics_interval);
        loop {
            tick.tick().await;
            match self.compute.sample_instances().await {
                Ok(samples) => {
                    for sample in &samples {
                        let data = serde_json::to_value(sample).unwrap_or_default();
                        self.hub.publish_to_vm(&sample.name, "metrics", data).await;
                        self.publish_state_transition(sample).await;
                    }
                    *self.latest.write().await = samples;
                }
                Err(e) => tracing::warn!(error = %e, "metrics sampling failed"),
            }
        }
    }

    /// Publishes a `status` message to the instance's subscribers the first
    /// time it's seen and every time its canonical state differs from the
    /// last sample, so a stop/start/crash reaches `/ws/vms/{name}` without
    /// the client having to diff successive `metrics` messages itself.
    async fn publish_state_transition(&self, sample: &InstanceMetrics) {
        let changed = match self.last_state.get(&sample.name) {
            Some(previous) => *previous != sample.state,
            None => true,
        };
        if changed {
            self.last_state.insert(sample.name.clone(), sample.state);
            let data = serde_json::json!({ "name": sample.name, "state": sample.state });
            self.hub.publish_to_vm(&sample.name, "status", data).await;
        }
    }

    async fn run_health_loop(&self) {
        let mut tick = tokio::time::interval(self.health_check_interval);
        loop {
            tick.tick().await;
            self.compute.health_check_tick().await;
            for check in self.run_health_checks().await {
                if !check.healthy {
                    tracing::warn!(check = %check.name, detail = ?check.detail, "health check failed");
                }
            }
        }
    }

    /// Hypervisor reachability plus presence/active state of the configured
    /// default storage pool and network, run on demand by `GET /health` and
    /// on every health-check tick.
    pub async fn run_health_checks(&self) -> Vec<HealthCheck> {
        let mut checks = Vec::new();

        let hypervisor = match self.pool.health_check(Duration::from_secs(5)).await {
            Ok(()) => HealthCheck { name: "hypervisor".into(), healthy: true, detail: None },
            Err(e) => HealthCheck { name: "hypervisor".into(), healthy: false, detail: Some(e.to_string()) },
        };
        checks.push(hypervisor);

        let pool_check = match self.storage.get_pool(&self.default_pool_name, &self.default_pool_path).await {
            Ok(p) if p.active => HealthCheck { name: "storage_pool".into(), healthy: true, detail: None },
            Ok(_) => HealthCheck {
                name: "storage_pool".into(),
                healthy: false,
                detail: Some(format!("pool '{}' is not active", self.default_pool_name)),
            },
            Err(e) => HealthCheck { name: "storage_pool".into(), healthy: false, detail: Some(e.to_string()) },
        };
        checks.push(pool_check);

        let network_check = match self.network.list().await {
            Ok(networks) => {
                let found = networks.iter().find(|n| n.name == self.default_network_name);
                match found {
                    Some(n) if n.active => HealthCheck { name: "network".into(), healthy: true, detail: None },
                    Some(_) => HealthCheck {
                        name: "network".into(),
                        healthy: false,
                        detail: Some(format!("network '{}' is not active", self.default_network_name)),
                    },
                    None => HealthCheck {
                        name: "network".into(),
                        healthy: false,
                        detail: Some(format!("network '{}' not found", self.default_network_name)),
                    },
                }
            }
            Err(e) => HealthCheck { name: "network".into(), healthy: false, detail: Some(e.to_string()) },
        };
        checks.push(network_check);

        checks
    }

    /// Renders the last sampled snapshot as a Prometheus-style text
    /// exposition (no client library pulled in for a handful of gauges).
    pub async fn render_scrape(&self) -> String {
        let samples = self.latest.read().await;
        let mut out = String::new();
        let _ = writeln!(out, "# HELP vmux_instance_cpu_percent CPU utilization percent");
        let _ = writeln!(out, "# TYPE vmux_instance_cpu_percent gauge");
        for sample in samples.iter() {
            let _ = writeln!(out, "vmux_instance_cpu_percent{{instance=\"{}\"}} {}", sample.name, sample.cpu_percent);
        }
        let _ = writeln!(out, "# HELP vmux_instance_memory_used_bytes Memory used in bytes");
        let _ = writeln!(out, "# TYPE vmux_instance_memory_used_bytes gauge");
        for sample in samples.iter() {
            let _ = writeln!(out, "vmux_instance_memory_used_bytes{{instance=\"{}\"}} {}", sample.name, sample.memory_used_bytes);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendKind, InstanceConfig, InstanceState, InstanceType, ResourceSpec};
    use uuid::Uuid;

    fn sample_instance() -> ComputeInstance {
        ComputeInstance {
            id: "id".into(),
            name: "test1".into(),
            uuid: Uuid::new_v4(),
            instance_type: InstanceType::Vm,
            backend: BackendKind::Kvm,
            state: InstanceState::Running,
            status: "running".into(),
            config: InstanceConfig::default(),
            resources: ResourceSpec { cpu_cores: 2.0, memory_bytes: 4 * 1024 * 1024 * 1024, storage_bytes: 0, network_bps: 0 },
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            backend_data: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn baseline_metrics_carry_declared_memory_size() {
        let metrics = instance_to_metrics(&sample_instance());
        assert_eq!(metrics.memory_total_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(metrics.name, "test1");
        assert_eq!(metrics.state, InstanceState::Running);
    }

    fn aggregator() -> MetricsAggregator {
        let libvirt_config =
            crate::config::LibvirtConfig { uri: "test:///default".into(), pool_size: 1, template_dir: "templates".into(), acquire_timeout_secs: 5 };
        let pool = ConnectionPool::new(&libvirt_config);
        let templates = std::sync::Arc::new(crate::templates::TemplateRenderer::load_dir(std::path::Path::new("/nonexistent")).unwrap());
        let acquire_timeout = Duration::from_secs(5);
        let storage = StorageManager::new(pool.clone(), templates.clone(), acquire_timeout);
        let network = NetworkManager::new(pool.clone(), templates, acquire_timeout);
        let compute_config = crate::config::ComputeConfig {
            default_backend: "kvm".into(),
            allow_mixed_deployments: false,
            enable_quotas: false,
            resource_limits: crate::config::ResourceLimits { max_cpu_cores: 4.0, max_memory_gb: 8.0, max_storage_gb: 100.0 },
            overcommit: crate::config::OvercommitConfig { cpu_ratio: 1.0, memory_ratio: 1.0 },
            health_check_interval_secs: 30,
        };
        let compute = std::sync::Arc::new(crate::dispatcher::ComputeManager::new(compute_config));
        let (hub, _commands) = crate::hub::WsHub::spawn();
        MetricsAggregator::new(
            compute,
            pool,
            storage,
            network,
            "default".into(),
            "/var/lib/libvirt/images".into(),
            "default".into(),
            hub,
            Duration::from_secs(15),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn state_transition_publishes_once_per_change() {
        let agg = aggregator();
        let mut sample = instance_to_metrics(&sample_instance());

        // First observation is always a transition (no prior state).
        agg.publish_state_transition(&sample).await;
        assert_eq!(*agg.last_state.get("test1").unwrap(), InstanceState::Running);

        // Same state again: no-op, still running.
        agg.publish_state_transition(&sample).await;
        assert_eq!(*agg.last_state.get("test1").unwrap(), InstanceState::Running);

        // Stop: state changes and is recorded.
        sample.state = InstanceState::Stopped;
        agg.publish_state_transition(&sample).await;
        assert_eq!(*agg.last_state.get("test1").unwrap(), InstanceState::Stopped);
    }
}
