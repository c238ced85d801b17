//! C9 — Compute Manager / Dispatcher.
//!
//! Routes requests to the backend named on the request, or the configured
//! default, normalizes their results to [`ComputeInstance`], enforces the
//! mixed-workload policy and the resource quota, and keeps per-name mutual
//! exclusion over state-affecting operations so two concurrent `stop`s (or a
//! `stop` racing a `delete`) on the same instance serialize instead of
//! interleaving against the backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::backend::{ComputeBackend, CreateRequest};
use crate::config::ComputeConfig;
use crate::error::{Error, Result};
use crate::model::{BackendKind, ComputeInstance};

/// One create request plus the backend it targets, for batch submission.
pub struct BatchItem {
    pub request: CreateRequest,
    pub backend: Option<BackendKind>,
}

struct BackendSlot {
    backend: Arc<dyn ComputeBackend>,
    consecutive_failures: AtomicU32,
    healthy: std::sync::atomic::AtomicBool,
}

/// Consecutive health-check failures before a backend is marked unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 3;

pub struct ComputeManager {
    backends: DashMap<BackendKind, BackendSlot>,
    config: ComputeConfig,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ComputeManager {
    pub fn new(config: ComputeConfig) -> Self {
        Self { backends: DashMap::new(), config, name_locks: DashMap::new() }
    }

    pub fn register_backend(&self, kind: BackendKind, backend: Arc<dyn ComputeBackend>) {
        self.backends.insert(
            kind,
            BackendSlot { backend, consecutive_failures: AtomicU32::new(0), healthy: std::sync::atomic::AtomicBool::new(true) },
        );
    }

    fn default_backend_kind(&self) -> Result<BackendKind> {
        self.config
            .default_backend
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("invalid compute.default_backend '{}'", self.config.default_backend)))
    }

    fn resolve(&self, requested: Option<BackendKind>) -> Result<Arc<dyn ComputeBackend>> {
        let kind = match requested {
            Some(k) => k,
            None => self.default_backend_kind()?,
        };
        self.backends
            .get(&kind)
            .map(|slot| slot.backend.clone())
            .ok_or_else(|| Error::BackendUnavailable(format!("no backend registered for '{kind}'")))
    }

    fn is_healthy(&self, kind: BackendKind) -> bool {
        self.backends.get(&kind).map(|s| s.healthy.load(Ordering::SeqCst)).unwrap_or(false)
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.name_locks.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Sums cpu_cores, memory and storage bytes across every registered
    /// backend's current instances, used to enforce the overcommit-adjusted
    /// quota.
    async fn current_usage(&self) -> Result<(f64, u64, u64)> {
        let mut cpu = 0.0;
        let mut memory = 0u64;
        let mut storage = 0u64;
        for entry in self.backends.iter() {
            for instance in entry.value().backend.list().await? {
                cpu += instance.resources.cpu_cores;
                memory += instance.resources.memory_bytes;
                storage += instance.resources.storage_bytes;
            }
        }
        Ok((cpu, memory, storage))
    }

    async fn check_quota(&self, request: &CreateRequest) -> Result<()> {
        if !self.config.enable_quotas {
            return Ok(());
        }
        let (used_cpu, used_memory, used_storage) = self.current_usage().await?;
        let max_cpu = self.config.resource_limits.max_cpu_cores * self.config.overcommit.cpu_ratio;
        let max_memory_bytes =
            (self.config.resource_limits.max_memory_gb * self.config.overcommit.memory_ratio * 1024.0 * 1024.0 * 1024.0) as u64;
        // Overcommit only scales cpu/memory; storage is never oversubscribed.
        let max_storage_bytes = (self.config.resource_limits.max_storage_gb * 1024.0 * 1024.0 * 1024.0) as u64;

        if used_cpu + request.resources.cpu_cores > max_cpu {
            return Err(Error::InsufficientStorage(format!(
                "cpu quota exceeded: {used_cpu} + {} > {max_cpu} cores",
                request.resources.cpu_cores
            )));
        }
        if used_memory + request.resources.memory_bytes > max_memory_bytes {
            return Err(Error::InsufficientStorage(format!(
                "memory quota exceeded: {used_memory} + {} > {max_memory_bytes} bytes",
                request.resources.memory_bytes
            )));
        }
        if used_storage + request.resources.storage_bytes > max_storage_bytes {
            return Err(Error::InsufficientStorage(format!(
                "storage quota exceeded: {used_storage} + {} > {max_storage_bytes} bytes",
                request.resources.storage_bytes
            )));
        }
        Ok(())
    }

    pub async fn create(&self, request: CreateRequest, backend: Option<BackendKind>) -> Result<ComputeInstance> {
        let kind = backend.map(Ok).unwrap_or_else(|| self.default_backend_kind())?;
        if !self.is_healthy(kind) {
            return Err(Error::BackendUnavailable(format!("backend '{kind}' is unhealthy")));
        }
        self.check_quota(&request).await?;

        let backend = self.resolve(Some(kind))?;
        backend.validate_config(&request).await?;

        let lock = self.name_lock(&request.name);
        let _guard = lock.lock().await;
        backend.create(&request).await
    }

    /// Submits every item in one batch. Per-batch (not per-request) mixed
    /// workloads are rejected when `allow_mixed_deployments` is off: a batch
    /// containing both a VM-typed and a container-typed target fails
    /// entirely, before any item is created.
    pub async fn create_batch(&self, items: Vec<BatchItem>) -> Result<Vec<ComputeInstance>> {
        if !self.config.allow_mixed_deployments {
            let mut kinds = items.iter().map(|i| i.backend.unwrap_or(BackendKind::Kvm));
            if let Some(first) = kinds.next() {
                if kinds.any(|k| k.instance_type() != first.instance_type()) {
                    return Err(Error::InvalidParameter(
                        "mixed VM/container batches are disabled (compute.allow_mixed_deployments=false)".into(),
                    ));
                }
            }
        }

        let mut created = Vec::with_capacity(items.len());
        for item in items {
            created.push(self.create(item.request, item.backend).await?);
        }
        Ok(created)
    }

    pub async fn get(&self, name: &str, backend: Option<BackendKind>) -> Result<ComputeInstance> {
        self.resolve(backend)?.get(name).await
    }

    pub async fn list(&self, backend: Option<BackendKind>) -> Result<Vec<ComputeInstance>> {
        match backend {
            Some(kind) => self.resolve(Some(kind))?.list().await,
            None => {
                let mut all = Vec::new();
                for entry in self.backends.iter() {
                    all.extend(entry.value().backend.list().await?);
                }
                Ok(all)
            }
        }
    }

    pub async fn delete(&self, name: &str, backend: Option<BackendKind>) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.resolve(backend)?.delete(name).await
    }

    pub async fn start(&self, name: &str, backend: Option<BackendKind>) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.resolve(backend)?.start(name).await
    }

    pub async fn stop(&self, name: &str, backend: Option<BackendKind>) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.resolve(backend)?.stop(name).await
    }

    pub async fn restart(&self, name: &str, backend: Option<BackendKind>) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.resolve(backend)?.restart(name).await
    }

    pub async fn pause(&self, name: &str, backend: Option<BackendKind>) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.resolve(backend)?.pause(name).await
    }

    pub async fn unpause(&self, name: &str, backend: Option<BackendKind>) -> Result<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;
        self.resolve(backend)?.unpause(name).await
    }

    /// One round of health probes across every registered backend. Run this
    /// on a `monitoring.health_check_interval_secs`/`compute.health_check_interval_secs`
    /// tick from the server's background task set.
    pub async fn health_check_tick(&self) {
        for entry in self.backends.iter() {
            let slot = entry.value();
            match slot.backend.health_check().await {
                Ok(()) => {
                    slot.consecutive_failures.store(0, Ordering::SeqCst);
                    if !slot.healthy.swap(true, Ordering::SeqCst) {
                        tracing::info!(backend = %entry.key(), "backend recovered, marking healthy");
                    }
                }
                Err(e) => {
                    let failures = slot.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(backend = %entry.key(), failures, error = %e, "backend health check failed");
                    if failures >= UNHEALTHY_THRESHOLD && slot.healthy.swap(false, Ordering::SeqCst) {
                        tracing::error!(backend = %entry.key(), "backend marked unhealthy after {UNHEALTHY_THRESHOLD} consecutive failures");
                    }
                }
            }
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.config.health_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ComputeConfig {
        ComputeConfig {
            default_backend: "kvm".into(),
            allow_mixed_deployments: false,
            enable_quotas: true,
            resource_limits: crate::config::ResourceLimits { max_cpu_cores: 4.0, max_memory_gb: 8.0, max_storage_gb: 100.0 },
            overcommit: crate::config::OvercommitConfig { cpu_ratio: 1.0, memory_ratio: 1.0 },
            health_check_interval_secs: 10,
        }
    }

    #[test]
    fn default_backend_parses_from_config() {
        let manager = ComputeManager::new(config());
        assert_eq!(manager.default_backend_kind().unwrap(), BackendKind::Kvm);
    }

    #[test]
    fn unregistered_backend_is_unhealthy_by_definition() {
        let manager = ComputeManager::new(config());
        assert!(!manager.is_healthy(BackendKind::Docker));
    }

    #[tokio::test]
    async fn resolve_fails_without_a_registered_backend() {
        let manager = ComputeManager::new(config());
        assert!(manager.resolve(Some(BackendKind::Kvm)).is_err());
    }

    fn request_with_storage(storage_gib: u64) -> CreateRequest {
        CreateRequest {
            name: "test1".into(),
            config: crate::model::InstanceConfig::default(),
            resources: crate::model::ResourceSpec {
                cpu_cores: 1.0,
                memory_bytes: 1024,
                storage_bytes: storage_gib * crate::model::ResourceSpec::GIB,
                network_bps: 0,
            },
            auto_start: false,
            ssh_authorized_keys: Vec::new(),
        }
    }

    #[tokio::test]
    async fn check_quota_rejects_storage_over_limit() {
        let manager = ComputeManager::new(config());
        let result = manager.check_quota(&request_with_storage(200)).await;
        assert!(matches!(result, Err(Error::InsufficientStorage(_))));
    }

    #[tokio::test]
    async fn check_quota_allows_storage_within_limit() {
        let manager = ComputeManager::new(config());
        assert!(manager.check_quota(&request_with_storage(10)).await.is_ok());
    }
}
