//! C7 — VM Assembler.
//!
//! Composes C2–C6 to realize a declarative VM request end to end as a saga:
//! clone the template's base volume, optionally build and attach a
//! cloud-init volume, render and define the domain, optionally start it. Any
//! step's failure compensates in reverse so no orphaned resource survives a
//! failed `create`.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::catalog::{CloudInitBuilder, TemplateCatalog};
use crate::config::{Config, StorageConfig};
use crate::error::{Error, Result};
use crate::libvirt::domain::{DomainInfo, DomainManager, DomainSpec};
use crate::libvirt::network::NetworkManager;
use crate::libvirt::storage::StorageManager;

/// Cloud-init first-boot user/key configuration.
#[derive(Debug, Clone, Default)]
pub struct CloudInitParams {
    pub username: String,
    pub ssh_authorized_keys: Vec<String>,
}

/// A declarative request to assemble a VM.
#[derive(Debug, Clone)]
pub struct VmParams {
    pub name: String,
    pub template: String,
    pub vcpus: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub network: Option<String>,
    pub cloud_init: Option<CloudInitParams>,
    pub auto_start: bool,
}

/// Resources a saga step created, tracked so a failure can compensate in
/// reverse order.
#[derive(Default)]
struct SagaProgress {
    disk_volume: Option<String>,
    cloud_init_volume: Option<String>,
    domain_defined: bool,
}

pub struct VmAssembler {
    domains: DomainManager,
    storage: StorageManager,
    network: NetworkManager,
    catalog: Arc<TemplateCatalog>,
    cloud_init: CloudInitBuilder,
    storage_config: StorageConfig,
    default_network: String,
    iso_staging_dir: std::path::PathBuf,
}

impl VmAssembler {
    pub fn new(
        domains: DomainManager,
        storage: StorageManager,
        network: NetworkManager,
        catalog: Arc<TemplateCatalog>,
        cloud_init: CloudInitBuilder,
        config: &Config,
    ) -> Self {
        Self {
            domains,
            storage,
            network,
            catalog,
            cloud_init,
            storage_config: config.storage.clone(),
            default_network: config.network.default_network_name.clone(),
            iso_staging_dir: config.export.temp_dir.clone(),
        }
    }

    /// Side-effect-free check that `template` names a catalog entry, used by
    /// the backend's pre-`create` validation step.
    pub fn validate_template(&self, template: &str) -> Result<()> {
        self.catalog.get(template).map(|_| ())
    }

    /// `Create(VMParams) -> VM`. Duplicate names fail with `AlreadyExists`
    /// before any side effect.
    pub async fn create(&self, params: &VmParams) -> Result<DomainInfo> {
        if self.domains.get(&params.name).await.is_ok() {
            return Err(Error::AlreadyExists(format!("VM '{}' already exists", params.name)));
        }

        let template = self.catalog.get(&params.template)?;
        let vcpus = params.vcpus.unwrap_or(template.default_cpu);
        if vcpus == 0 {
            return Err(Error::InvalidParameter("vcpus must be at least 1".into()));
        }
        let memory_bytes = params.memory_bytes.unwrap_or(template.default_memory_bytes);
        if memory_bytes == 0 {
            return Err(Error::InvalidParameter("memory_bytes must be positive".into()));
        }
        let network_name = params.network.clone().unwrap_or_else(|| self.default_network.clone());
        self.resolve_network(&network_name).await?;

        let mut progress = SagaProgress::default();
        match self.run_create(params, &template, vcpus, memory_bytes, &network_name, &mut progress).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.compensate(&params.name, &progress).await;
                Err(e)
            }
        }
    }

    async fn resolve_network(&self, name: &str) -> Result<()> {
        let networks = self.network.list().await?;
        if networks.iter().any(|n| n.name == name) {
            Ok(())
        } else {
            Err(Error::InvalidParameter(format!("network '{name}' does not exist")))
        }
    }

    async fn run_create(
        &self,
        params: &VmParams,
        template: &crate::model::VmTemplate,
        vcpus: u32,
        memory_bytes: u64,
        network_name: &str,
        progress: &mut SagaProgress,
    ) -> Result<DomainInfo> {
        let pool_name = &self.storage_config.default_pool_name;
        let disk_vol_name = format!("{}-disk", params.name);
        self.storage
            .create_from_image(pool_name, &disk_vol_name, &template.base_image_path, "qcow2")
            .await?;
        progress.disk_volume = Some(disk_vol_name.clone());

        let mut cloud_init_path = None;
        if let Some(ci) = &params.cloud_init {
            let iso_path = self.iso_staging_dir.join(format!("{}-cloud-init.iso", params.name));
            self.cloud_init
                .build_iso(&params.name, &ci.username, &ci.ssh_authorized_keys, &iso_path)
                .await?;
            let ci_vol_name = format!("{}-cloud-init", params.name);
            let created = self
                .storage
                .create_from_image(pool_name, &ci_vol_name, iso_path.to_string_lossy().as_ref(), "raw")
                .await;
            let _ = tokio::fs::remove_file(&iso_path).await;
            created?;
            progress.cloud_init_volume = Some(ci_vol_name.clone());
            cloud_init_path = Some(self.volume_path(pool_name, &ci_vol_name));
        }

        let disk_path = self.volume_path(pool_name, &disk_vol_name);
        let spec = DomainSpec {
            name: params.name.clone(),
            uuid: Uuid::new_v4(),
            vcpus,
            memory_kib: memory_bytes / 1024,
            disk_path,
            cloud_init_path,
            network_name: network_name.to_string(),
        };
        self.domains.define(&spec).await?;
        progress.domain_defined = true;

        if params.auto_start {
            self.domains.start(&params.name).await?;
        }

        self.domains.get(&params.name).await
    }

    fn volume_path(&self, pool_name: &str, vol_name: &str) -> String {
        self.storage_config
            .default_pool_path
            .join(pool_name)
            .join(vol_name)
            .to_string_lossy()
            .to_string()
    }

    /// Reverse-order compensation: destroy the domain if defined, then
    /// delete the cloud-init volume, then the cloned disk volume.
    async fn compensate(&self, name: &str, progress: &SagaProgress) {
        let pool_name = &self.storage_config.default_pool_name;
        if progress.domain_defined {
            if let Err(e) = self.domains.destroy(name).await {
                tracing::warn!(name, error = %e, "compensation: failed to destroy partially created domain");
            }
        }
        if let Some(vol) = &progress.cloud_init_volume {
            if let Err(e) = self.storage.delete(pool_name, vol).await {
                tracing::warn!(vol, error = %e, "compensation: failed to delete cloud-init volume");
            }
        }
        if let Some(vol) = &progress.disk_volume {
            if let Err(e) = self.storage.delete(pool_name, vol).await {
                tracing::warn!(vol, error = %e, "compensation: failed to delete disk volume");
            }
        }
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let pool_name = &self.storage_config.default_pool_name;
        self.domains.destroy(name).await?;
        let _ = self.storage.delete(pool_name, &format!("{name}-disk")).await;
        let _ = self.storage.delete(pool_name, &format!("{name}-cloud-init")).await;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.domains.start(name).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.domains.stop(name).await
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        self.domains.stop(name).await?;
        self.domains.start(name).await
    }

    pub async fn get(&self, name: &str) -> Result<DomainInfo> {
        self.domains.get(name).await
    }

    pub async fn list(&self) -> Result<Vec<DomainInfo>> {
        self.domains.list().await
    }

    /// Deadline used for the acquire/resolve phase of a saga step; exposed
    /// so the dispatcher's health check can share the same budget.
    pub fn default_deadline() -> Duration {
        Duration::from_secs(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_progress_starts_empty() {
        let progress = SagaProgress::default();
        assert!(progress.disk_volume.is_none());
        assert!(progress.cloud_init_volume.is_none());
        assert!(!progress.domain_defined);
    }
}
