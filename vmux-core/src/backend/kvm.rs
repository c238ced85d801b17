//! C8 — KVM backend adapter.
//!
//! Thin translation layer between the dispatcher's backend-agnostic
//! [`ComputeBackend`] trait and [`VmAssembler`]'s saga-based `create`. The
//! assembler and `DomainManager` don't carry the declarative config a caller
//! submitted (only what libvirt itself reports), so this adapter keeps a
//! small side table of the config/resources/creation-time each VM was
//! created with, purely for round-tripping them back on `get`/`list`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::assembler::{CloudInitParams, VmAssembler, VmParams};
use crate::backend::{ComputeBackend, CreateRequest};
use crate::error::{Error, Result};
use crate::libvirt::domain::DomainInfo;
use crate::model::{BackendKind, ComputeInstance, InstanceConfig, InstanceState, InstanceType, ResourceSpec};

#[derive(Clone)]
struct InstanceMeta {
    config: InstanceConfig,
    resources: ResourceSpec,
    created_at: DateTime<Utc>,
}

pub struct KvmBackend {
    assembler: Arc<VmAssembler>,
    meta: DashMap<String, InstanceMeta>,
}

impl KvmBackend {
    pub fn new(assembler: Arc<VmAssembler>) -> Self {
        Self { assembler, meta: DashMap::new() }
    }

    fn to_instance(&self, info: DomainInfo) -> ComputeInstance {
        let now = Utc::now();
        let meta = self.meta.get(&info.name).map(|m| m.clone());
        let uuid = Uuid::parse_str(&info.uuid).unwrap_or_else(|_| Uuid::new_v4());
        let (config, resources, created_at) = match meta {
            Some(m) => (m.config, m.resources, m.created_at),
            None => (
                InstanceConfig::default(),
                ResourceSpec {
                    cpu_cores: info.vcpus as f64,
                    memory_bytes: info.memory_kib * 1024,
                    storage_bytes: 0,
                    network_bps: 0,
                },
                now,
            ),
        };

        ComputeInstance {
            id: uuid.to_string(),
            name: info.name,
            uuid,
            instance_type: InstanceType::Vm,
            backend: BackendKind::Kvm,
            state: info.state,
            status: format!("{:?}", info.state).to_lowercase(),
            config,
            resources,
            created_at,
            updated_at: now,
            backend_data: std::collections::HashMap::new(),
        }
    }
}

#[async_trait]
impl ComputeBackend for KvmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Kvm
    }

    async fn validate_config(&self, request: &CreateRequest) -> Result<()> {
        let template = request
            .config
            .template
            .as_deref()
            .ok_or_else(|| Error::InvalidParameter("VM creation requires config.template".into()))?;
        self.assembler.validate_template(template)?;
        if request.resources.cpu_cores < 0.0 {
            return Err(Error::InvalidParameter("vcpus must not be negative".into()));
        }
        Ok(())
    }

    async fn create(&self, request: &CreateRequest) -> Result<ComputeInstance> {
        let template = request
            .config
            .template
            .clone()
            .ok_or_else(|| Error::InvalidParameter("VM creation requires config.template".into()))?;

        let cloud_init = if request.ssh_authorized_keys.is_empty() {
            None
        } else {
            Some(CloudInitParams {
                username: "vmux".to_string(),
                ssh_authorized_keys: request.ssh_authorized_keys.clone(),
            })
        };

        let params = VmParams {
            name: request.name.clone(),
            template,
            vcpus: if request.resources.cpu_cores > 0.0 { Some(request.resources.vcpus_rounded()) } else { None },
            memory_bytes: if request.resources.memory_bytes > 0 { Some(request.resources.memory_bytes) } else { None },
            network: request.config.networks.first().cloned(),
            cloud_init,
            auto_start: request.auto_start,
        };

        let info = self.assembler.create(&params).await?;
        self.meta.insert(
            request.name.clone(),
            InstanceMeta { config: request.config.clone(), resources: request.resources, created_at: Utc::now() },
        );
        Ok(self.to_instance(info))
    }

    async fn get(&self, name: &str) -> Result<ComputeInstance> {
        let info = self.assembler.get(name).await?;
        Ok(self.to_instance(info))
    }

    async fn list(&self) -> Result<Vec<ComputeInstance>> {
        let infos = self.assembler.list().await?;
        Ok(infos.into_iter().map(|info| self.to_instance(info)).collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.assembler.delete(name).await?;
        self.meta.remove(name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.assembler.start(name).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.assembler.stop(name).await
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.assembler.restart(name).await
    }

    /// KVM pause/unpause are an open extension point the hypervisor layer
    /// doesn't implement yet (see `DomainManager::suspend`/`resume`).
    async fn pause(&self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("pause is not implemented for the KVM backend".into()))
    }

    async fn unpause(&self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("unpause is not implemented for the KVM backend".into()))
    }

    async fn health_check(&self) -> Result<()> {
        self.assembler.list().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_is_unknown_for_bad_uuid_parse() {
        let parsed = Uuid::parse_str("not-a-uuid");
        assert!(parsed.is_err());
    }
}
