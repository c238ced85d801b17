//! Wire-layer request/response DTOs.
//!
//! Kept distinct from [`crate::model`] so the domain structs stay free of
//! HTTP-framing concerns (optional fields for partial updates, auth-specific
//! shapes, pagination envelopes). Handlers in [`crate::router`] convert
//! between these and the domain model at the boundary.

use serde::{Deserialize, Serialize};

use crate::model::{
    BackendKind, ComputeInstance, ExportFormat, ExportJob, InstanceConfig, Network, ResourceSpec,
    StoragePool, StorageVolume, VmTemplate,
};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: i64,
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub token: String,
}

/// Request body for both `POST /vms` and `POST /compute/instances` — the
/// two routes that create an instance differ only in which default backend
/// they assume.
#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub config: InstanceConfig,
    #[serde(default)]
    pub resources: ResourceSpecRequest,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
}

/// Resource sizing as the client submits it — GiB/Mbps, not raw bytes/bps.
/// Converted to [`ResourceSpec`] at ingest per the data model's fixed
/// conversion (×1024³, ×1024²).
#[derive(Debug, Default, Deserialize)]
pub struct ResourceSpecRequest {
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub memory_gib: f64,
    #[serde(default)]
    pub storage_gib: f64,
    #[serde(default)]
    pub network_mbps: f64,
}

impl From<ResourceSpecRequest> for ResourceSpec {
    fn from(r: ResourceSpecRequest) -> Self {
        ResourceSpec::from_gib_mbps(r.cpu_cores, r.memory_gib, r.storage_gib, r.network_mbps)
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    #[serde(flatten)]
    pub instance: ComputeInstance,
}

impl From<ComputeInstance> for InstanceResponse {
    fn from(instance: ComputeInstance) -> Self {
        Self { instance }
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceListResponse {
    pub instances: Vec<ComputeInstance>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListInstancesQuery {
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub format: ExportFormat,
    #[serde(default)]
    pub allow_running: bool,
}

#[derive(Debug, Serialize)]
pub struct ExportJobResponse {
    #[serde(flatten)]
    pub job: ExportJob,
}

impl From<ExportJob> for ExportJobResponse {
    fn from(job: ExportJob) -> Self {
        Self { job }
    }
}

#[derive(Debug, Serialize)]
pub struct ExportListResponse {
    pub jobs: Vec<ExportJob>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct PoolListResponse {
    pub pools: Vec<StoragePool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_bytes: u64,
    #[serde(default = "default_volume_format")]
    pub format: String,
}

fn default_volume_format() -> String {
    "qcow2".to_string()
}

#[derive(Debug, Serialize)]
pub struct VolumeListResponse {
    pub volumes: Vec<StorageVolume>,
}

#[derive(Debug, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    #[serde(default)]
    pub bridge_name: Option<String>,
    #[serde(default = "default_forward_mode")]
    pub forward_mode: String,
    #[serde(default)]
    pub dhcp_range: Option<DhcpRangeRequest>,
}

#[derive(Debug, Deserialize)]
pub struct DhcpRangeRequest {
    pub gateway: String,
    pub netmask: String,
    pub start: String,
    pub end: String,
}

fn default_forward_mode() -> String {
    "nat".to_string()
}

#[derive(Debug, Serialize)]
pub struct NetworkListResponse {
    pub networks: Vec<Network>,
}

#[derive(Debug, Serialize)]
pub struct TemplateListResponse {
    pub templates: Vec<VmTemplate>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub checks: Vec<HealthCheckResult>,
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_request_converts_gib_to_bytes() {
        let spec: ResourceSpec = ResourceSpecRequest { cpu_cores: 2.0, memory_gib: 2.0, storage_gib: 10.0, network_mbps: 100.0 }.into();
        assert_eq!(spec.memory_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(spec.cpu_cores, 2.0);
    }

    #[test]
    fn login_request_deserializes() {
        let req: LoginRequest = serde_json::from_str(r#"{"username":"alice","password":"hunter2"}"#).unwrap();
        assert_eq!(req.username, "alice");
    }
}
