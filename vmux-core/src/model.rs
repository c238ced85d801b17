//! The canonical data model shared by every backend and route handler.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of compute a [`ComputeInstance`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Vm,
    Container,
}

/// Which backend realizes a [`ComputeInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Kvm,
    Docker,
}

impl BackendKind {
    /// `backend ⇒ type` is determined: kvm implies vm, docker implies container.
    pub fn instance_type(&self) -> InstanceType {
        match self {
            BackendKind::Kvm => InstanceType::Vm,
            BackendKind::Docker => InstanceType::Container,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Kvm => write!(f, "kvm"),
            BackendKind::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kvm" => Ok(BackendKind::Kvm),
            "docker" => Ok(BackendKind::Docker),
            other => Err(crate::error::Error::InvalidParameter(format!(
                "unknown backend '{other}'"
            ))),
        }
    }
}

/// Canonical lifecycle state of a [`ComputeInstance`], after normalization
/// via the fixed backend-state map in the glossary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Stopped,
    Paused,
    Error,
    Unknown,
}

/// Declarative environment, volumes, network attachments and labels for an
/// instance, independent of which backend realizes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub image: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Sizing for an instance. VM cores are rounded to an integer at ingest;
/// containers keep fractional CPU. GiB/Mbps inputs are converted to bytes
/// and bits-per-second at ingest time (×1024³ / ×1024²) — never re-derived
/// downstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub network_bps: u64,
}

impl ResourceSpec {
    pub const GIB: u64 = 1024 * 1024 * 1024;
    pub const MBIT: u64 = 1024 * 1024;

    pub fn from_gib_mbps(cpu_cores: f64, memory_gib: f64, storage_gib: f64, network_mbps: f64) -> Self {
        Self {
            cpu_cores,
            memory_bytes: (memory_gib * Self::GIB as f64) as u64,
            storage_bytes: (storage_gib * Self::GIB as f64) as u64,
            network_bps: (network_mbps * Self::MBIT as f64) as u64,
        }
    }

    /// VM cores must be a whole number of vCPUs.
    pub fn vcpus_rounded(&self) -> u32 {
        self.cpu_cores.round().max(1.0) as u32
    }
}

/// The canonical record produced by the dispatcher regardless of backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeInstance {
    pub id: String,
    pub name: String,
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub instance_type: InstanceType,
    pub backend: BackendKind,
    pub state: InstanceState,
    pub status: String,
    pub config: InstanceConfig,
    pub resources: ResourceSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub backend_data: HashMap<String, serde_json::Value>,
}

impl ComputeInstance {
    /// `id` is stable for the record's lifetime and equals `uuid` for VMs.
    pub fn stable_id(backend: BackendKind, uuid: Uuid, container_id: Option<&str>) -> String {
        match backend {
            BackendKind::Kvm => uuid.to_string(),
            BackendKind::Docker => container_id.unwrap_or(&uuid.to_string()).to_string(),
        }
    }
}

/// Container/VM disk export format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Qcow2,
    Vmdk,
    Vdi,
    Raw,
    Ova,
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExportFormat::Qcow2 => "qcow2",
            ExportFormat::Vmdk => "vmdk",
            ExportFormat::Vdi => "vdi",
            ExportFormat::Raw => "raw",
            ExportFormat::Ova => "ova",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    pub source_vm_name: String,
    pub format: ExportFormat,
    pub status: ExportStatus,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output_path: Option<String>,
    pub error: Option<String>,
}

impl ExportJob {
    pub fn new(source_vm_name: String, format: ExportFormat) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_vm_name,
            format,
            status: ExportStatus::Pending,
            progress: 0,
            started_at: Utc::now(),
            ended_at: None,
            output_path: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ExportStatus::Completed | ExportStatus::Failed | ExportStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    pub name: String,
    pub path: String,
    pub capacity_bytes: u64,
    pub allocated_bytes: u64,
    pub available_bytes: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageVolume {
    pub pool: String,
    pub name: String,
    pub path: String,
    pub capacity_bytes: u64,
    pub allocated_bytes: u64,
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Virtual,
    Bridge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub bridge_name: String,
    pub forward_mode: String,
    pub active: bool,
    pub autostart: bool,
    pub dhcp_range: Option<String>,
    pub kind: NetworkKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTemplate {
    pub name: String,
    pub base_image_path: String,
    pub default_cpu: u32,
    pub default_memory_bytes: u64,
    pub default_disk_bytes: u64,
    pub os_variant: String,
}

/// The external contract this core observes of the user record; password
/// storage and issuance live outside the core's hard engineering but a
/// runnable service needs this shape concretely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub active: bool,
    #[serde(skip_serializing)]
    pub password_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_implies_type() {
        assert_eq!(BackendKind::Kvm.instance_type(), InstanceType::Vm);
        assert_eq!(BackendKind::Docker.instance_type(), InstanceType::Container);
    }

    #[test]
    fn gib_conversion_is_exact_power_of_two() {
        let r = ResourceSpec::from_gib_mbps(2.0, 2.0, 10.0, 100.0);
        assert_eq!(r.memory_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(r.storage_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(r.vcpus_rounded(), 2);
    }

    #[test]
    fn fractional_cores_round_for_vms() {
        let r = ResourceSpec { cpu_cores: 1.4, ..Default::default() };
        assert_eq!(r.vcpus_rounded(), 1);
        let r = ResourceSpec { cpu_cores: 1.6, ..Default::default() };
        assert_eq!(r.vcpus_rounded(), 2);
    }

    #[test]
    fn export_job_starts_pending_not_terminal() {
        let job = ExportJob::new("test1".into(), ExportFormat::Qcow2);
        assert_eq!(job.status, ExportStatus::Pending);
        assert!(!job.is_terminal());
        assert!(job.ended_at.is_none());
    }
}
