//! C8 — the backend abstraction the dispatcher (C9) talks to. Both the KVM
//! adapter ([`kvm`]) and the Docker adapter ([`docker`]) implement the same
//! narrow trait so the dispatcher never branches on backend kind itself.

pub mod docker;
pub mod kvm;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{BackendKind, ComputeInstance, InstanceConfig, ResourceSpec};

/// A declarative request to bring up a new instance, independent of backend.
/// VM-only fields (`template`, `ssh_authorized_keys`) are ignored by the
/// Docker adapter; container-only intent (command/entrypoint) travels in
/// `config.env`/`config.labels` today — see [`docker::DockerBackend`] doc
/// comment for the mapping.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub config: InstanceConfig,
    pub resources: ResourceSpec,
    pub auto_start: bool,
    pub ssh_authorized_keys: Vec<String>,
}

/// The operations the dispatcher can perform uniformly across backends.
/// `pause`/`unpause` are part of the trait because Docker supports them
/// natively; KVM returns `Unsupported` (see [`kvm::KvmBackend`]).
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Rejects a request this backend cannot realize before anything is
    /// created: an unknown template, a missing image reference, a resource
    /// shape the backend doesn't support. Called by the dispatcher after
    /// the quota check and before `create`.
    async fn validate_config(&self, request: &CreateRequest) -> Result<()>;

    async fn create(&self, request: &CreateRequest) -> Result<ComputeInstance>;
    async fn get(&self, name: &str) -> Result<ComputeInstance>;
    async fn list(&self) -> Result<Vec<ComputeInstance>>;
    async fn delete(&self, name: &str) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn restart(&self, name: &str) -> Result<()>;
    async fn pause(&self, name: &str) -> Result<()>;
    async fn unpause(&self, name: &str) -> Result<()>;

    /// One cheap round-trip used by the dispatcher's health loop.
    async fn health_check(&self) -> Result<()>;
}
