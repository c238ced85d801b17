//! C3 — Domain Manager.
//!
//! CRUD and power-state transitions for hypervisor guests. Every operation
//! borrows exactly one session from the connection pool, performs one
//! logical round-trip (a handful of libvirt calls against that one domain),
//! and releases the session on every exit path via the `PooledSession`
//! guard's `Drop`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use virt::domain::Domain;
use virt::sys;

use crate::error::{Error, Result};
use crate::libvirt::pool::ConnectionPool;
use crate::model::InstanceState;
use crate::templates::TemplateRenderer;

/// Parameters used to render the domain XML template.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSpec {
    pub name: String,
    pub uuid: uuid::Uuid,
    pub vcpus: u32,
    pub memory_kib: u64,
    pub disk_path: String,
    pub cloud_init_path: Option<String>,
    pub network_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainInfo {
    pub name: String,
    pub uuid: String,
    pub state: InstanceState,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub cpu_time_ns: u64,
}

/// Translate a libvirt domain state code to the canonical state, per the
/// fixed backend-state map: running→running; stopped,shutdown→stopped;
/// paused→paused; crashed→error; anything else→unknown.
fn canonical_state(raw: u32) -> InstanceState {
    match raw {
        sys::VIR_DOMAIN_RUNNING => InstanceState::Running,
        sys::VIR_DOMAIN_SHUTOFF | sys::VIR_DOMAIN_SHUTDOWN => InstanceState::Stopped,
        sys::VIR_DOMAIN_PAUSED => InstanceState::Paused,
        sys::VIR_DOMAIN_CRASHED => InstanceState::Error,
        _ => InstanceState::Unknown,
    }
}

pub struct DomainManager {
    pool: ConnectionPool,
    templates: std::sync::Arc<TemplateRenderer>,
    acquire_timeout: Duration,
}

impl DomainManager {
    pub fn new(pool: ConnectionPool, templates: std::sync::Arc<TemplateRenderer>, acquire_timeout: Duration) -> Self {
        Self { pool, templates, acquire_timeout }
    }

    /// `Define(spec) -> Handle`. Renders domain XML from the `domain`
    /// template and defines it against the hypervisor; does not start it.
    pub async fn define(&self, spec: &DomainSpec) -> Result<()> {
        let xml = self.templates.render("domain", spec)?;
        let session = self.pool.acquire(self.acquire_timeout).await?;
        Domain::define_xml(session.connect(), &xml)
            .map_err(|e| Error::Internal(format!("failed to define domain '{}': {e}", spec.name)))?;
        Ok(())
    }

    fn lookup(session: &virt::connect::Connect, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(session, name)
            .map_err(|_| Error::NotFound(format!("domain '{name}' not found")))
    }

    /// Idempotent: starting an already-running domain succeeds with no
    /// side effect.
    pub async fn start(&self, name: &str) -> Result<()> {
        let session = self.pool.acquire(self.acquire_timeout).await?;
        let domain = Self::lookup(session.connect(), name)?;
        let info = domain
            .get_info()
            .map_err(|e| Error::Internal(format!("get_info failed for '{name}': {e}")))?;
        if canonical_state(info.state) == InstanceState::Running {
            return Ok(());
        }
        domain
            .create()
            .map_err(|e| Error::InvalidState(format!("failed to start domain '{name}': {e}")))?;
        Ok(())
    }

    /// Graceful shutdown first (polled every 1s up to 30s), escalating to
    /// forced destroy.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let session = self.pool.acquire(self.acquire_timeout).await?;
        let domain = Self::lookup(session.connect(), name)?;
        let info = domain.get_info().map_err(|e| Error::Internal(e.to_string()))?;
        if canonical_state(info.state) == InstanceState::Stopped {
            return Ok(());
        }

        domain
            .shutdown()
            .map_err(|e| Error::InvalidState(format!("shutdown request failed for '{name}': {e}")))?;

        for _ in 0..30 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Ok(info) = domain.get_info() {
                if canonical_state(info.state) == InstanceState::Stopped {
                    return Ok(());
                }
            }
        }

        tracing::warn!(name, "graceful shutdown timed out, escalating to destroy");
        domain
            .destroy()
            .map_err(|e| Error::Internal(format!("forced destroy failed for '{name}': {e}")))?;
        Ok(())
    }

    pub async fn reboot(&self, name: &str) -> Result<()> {
        let session = self.pool.acquire(self.acquire_timeout).await?;
        let domain = Self::lookup(session.connect(), name)?;
        domain
            .reboot(0)
            .map_err(|e| Error::Internal(format!("reboot failed for '{name}': {e}")))?;
        Ok(())
    }

    pub async fn destroy(&self, name: &str) -> Result<()> {
        let session = self.pool.acquire(self.acquire_timeout).await?;
        let domain = Self::lookup(session.connect(), name)?;
        if domain.destroy().is_err() {
            // Domain may already be shut off; destroy on a stopped domain
            // is a no-op from the caller's perspective.
            tracing::debug!(name, "destroy on a non-running domain ignored");
        }
        domain
            .undefine()
            .map_err(|e| Error::Internal(format!("undefine failed for '{name}': {e}")))?;
        Ok(())
    }

    /// `Unsupported` per the open extension point left by the spec; KVM
    /// pause/unpause are stubs until a concrete need arises.
    pub async fn suspend(&self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("domain suspend is not implemented for the KVM backend".into()))
    }

    pub async fn resume(&self, _name: &str) -> Result<()> {
        Err(Error::Unsupported("domain resume is not implemented for the KVM backend".into()))
    }

    pub async fn get(&self, name: &str) -> Result<DomainInfo> {
        let session = self.pool.acquire(self.acquire_timeout).await?;
        let domain = Self::lookup(session.connect(), name)?;
        Self::domain_info(&domain, name)
    }

    pub async fn list(&self) -> Result<Vec<DomainInfo>> {
        let session = self.pool.acquire(self.acquire_timeout).await?;
        let domains = session
            .connect()
            .list_all_domains(0)
            .map_err(|e| Error::Internal(format!("list_all_domains failed: {e}")))?;
        let mut out = Vec::with_capacity(domains.len());
        for domain in &domains {
            let name = domain.get_name().unwrap_or_default();
            out.push(Self::domain_info(domain, &name)?);
        }
        Ok(out)
    }

    pub async fn get_xml(&self, name: &str) -> Result<String> {
        let session = self.pool.acquire(self.acquire_timeout).await?;
        let domain = Self::lookup(session.connect(), name)?;
        domain
            .get_xml_desc(0)
            .map_err(|e| Error::Internal(format!("get_xml_desc failed for '{name}': {e}")))
    }

    /// Takes a disk-only external snapshot of a running domain so the export
    /// pipeline has a point-in-time, consistent disk image to read without
    /// stopping the VM. The snapshot file is written alongside the live disk
    /// at `snapshot_path`; callers are responsible for blockcommit/cleanup
    /// once the export has read it.
    pub async fn snapshot_disk(&self, name: &str, snapshot_path: &str) -> Result<()> {
        let session = self.pool.acquire(self.acquire_timeout).await?;
        let domain = Self::lookup(session.connect(), name)?;
        let xml = format!(
            r#"<domainsnapshot><disks><disk name="vda" snapshot="external"><source file="{snapshot_path}"/></disk></disks></domainsnapshot>"#
        );
        let flags = sys::VIR_DOMAIN_SNAPSHOT_CREATE_DISK_ONLY | sys::VIR_DOMAIN_SNAPSHOT_CREATE_ATOMIC;
        domain
            .snapshot_create_xml(&xml, flags)
            .map_err(|e| Error::Internal(format!("disk snapshot failed for '{name}': {e}")))?;
        Ok(())
    }

    fn domain_info(domain: &Domain, name: &str) -> Result<DomainInfo> {
        let info = domain
            .get_info()
            .map_err(|e| Error::Internal(format!("get_info failed for '{name}': {e}")))?;
        let uuid = domain.get_uuid_string().unwrap_or_default();
        Ok(DomainInfo {
            name: name.to_string(),
            uuid,
            state: canonical_state(info.state),
            max_memory_kib: info.max_mem,
            memory_kib: info.memory,
            vcpus: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_map_matches_canonical_states() {
        assert_eq!(canonical_state(sys::VIR_DOMAIN_RUNNING), InstanceState::Running);
        assert_eq!(canonical_state(sys::VIR_DOMAIN_SHUTOFF), InstanceState::Stopped);
        assert_eq!(canonical_state(sys::VIR_DOMAIN_SHUTDOWN), InstanceState::Stopped);
        assert_eq!(canonical_state(sys::VIR_DOMAIN_PAUSED), InstanceState::Paused);
        assert_eq!(canonical_state(sys::VIR_DOMAIN_CRASHED), InstanceState::Error);
        assert_eq!(canonical_state(sys::VIR_DOMAIN_NOSTATE), InstanceState::Unknown);
    }
}
