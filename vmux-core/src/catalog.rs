//! C6 — Template Catalog & Cloud-Init.
//!
//! The catalog is a named registry of VM templates (base image + default
//! sizing) populated at startup from config; `CloudInitBuilder` renders
//! first-boot configuration and packages it into an ISO the domain can
//! attach as a cdrom device.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;

use serde::Serialize;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::model::VmTemplate;
use crate::templates::TemplateRenderer;

/// In-memory registry of named VM templates.
pub struct TemplateCatalog {
    templates: RwLock<HashMap<String, VmTemplate>>,
}

impl TemplateCatalog {
    pub fn new(templates: Vec<VmTemplate>) -> Self {
        let map = templates.into_iter().map(|t| (t.name.clone(), t)).collect();
        Self { templates: RwLock::new(map) }
    }

    pub fn get(&self, name: &str) -> Result<VmTemplate> {
        self.templates
            .read()
            .expect("catalog lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("VM template '{name}' not found")))
    }

    pub fn list(&self) -> Vec<VmTemplate> {
        self.templates.read().expect("catalog lock poisoned").values().cloned().collect()
    }

    pub fn register(&self, template: VmTemplate) {
        self.templates.write().expect("catalog lock poisoned").insert(template.name.clone(), template);
    }
}

#[derive(Serialize)]
struct UserDataParams<'a> {
    hostname: &'a str,
    username: &'a str,
    lock_passwd: bool,
    password_hash: Option<&'a str>,
    ssh_authorized_keys: &'a [String],
}

#[derive(Serialize)]
struct MetaDataParams<'a> {
    instance_id: &'a str,
    hostname: &'a str,
}

/// First-boot configuration: a `user-data` + `meta-data` pair rendered from
/// templates and packaged into a small ISO9660 volume.
pub struct CloudInitBuilder {
    templates: Arc<TemplateRenderer>,
}

impl CloudInitBuilder {
    pub fn new(templates: Arc<TemplateRenderer>) -> Self {
        Self { templates }
    }

    /// Render `user-data` and `meta-data` and write an ISO9660 image
    /// suitable for attaching as a cdrom device at `output_path`. Requires
    /// `genisoimage` (or a `mkisofs`-compatible equivalent) on PATH.
    pub async fn build_iso(
        &self,
        instance_name: &str,
        username: &str,
        ssh_authorized_keys: &[String],
        output_path: &Path,
    ) -> Result<()> {
        let user_data = self.templates.render(
            "cloud_init_user_data",
            UserDataParams {
                hostname: instance_name,
                username,
                lock_passwd: true,
                password_hash: None,
                ssh_authorized_keys,
            },
        )?;
        let meta_data = self.templates.render(
            "cloud_init_meta_data",
            MetaDataParams { instance_id: instance_name, hostname: instance_name },
        )?;

        let stage_dir = std::env::temp_dir().join(format!("vmux-cloud-init-{instance_name}-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&stage_dir).await?;
        tokio::fs::write(stage_dir.join("user-data"), &user_data).await?;
        tokio::fs::write(stage_dir.join("meta-data"), &meta_data).await?;

        let result = self.run_genisoimage(&stage_dir, output_path).await;
        let _ = tokio::fs::remove_dir_all(&stage_dir).await;
        result
    }

    async fn run_genisoimage(&self, stage_dir: &Path, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = Command::new("genisoimage")
            .arg("-output")
            .arg(output_path)
            .arg("-volid")
            .arg("cidata")
            .arg("-joliet")
            .arg("-rock")
            .arg(stage_dir.join("user-data"))
            .arg(stage_dir.join("meta-data"))
            .output()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("genisoimage not available: {e}")))?;

        if !output.status.success() {
            return Err(Error::Internal(format!(
                "genisoimage failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str) -> VmTemplate {
        VmTemplate {
            name: name.to_string(),
            base_image_path: "/var/lib/vmux/images/base.qcow2".into(),
            default_cpu: 2,
            default_memory_bytes: 2 * 1024 * 1024 * 1024,
            default_disk_bytes: 10 * 1024 * 1024 * 1024,
            os_variant: "ubuntu24.04".into(),
        }
    }

    #[test]
    fn get_unknown_template_is_not_found() {
        let catalog = TemplateCatalog::new(vec![template("ubuntu-24.04")]);
        assert!(catalog.get("missing").is_err());
        assert!(catalog.get("ubuntu-24.04").is_ok());
    }

    #[test]
    fn register_adds_to_catalog() {
        let catalog = TemplateCatalog::new(vec![]);
        catalog.register(template("debian-12"));
        assert_eq!(catalog.list().len(), 1);
    }
}
