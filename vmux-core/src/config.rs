//! Configuration management using Figment.
//!
//! Configuration is loaded from, highest precedence first:
//! 1. Environment variables (prefix `VMUX_`, `__` splits nested keys)
//! 2. The YAML file passed via `--config` (default `configs/config.yaml`)
//! 3. Built-in defaults
//!
//! Every scalar field is therefore overridable without touching the file,
//! matching the CLI contract: `VMUX_SERVER__PORT=9000` overrides
//! `server.port`.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub libvirt: LibvirtConfig,
    pub auth: AuthConfig,
    pub export: ExportConfig,
    pub storage: StorageConfig,
    pub network: NetworkConfig,
    pub docker: DockerConfig,
    pub compute: ComputeConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibvirtConfig {
    #[serde(default = "default_libvirt_uri")]
    pub uri: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub jwt_secret: String,
    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: String,
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,
    #[serde(default = "default_jwt_ttl_secs")]
    pub jwt_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_export_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_allowed_formats")]
    pub allowed_formats: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_pool_name")]
    pub default_pool_name: String,
    #[serde(default = "default_pool_path")]
    pub default_pool_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_network_name")]
    pub default_network_name: String,
    #[serde(default = "default_bridge_name")]
    pub default_bridge_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub tls: DockerTlsConfig,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    #[serde(default = "default_backend")]
    pub default_backend: String,
    #[serde(default)]
    pub allow_mixed_deployments: bool,
    #[serde(default = "default_true")]
    pub enable_quotas: bool,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub overcommit: OvercommitConfig,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_max_cpu_cores")]
    pub max_cpu_cores: f64,
    #[serde(default = "default_max_memory_gb")]
    pub max_memory_gb: f64,
    #[serde(default = "default_max_storage_gb")]
    pub max_storage_gb: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_cores: default_max_cpu_cores(),
            max_memory_gb: default_max_memory_gb(),
            max_storage_gb: default_max_storage_gb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvercommitConfig {
    #[serde(default = "default_overcommit_ratio")]
    pub cpu_ratio: f64,
    #[serde(default = "default_overcommit_ratio")]
    pub memory_ratio: f64,
}

impl Default for OvercommitConfig {
    fn default() -> Self {
        Self {
            cpu_ratio: default_overcommit_ratio(),
            memory_ratio: default_overcommit_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_driver")]
    pub driver: String,
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_true")]
    pub websocket_console: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                timeout_secs: default_timeout_secs(),
                shutdown_grace_secs: default_shutdown_grace_secs(),
                body_limit_mb: default_body_limit_mb(),
                cors_mode: default_cors_mode(),
            },
            libvirt: LibvirtConfig {
                uri: default_libvirt_uri(),
                pool_size: default_pool_size(),
                template_dir: default_template_dir(),
                acquire_timeout_secs: default_acquire_timeout_secs(),
            },
            auth: AuthConfig {
                enabled: true,
                jwt_secret: "change-me".into(),
                jwt_algorithm: default_jwt_algorithm(),
                jwt_issuer: default_jwt_issuer(),
                jwt_ttl_secs: default_jwt_ttl_secs(),
            },
            export: ExportConfig {
                output_dir: default_export_output_dir(),
                temp_dir: default_export_temp_dir(),
                worker_count: default_worker_count(),
                retention_hours: default_retention_hours(),
                allowed_formats: default_allowed_formats(),
            },
            storage: StorageConfig {
                default_pool_name: default_pool_name(),
                default_pool_path: default_pool_path(),
            },
            network: NetworkConfig {
                default_network_name: default_network_name(),
                default_bridge_name: default_bridge_name(),
            },
            docker: DockerConfig {
                host: None,
                tls: DockerTlsConfig::default(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay_secs(),
            },
            compute: ComputeConfig {
                default_backend: default_backend(),
                allow_mixed_deployments: false,
                enable_quotas: true,
                resource_limits: ResourceLimits::default(),
                overcommit: OvercommitConfig::default(),
                health_check_interval_secs: default_health_check_interval_secs(),
            },
            monitoring: MonitoringConfig {
                metrics_interval_secs: default_metrics_interval_secs(),
                health_check_interval_secs: default_health_check_interval_secs(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
                json: false,
            },
            database: DatabaseConfig {
                driver: default_db_driver(),
                url: default_db_url(),
                max_connections: default_max_connections(),
                connection_timeout_secs: default_connection_timeout_secs(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay_secs(),
            },
            features: FeaturesConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration layering defaults, the given file (if it exists)
    /// and `VMUX_`-prefixed environment variables.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if path.exists() {
            figment = figment.merge(Yaml::file(path));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults + env overrides");
        }

        let config: Config = figment
            .merge(Env::prefixed("VMUX_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Loads from the first of `find_config_paths` that exists, or from the
    /// working-directory default if none do (`load_from` then falls back to
    /// defaults + env).
    pub fn load() -> Result<Self> {
        let path = find_config_paths().into_iter().find(|p| p.exists()).unwrap_or_else(default_config_path);
        Self::load_from(&path)
    }

    /// Enforce the constraints named in the external interface contract.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::InvalidParameter("server.port must be in [1,65535]".into()));
        }
        if self.server.timeout_secs == 0 {
            return Err(Error::InvalidParameter("server.timeout_secs must be positive".into()));
        }
        if self.server.shutdown_grace_secs == 0 {
            return Err(Error::InvalidParameter(
                "server.shutdown_grace_secs must be positive".into(),
            ));
        }

        const VALID_URI_PREFIXES: &[&str] = &["qemu", "xen", "lxc", "test"];
        if !VALID_URI_PREFIXES
            .iter()
            .any(|p| self.libvirt.uri.starts_with(p))
        {
            return Err(Error::InvalidParameter(format!(
                "libvirt.uri must start with one of {VALID_URI_PREFIXES:?}, got '{}'",
                self.libvirt.uri
            )));
        }
        if self.libvirt.pool_size == 0 {
            return Err(Error::InvalidParameter("libvirt.pool_size must be positive".into()));
        }

        const VALID_ALGORITHMS: &[&str] = &["HS256", "RS256", "ES256"];
        if !VALID_ALGORITHMS.contains(&self.auth.jwt_algorithm.as_str()) {
            return Err(Error::InvalidParameter(format!(
                "auth.jwt_algorithm must be one of {VALID_ALGORITHMS:?}"
            )));
        }

        const VALID_FORMATS: &[&str] = &["qcow2", "vmdk", "vdi", "ova", "raw"];
        for f in &self.export.allowed_formats {
            if !VALID_FORMATS.contains(&f.as_str()) {
                return Err(Error::InvalidParameter(format!(
                    "export.allowed_formats contains unknown format '{f}'"
                )));
            }
        }
        if self.export.worker_count == 0 {
            return Err(Error::InvalidParameter("export.worker_count must be positive".into()));
        }

        ensure_writable_dir(&self.export.output_dir, "export.output_dir")?;
        ensure_writable_dir(&self.export.temp_dir, "export.temp_dir")?;

        Ok(())
    }
}

/// Creates `dir` if it's missing and probes it with a throwaway file, so a
/// misconfigured or read-only export path is caught at startup rather than
/// on the first export.
fn ensure_writable_dir(dir: &Path, field: &str) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| Error::InvalidParameter(format!("{field} '{}' is not usable: {e}", dir.display())))?;

    let probe = dir.join(format!(".vmux-write-test-{}", uuid::Uuid::new_v4()));
    std::fs::write(&probe, b"")
        .map_err(|e| Error::InvalidParameter(format!("{field} '{}' is not writable: {e}", dir.display())))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

fn default_config_path() -> PathBuf {
    PathBuf::from("configs/config.yaml")
}

/// Candidate config paths in priority order: working directory, then the
/// XDG user config directory, then the system directory.
fn find_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![default_config_path()];

    let xdg_dirs = xdg::BaseDirectories::with_prefix("vmux");
    if let Some(path) = xdg_dirs.find_config_file("config.yaml") {
        paths.push(path);
    }

    paths.push(PathBuf::from("/etc/vmux/config.yaml"));
    paths
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_body_limit_mb() -> usize {
    10
}
fn default_cors_mode() -> String {
    "restrictive".to_string()
}
fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}
fn default_pool_size() -> usize {
    8
}
fn default_template_dir() -> PathBuf {
    PathBuf::from("templates")
}
fn default_acquire_timeout_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}
fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}
fn default_jwt_issuer() -> String {
    "vmux".to_string()
}
fn default_jwt_ttl_secs() -> i64 {
    3600
}
fn default_export_output_dir() -> PathBuf {
    PathBuf::from("exports/output")
}
fn default_export_temp_dir() -> PathBuf {
    PathBuf::from("exports/tmp")
}
fn default_worker_count() -> usize {
    2
}
fn default_retention_hours() -> u64 {
    168
}
fn default_allowed_formats() -> Vec<String> {
    vec!["qcow2".into(), "vmdk".into(), "vdi".into(), "raw".into(), "ova".into()]
}
fn default_pool_name() -> String {
    "default".to_string()
}
fn default_pool_path() -> PathBuf {
    PathBuf::from("/var/lib/vmux/storage")
}
fn default_network_name() -> String {
    "default".to_string()
}
fn default_bridge_name() -> String {
    "virbr0".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    2
}
fn default_backend() -> String {
    "kvm".to_string()
}
fn default_max_cpu_cores() -> f64 {
    64.0
}
fn default_max_memory_gb() -> f64 {
    256.0
}
fn default_max_storage_gb() -> f64 {
    4096.0
}
fn default_overcommit_ratio() -> f64 {
    1.0
}
fn default_metrics_interval_secs() -> u64 {
    15
}
fn default_health_check_interval_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_db_driver() -> String {
    "sqlite".to_string()
}
fn default_db_url() -> String {
    "sqlite://vmux.db".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_connection_timeout_secs() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut config = Config::default();
        // Default export dirs are relative (`exports/output`, `exports/tmp`);
        // point them at a scratch dir so validating doesn't litter the repo.
        let scratch = std::env::temp_dir().join(format!("vmux-test-config-{}", uuid::Uuid::new_v4()));
        config.export.output_dir = scratch.join("output");
        config.export.temp_dir = scratch.join("tmp");
        config.validate().expect("default config must validate");
        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[test]
    fn rejects_unwritable_export_dir() {
        let mut config = Config::default();
        let scratch = std::env::temp_dir().join(format!("vmux-test-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&scratch).unwrap();
        // A regular file can't be `create_dir_all`'d into, so pointing an
        // export dir at one must fail validation rather than panic.
        let blocked = scratch.join("blocked");
        std::fs::write(&blocked, b"not a directory").unwrap();
        config.export.output_dir = blocked.join("output");
        config.export.temp_dir = scratch.join("tmp");
        assert!(config.validate().is_err());
        let _ = std::fs::remove_dir_all(&scratch);
    }

    #[test]
    fn rejects_bad_libvirt_uri() {
        let mut config = Config::default();
        config.libvirt.uri = "ssh://somewhere".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_export_format() {
        let mut config = Config::default();
        config.export.allowed_formats = vec!["zip".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_splits_on_double_underscore() {
        std::env::set_var("VMUX_SERVER__PORT", "9999");
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed("VMUX_").split("__"));
        let config: Config = figment.extract().expect("extract");
        assert_eq!(config.server.port, 9999);
        std::env::remove_var("VMUX_SERVER__PORT");
    }
}
