//! HTTP + WebSocket route table.
//!
//! Routes are grouped by the permission they require (read/create/update/
//! delete/start/stop/export) rather than by resource, each group getting
//! its own [`require_permission`] wrapper via `route_layer`, then merged
//! under a single `require_auth` gate and nested at `/api/v1`. `/vms/*`
//! and `/compute/instances/*` share handlers — the former pins the
//! backend to KVM, the latter takes it from the request.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{middleware as axum_middleware, Json, Router};
use uuid::Uuid;

use crate::api::{
    CreateInstanceRequest, CreateNetworkRequest, CreatePoolRequest, CreateVolumeRequest, ExportJobResponse,
    ExportListResponse, ExportRequest, HealthCheckResult, HealthResponse, InstanceListResponse, InstanceResponse,
    ListInstancesQuery, LoginRequest, LoginResponse, NetworkListResponse, PoolListResponse, RefreshRequest,
    VolumeListResponse,
};
use crate::backend::CreateRequest;
use crate::error::{Error, Result};
use crate::libvirt::network::DhcpRange;
use crate::middleware::require_auth;
use crate::model::BackendKind;
use crate::responses::{Accepted, Created, NoContent};
use crate::state::AppState;

/// Builds the full router and attaches `state`.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics));

    let read_only = Router::new()
        .route("/vms", get(instances::list_vms))
        .route("/vms/{name}", get(instances::get_vm))
        .route("/exports", get(exports::list_exports))
        .route("/exports/{id}", get(exports::get_export))
        .route("/storage/pools", get(storage::list_pools))
        .route("/storage/pools/{name}", get(storage::get_pool))
        .route("/storage/pools/{pool}/volumes", get(storage::list_volumes))
        .route("/networks", get(networks::list_networks))
        .route("/networks/{name}", get(networks::get_network))
        .route("/compute/instances", get(instances::list_instances))
        .route("/compute/instances/{name}", get(instances::get_instance))
        .route_layer(axum_middleware::from_fn(permissions::require_read));

    let create_only = Router::new()
        .route("/vms", post(instances::create_vm))
        .route("/storage/pools", post(storage::create_pool))
        .route("/storage/pools/{pool}/volumes", post(storage::create_volume))
        .route("/networks", post(networks::create_network))
        .route("/compute/instances", post(instances::create_instance))
        .route_layer(axum_middleware::from_fn(permissions::require_create));

    let delete_only = Router::new()
        .route("/vms/{name}", delete(instances::delete_vm))
        .route("/exports/{id}", delete(exports::cancel_export))
        .route("/storage/pools/{name}", delete(storage::delete_pool))
        .route("/storage/pools/{pool}/volumes/{name}", delete(storage::delete_volume))
        .route("/networks/{name}", delete(networks::delete_network))
        .route("/compute/instances/{name}", delete(instances::delete_instance))
        .route_layer(axum_middleware::from_fn(permissions::require_delete));

    let start_only = Router::new()
        .route("/vms/{name}/start", put(instances::start_vm))
        .route("/storage/pools/{name}/start", put(storage::start_pool))
        .route("/networks/{name}/start", put(networks::start_network))
        .route("/compute/instances/{name}/start", put(instances::start_instance))
        .route_layer(axum_middleware::from_fn(permissions::require_start));

    let stop_only = Router::new()
        .route("/vms/{name}/stop", put(instances::stop_vm))
        .route("/storage/pools/{name}/stop", put(storage::stop_pool))
        .route("/networks/{name}/stop", put(networks::stop_network))
        .route("/compute/instances/{name}/stop", put(instances::stop_instance))
        .route("/compute/instances/{name}/restart", put(instances::restart_instance))
        .route_layer(axum_middleware::from_fn(permissions::require_stop));

    let export_only = Router::new()
        .route("/vms/{name}/export", post(exports::submit_export))
        .route_layer(axum_middleware::from_fn(permissions::require_export));

    // The console upgrade is feature-gated; monitor is always on.
    let mut ws_routes = Router::new().route("/ws/vms/{name}", get(ws::monitor));
    if state.config.features.websocket_console {
        ws_routes = ws_routes.route("/ws/vms/{name}/console", get(ws::console));
    }

    let authenticated = read_only
        .merge(create_only)
        .merge(delete_only)
        .merge(start_only)
        .merge(stop_only)
        .merge(export_only)
        .merge(ws_routes);

    let api_v1 = public
        .merge(authenticated)
        .layer(axum_middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new().nest("/api/v1", api_v1).with_state(state)
}

/// One-liner wrappers around [`require_permission`], since `route_layer`
/// needs a bare `fn(Request, Next) -> _`, not a closure capturing the
/// permission string.
mod permissions {
    use axum::extract::Request;
    use axum::middleware::Next;
    use axum::response::Response;

    use crate::middleware::require_permission;

    pub async fn require_read(req: Request, next: Next) -> Response {
        require_permission("read", req, next).await
    }
    pub async fn require_create(req: Request, next: Next) -> Response {
        require_permission("create", req, next).await
    }
    pub async fn require_delete(req: Request, next: Next) -> Response {
        require_permission("delete", req, next).await
    }
    pub async fn require_start(req: Request, next: Next) -> Response {
        require_permission("start", req, next).await
    }
    pub async fn require_stop(req: Request, next: Next) -> Response {
        require_permission("stop", req, next).await
    }
    pub async fn require_export(req: Request, next: Next) -> Response {
        require_permission("export", req, next).await
    }
}

mod auth {
    use super::*;

    pub async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Result<Json<LoginResponse>> {
        let user = state
            .users
            .find_by_username(&body.username)
            .await?
            .filter(|u| u.active)
            .ok_or_else(|| Error::Unauthorized("invalid username or password".into()))?;

        let valid = state.password_hasher.verify(&body.password, &user.password_hash)?;
        if !valid {
            return Err(Error::Unauthorized("invalid username or password".into()));
        }

        let (token, claims) = state.jwt_issuer.issue(&user)?;
        Ok(Json(LoginResponse { token, expires_at: claims.exp, user_id: user.id, roles: user.roles }))
    }

    /// Unlike every other authenticated route, refresh validates the token
    /// carried in the body, not the `Authorization` header — a caller is
    /// expected to refresh shortly before expiry, while the old token is
    /// still valid. `/auth/refresh` is exempted from the bearer-token gate
    /// for exactly this reason.
    pub async fn refresh(State(state): State<AppState>, Json(body): Json<RefreshRequest>) -> Result<Json<LoginResponse>> {
        let claims = state.jwt_auth.validate_token(&body.token)?;
        let user = state
            .users
            .find_by_id(&claims.sub)
            .await?
            .filter(|u| u.active)
            .ok_or_else(|| Error::Unauthorized("user no longer active".into()))?;

        let (token, new_claims) = state.jwt_issuer.issue(&user)?;
        Ok(Json(LoginResponse { token, expires_at: new_claims.exp, user_id: user.id, roles: user.roles }))
    }
}

mod instances {
    use super::*;

    pub async fn list_vms(State(state): State<AppState>) -> Result<Json<InstanceListResponse>> {
        let instances = state.compute.list(Some(BackendKind::Kvm)).await?;
        Ok(Json(InstanceListResponse { instances }))
    }

    pub async fn create_vm(
        State(state): State<AppState>,
        Json(body): Json<CreateInstanceRequest>,
    ) -> Result<Created<InstanceResponse>> {
        create(state, body, Some(BackendKind::Kvm)).await
    }

    pub async fn get_vm(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<InstanceResponse>> {
        let instance = state.compute.get(&name, Some(BackendKind::Kvm)).await?;
        Ok(Json(instance.into()))
    }

    pub async fn delete_vm(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.compute.delete(&name, Some(BackendKind::Kvm)).await?;
        Ok(NoContent)
    }

    pub async fn start_vm(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.compute.start(&name, Some(BackendKind::Kvm)).await?;
        Ok(NoContent)
    }

    pub async fn stop_vm(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.compute.stop(&name, Some(BackendKind::Kvm)).await?;
        Ok(NoContent)
    }

    pub async fn list_instances(
        State(state): State<AppState>,
        Query(query): Query<ListInstancesQuery>,
    ) -> Result<Json<InstanceListResponse>> {
        let instances = state.compute.list(query.backend).await?;
        Ok(Json(InstanceListResponse { instances }))
    }

    pub async fn create_instance(
        State(state): State<AppState>,
        Json(body): Json<CreateInstanceRequest>,
    ) -> Result<Created<InstanceResponse>> {
        let backend = body.backend;
        create(state, body, backend).await
    }

    pub async fn get_instance(
        State(state): State<AppState>,
        Path(name): Path<String>,
        Query(query): Query<ListInstancesQuery>,
    ) -> Result<Json<InstanceResponse>> {
        let instance = state.compute.get(&name, query.backend).await?;
        Ok(Json(instance.into()))
    }

    pub async fn delete_instance(
        State(state): State<AppState>,
        Path(name): Path<String>,
        Query(query): Query<ListInstancesQuery>,
    ) -> Result<NoContent> {
        state.compute.delete(&name, query.backend).await?;
        Ok(NoContent)
    }

    pub async fn start_instance(
        State(state): State<AppState>,
        Path(name): Path<String>,
        Query(query): Query<ListInstancesQuery>,
    ) -> Result<NoContent> {
        state.compute.start(&name, query.backend).await?;
        Ok(NoContent)
    }

    pub async fn stop_instance(
        State(state): State<AppState>,
        Path(name): Path<String>,
        Query(query): Query<ListInstancesQuery>,
    ) -> Result<NoContent> {
        state.compute.stop(&name, query.backend).await?;
        Ok(NoContent)
    }

    pub async fn restart_instance(
        State(state): State<AppState>,
        Path(name): Path<String>,
        Query(query): Query<ListInstancesQuery>,
    ) -> Result<NoContent> {
        state.compute.restart(&name, query.backend).await?;
        Ok(NoContent)
    }

    async fn create(state: AppState, body: CreateInstanceRequest, backend: Option<BackendKind>) -> Result<Created<InstanceResponse>> {
        let request = CreateRequest {
            name: body.name,
            config: body.config,
            resources: body.resources.into(),
            auto_start: body.auto_start,
            ssh_authorized_keys: body.ssh_authorized_keys,
        };
        let instance = state.compute.create(request, backend).await?;
        let location = format!("/api/v1/compute/instances/{}", instance.name);
        Ok(Created::new(instance.into()).with_location(location))
    }
}

mod exports {
    use super::*;
    use crate::export::ExportOptions;

    pub async fn submit_export(
        State(state): State<AppState>,
        Path(name): Path<String>,
        Json(body): Json<ExportRequest>,
    ) -> Result<Accepted> {
        let options = ExportOptions { allow_running: body.allow_running };
        let job_id = state.export.submit(&name, body.format, options).await?;
        Ok(Accepted::new()
            .with_message(format!("export job {job_id} submitted for '{name}'"))
            .with_status_url(format!("/api/v1/exports/{job_id}")))
    }

    pub async fn list_exports(State(state): State<AppState>) -> Json<ExportListResponse> {
        Json(ExportListResponse { jobs: state.export.list() })
    }

    pub async fn get_export(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<ExportJobResponse>> {
        let job = state.export.get(id)?;
        Ok(Json(job.into()))
    }

    pub async fn cancel_export(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<NoContent> {
        state.export.cancel(id)?;
        Ok(NoContent)
    }
}

mod storage {
    use super::*;

    pub async fn list_pools(State(state): State<AppState>) -> Result<Json<PoolListResponse>> {
        let pools = state.storage.list_pools().await?;
        Ok(Json(PoolListResponse { pools }))
    }

    pub async fn create_pool(
        State(state): State<AppState>,
        Json(body): Json<CreatePoolRequest>,
    ) -> Result<Created<crate::model::StoragePool>> {
        let pool = state.storage.ensure_pool(&body.name, &body.path).await?;
        Ok(Created::new(pool).with_location(format!("/api/v1/storage/pools/{}", body.name)))
    }

    pub async fn get_pool(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<crate::model::StoragePool>> {
        let pools = state.storage.list_pools().await?;
        let pool = pools.into_iter().find(|p| p.name == name).ok_or_else(|| Error::NotFound(format!("pool '{name}' not found")))?;
        Ok(Json(pool))
    }

    pub async fn delete_pool(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.storage.delete_pool(&name).await?;
        Ok(NoContent)
    }

    pub async fn start_pool(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.storage.start_pool(&name).await?;
        Ok(NoContent)
    }

    pub async fn stop_pool(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.storage.stop_pool(&name).await?;
        Ok(NoContent)
    }

    pub async fn list_volumes(State(state): State<AppState>, Path(pool): Path<String>) -> Result<Json<VolumeListResponse>> {
        let volumes = state.storage.list_volumes(&pool).await?;
        Ok(Json(VolumeListResponse { volumes }))
    }

    pub async fn create_volume(
        State(state): State<AppState>,
        Path(pool): Path<String>,
        Json(body): Json<CreateVolumeRequest>,
    ) -> Result<Created<crate::model::StorageVolume>> {
        let volume = state.storage.create(&pool, &body.name, body.capacity_bytes, &body.format).await?;
        Ok(Created::new(volume).with_location(format!("/api/v1/storage/pools/{pool}/volumes/{}", body.name)))
    }

    pub async fn delete_volume(State(state): State<AppState>, Path((pool, name)): Path<(String, String)>) -> Result<NoContent> {
        state.storage.delete(&pool, &name).await?;
        Ok(NoContent)
    }
}

mod networks {
    use super::*;

    pub async fn list_networks(State(state): State<AppState>) -> Result<Json<NetworkListResponse>> {
        let networks = state.network.list().await?;
        Ok(Json(NetworkListResponse { networks }))
    }

    pub async fn get_network(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<crate::model::Network>> {
        let networks = state.network.list().await?;
        let network = networks.into_iter().find(|n| n.name == name).ok_or_else(|| Error::NotFound(format!("network '{name}' not found")))?;
        Ok(Json(network))
    }

    pub async fn create_network(State(state): State<AppState>, Json(body): Json<CreateNetworkRequest>) -> Result<Created<()>> {
        match &body.bridge_name {
            Some(bridge) => state.network.define_bridge(&body.name, bridge).await?,
            None => {
                let dhcp = body.dhcp_range.as_ref().map(|d| DhcpRange {
                    gateway: d.gateway.clone(),
                    netmask: d.netmask.clone(),
                    start: d.start.clone(),
                    end: d.end.clone(),
                });
                state.network.define(&body.name, &body.forward_mode, dhcp.as_ref()).await?;
            }
        }
        Ok(Created::new(()).with_location(format!("/api/v1/networks/{}", body.name)))
    }

    pub async fn delete_network(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.network.delete(&name).await?;
        Ok(NoContent)
    }

    pub async fn start_network(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.network.start(&name).await?;
        Ok(NoContent)
    }

    pub async fn stop_network(State(state): State<AppState>, Path(name): Path<String>) -> Result<NoContent> {
        state.network.stop(&name).await?;
        Ok(NoContent)
    }
}

mod health {
    use super::*;

    pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
        let checks = state.metrics.run_health_checks().await;
        let status = if checks.iter().all(|c| c.healthy) { "healthy" } else { "unhealthy" };
        Json(HealthResponse {
            status,
            checks: checks.into_iter().map(|c| HealthCheckResult { name: c.name, healthy: c.healthy, detail: c.detail }).collect(),
        })
    }

    pub async fn metrics(State(state): State<AppState>) -> String {
        state.metrics.render_scrape().await
    }
}

mod ws {
    use super::*;

    pub async fn monitor(ws: WebSocketUpgrade, State(state): State<AppState>, Path(name): Path<String>) -> axum::response::Response {
        ws.on_upgrade(move |socket| async move { state.hub.handle_socket(socket, name, false, None).await })
    }

    pub async fn console(ws: WebSocketUpgrade, State(state): State<AppState>, Path(name): Path<String>) -> axum::response::Response {
        ws.on_upgrade(move |socket| async move { state.hub.handle_socket(socket, name, true, None).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vms_and_compute_instances_share_handlers_but_not_the_pinned_backend() {
        // `/vms` always targets KVM; `/compute/instances` takes the backend
        // from the request. Both paths funnel through `instances::create`.
        assert_eq!(BackendKind::Kvm.to_string(), "kvm");
    }
}
