//! Minimal admin/core-ops HTTP surface: the staging, replication, and
//! lifecycle operations this crate implements directly. CRUD for users,
//! folders, external registries, and OIDC config is an external collaborator
//! (§1 "Out of scope") — this surface only exposes the operations C7/C8/C9
//! themselves own.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::auth::{MethodClass, PolicyResolver};
use crate::lifecycle::LifecycleController;
use crate::model::{AuditEvent, GCState, JobOverrides, StagingJob, SyncJob};
use crate::replication::ReplicationEngine;
use crate::staging::{parse_job_id, PushTarget, StagingEngine};
use crate::store::registries::RegistryStore;
use crate::{Error, Result};

pub struct AppState {
    pub resolver: Arc<PolicyResolver>,
    pub staging: Arc<StagingEngine>,
    pub replication: Arc<ReplicationEngine>,
    pub registries: Arc<RegistryStore>,
    pub lifecycle: Arc<LifecycleController>,
    pub audit: Arc<AuditSink>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/staging/pull", post(pull))
        .route("/api/staging/push", post(push))
        .route("/api/staging/jobs", get(list_jobs))
        .route("/api/staging/jobs/{job_id}", get(get_job).delete(delete_job))
        .route("/api/staging/orphans", get(list_orphans))
        .route("/api/staging/orphans/purge", post(purge_orphans))
        .route("/api/sync", post(start_sync).get(list_sync))
        .route("/api/sync/{id}", get(get_sync))
        .route("/api/gc", post(start_gc).get(get_gc))
        .route("/api/ghosts", get(list_ghosts))
        .route("/api/ghosts/{name}/purge", post(purge_ghost))
        .route("/api/audit", get(recent_audit))
        .with_state(state)
}

async fn require_admin(resolver: &PolicyResolver, headers: &HeaderMap) -> Result<String> {
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let principal = resolver.resolve_principal(authorization).await?;
    if !principal.is_admin() {
        return Err(Error::Forbidden("this operation is admin-only".to_string()));
    }
    Ok(principal.username().to_string())
}

async fn start_gc(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<GCState>> {
    require_admin(&state.resolver, &headers).await?;
    state.lifecycle.run_gc().await?;
    Ok(Json(state.lifecycle.state().await))
}

async fn get_gc(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<GCState>> {
    require_admin(&state.resolver, &headers).await?;
    Ok(Json(state.lifecycle.state().await))
}

async fn list_ghosts(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<Vec<String>>> {
    require_admin(&state.resolver, &headers).await?;
    Ok(Json(state.lifecycle.list_ghost_repositories().await?))
}

async fn purge_ghost(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<()> {
    require_admin(&state.resolver, &headers).await?;
    state.lifecycle.purge_ghost(&name).await
}

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

fn default_audit_limit() -> usize {
    100
}

async fn recent_audit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>> {
    require_admin(&state.resolver, &headers).await?;
    Ok(Json(state.audit.recent(query.limit).await?))
}

async fn principal_username(
    resolver: &PolicyResolver,
    resolver_authorize: Option<(&str, MethodClass)>,
    headers: &HeaderMap,
) -> Result<String> {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let principal = resolver.resolve_principal(authorization).await?;
    if let Some((path, class)) = resolver_authorize {
        resolver.authorize(&principal, path, class).await?;
    }
    Ok(principal.username().to_string())
}

#[derive(Deserialize)]
struct PullRequest {
    image: String,
    tag: String,
    #[serde(default)]
    vuln_scan_enabled: Option<bool>,
    #[serde(default)]
    vuln_severities: Option<Vec<String>>,
}

#[derive(Serialize)]
struct JobIdResponse {
    job_id: Uuid,
}

async fn pull(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PullRequest>,
) -> Result<Json<JobIdResponse>> {
    principal_username(&state.resolver, Some((&req.image, MethodClass::Pull)), &headers).await?;
    let overrides = JobOverrides {
        vuln_scan_enabled: req.vuln_scan_enabled,
        vuln_severities: req.vuln_severities,
    };
    let job_id = state.staging.pull(req.image, req.tag, overrides).await;
    Ok(Json(JobIdResponse { job_id }))
}

#[derive(Deserialize)]
struct PushRequest {
    job_id: String,
    #[serde(default)]
    target_image: Option<String>,
    #[serde(default)]
    target_tag: Option<String>,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    external_registry_id: Option<Uuid>,
}

async fn push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PushRequest>,
) -> Result<Json<serde_json::Value>> {
    let job_id = parse_job_id(&req.job_id)?;
    let job = state.staging.get(job_id).await?;
    let target_image = req.target_image.clone().unwrap_or_else(|| job.image.clone());
    let authorize_path = match &req.folder {
        Some(folder) => format!("{folder}/{target_image}"),
        None => target_image.clone(),
    };
    principal_username(&state.resolver, Some((&authorize_path, MethodClass::Push)), &headers).await?;

    let (external_host, external_creds) = match req.external_registry_id {
        Some(id) => {
            let registry = state
                .registries
                .get(id)
                .await
                .ok_or_else(|| Error::NotFound(format!("external registry {id}")))?;
            let creds = match (&registry.username, &registry.password) {
                (Some(u), Some(p)) => Some((u.clone(), p.clone())),
                _ => None,
            };
            (Some(registry.host), creds)
        }
        None => (None, None),
    };

    state
        .staging
        .push(
            job_id,
            PushTarget {
                target_image: req.target_image,
                target_tag: req.target_tag,
                folder: req.folder,
                external_host,
                external_creds,
            },
        )
        .await?;
    Ok(Json(serde_json::json!({ "job_id": job_id, "status": "pushing" })))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Json<Vec<StagingJob>> {
    Json(state.staging.list().await)
}

async fn get_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Result<Json<StagingJob>> {
    let job_id = parse_job_id(&job_id)?;
    Ok(Json(state.staging.get(job_id).await?))
}

async fn delete_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<()> {
    require_admin(&state.resolver, &headers).await?;
    let job_id = parse_job_id(&job_id)?;
    state.staging.delete(job_id).await
}

#[derive(Serialize)]
struct OrphanEntry {
    name: String,
    size_bytes: u64,
}

async fn list_orphans(State(state): State<Arc<AppState>>) -> Result<Json<Vec<OrphanEntry>>> {
    let orphans = state.staging.list_orphans().await?;
    Ok(Json(
        orphans
            .into_iter()
            .map(|(name, size_bytes)| OrphanEntry { name, size_bytes })
            .collect(),
    ))
}

async fn purge_orphans(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let freed = state.staging.purge_orphans().await?;
    Ok(Json(serde_json::json!({ "freed_bytes": freed })))
}

#[derive(Deserialize)]
struct SyncRequest {
    source: String,
    dest_registry_id: Uuid,
    #[serde(default)]
    dest_folder: Option<String>,
}

async fn start_sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SyncRequest>,
) -> Result<Json<JobIdResponse>> {
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let principal = state.resolver.resolve_principal(authorization).await?;
    if !principal.is_admin() {
        return Err(Error::Forbidden("replication is admin-only".to_string()));
    }
    let destination = state
        .registries
        .get(req.dest_registry_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("external registry {}", req.dest_registry_id)))?;
    let job_id = state.replication.start(req.source, destination, req.dest_folder).await?;
    Ok(Json(JobIdResponse { job_id }))
}

async fn list_sync(State(state): State<Arc<AppState>>) -> Json<Vec<SyncJob>> {
    Json(state.replication.list().await)
}

async fn get_sync(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<Json<SyncJob>> {
    Ok(Json(state.replication.get(id).await?))
}
