//! Deployment API endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};

use super::{success, ApiResult};
use crate::auth::Tenant;
use crate::models::{CreateDeploymentRequest, Deployment, DeploymentListQuery, DeploymentLog};
use crate::AppState;

/// POST /api/instances/:id/deployments - Build and promote a deployment.
///
/// Responds with the live deployment, or `BUILD_FAILED` carrying the
/// failed deployment's id.
pub async fn create_deployment(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(instance_id): Path<String>,
    Json(request): Json<CreateDeploymentRequest>,
) -> ApiResult<Deployment> {
    let deployment = state
        .orchestrator
        .create_deployment(&tenant, &instance_id, &request.platform)
        .await?;
    success(deployment)
}

/// GET /api/instances/:id/deployments - Deployment history, optionally per platform.
pub async fn list_deployments(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(instance_id): Path<String>,
    Query(query): Query<DeploymentListQuery>,
) -> ApiResult<Vec<Deployment>> {
    let deployments = state
        .orchestrator
        .list_deployments(&tenant, &instance_id, query.platform.as_deref())
        .await?;
    success(deployments)
}

/// GET /api/deployments/:id - Get a single deployment.
pub async fn get_deployment(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> ApiResult<Deployment> {
    success(state.repo.get_deployment(&tenant, &id).await?)
}

/// POST /api/deployments/:id/rollback - Re-promote a previous build.
pub async fn rollback_deployment(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> ApiResult<Deployment> {
    success(state.orchestrator.rollback(&tenant, &id).await?)
}

/// GET /api/deployments/:id/logs - Log lines in the order they were written.
pub async fn list_deployment_logs(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> ApiResult<Vec<DeploymentLog>> {
    success(state.repo.list_logs(&tenant, &id).await?)
}
