//! Instance API endpoints.

use axum::{
    extract::{Path, State},
    Json,
};

use super::{success, ApiResult};
use crate::auth::Tenant;
use crate::errors::AppError;
use crate::models::{
    CreateInstanceRequest, RepinRequest, TemplateInstance, UpdateBindingsRequest,
    UpdateThemeRequest,
};
use crate::AppState;

/// GET /api/instances - Instances owned by the caller.
pub async fn list_instances(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> ApiResult<Vec<TemplateInstance>> {
    success(state.repo.list_instances(&tenant).await?)
}

/// GET /api/instances/:id - Get a single instance.
pub async fn get_instance(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> ApiResult<TemplateInstance> {
    success(state.repo.get_instance(&tenant, &id).await?)
}

/// POST /api/instances - Create an instance pinned to the template's current version.
pub async fn create_instance(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(request): Json<CreateInstanceRequest>,
) -> ApiResult<TemplateInstance> {
    if request.name.trim().is_empty() {
        return Err(AppError::Validation("Name is required".to_string()));
    }
    if request.template_id.trim().is_empty() {
        return Err(AppError::Validation("templateId is required".to_string()));
    }

    success(state.repo.create_instance(&tenant, &request).await?)
}

/// PUT /api/instances/:id/bindings - Replace all content bindings.
pub async fn update_bindings(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    Json(request): Json<UpdateBindingsRequest>,
) -> ApiResult<TemplateInstance> {
    success(state.repo.update_bindings(&tenant, &id, &request).await?)
}

/// PUT /api/instances/:id/theme - Replace theme overrides and custom CSS.
pub async fn update_theme(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    Json(request): Json<UpdateThemeRequest>,
) -> ApiResult<TemplateInstance> {
    success(state.repo.update_theme(&tenant, &id, &request).await?)
}

/// POST /api/instances/:id/repin - Move the instance to another template version.
pub async fn repin_instance(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    Json(request): Json<RepinRequest>,
) -> ApiResult<TemplateInstance> {
    success(state.repo.repin_instance(&tenant, &id, &request).await?)
}
