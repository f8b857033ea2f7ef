//! Template API endpoints.

use axum::{
    extract::{Path, State},
    Json,
};

use super::{success, ApiResult};
use crate::auth::Tenant;
use crate::errors::AppError;
use crate::models::{
    CreateTemplateRequest, CreatedTemplate, PublishVersionRequest, Template, TemplateVersion,
};
use crate::AppState;

/// GET /api/templates - Templates owned by the caller plus shared starters.
pub async fn list_templates(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> ApiResult<Vec<Template>> {
    success(state.repo.list_templates(&tenant).await?)
}

/// GET /api/templates/:id - Get a single template.
pub async fn get_template(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> ApiResult<Template> {
    success(state.repo.get_template(&tenant, &id).await?)
}

/// POST /api/templates - Create a template, optionally with version 1.
pub async fn create_template(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(request): Json<CreateTemplateRequest>,
) -> ApiResult<CreatedTemplate> {
    if request.name.trim().is_empty() {
        return Err(AppError::Validation("Name is required".to_string()));
    }
    if request.category.trim().is_empty() {
        return Err(AppError::Validation("Category is required".to_string()));
    }
    if let Some(screen) = &request.initial_screen_json {
        screen.validate().map_err(AppError::Validation)?;
    }

    success(state.repo.create_template(&tenant, &request).await?)
}

/// POST /api/templates/:id/versions - Publish a new immutable version.
pub async fn publish_version(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    Json(request): Json<PublishVersionRequest>,
) -> ApiResult<TemplateVersion> {
    request.screen_json.validate().map_err(AppError::Validation)?;

    success(state.repo.publish_version(&tenant, &id, &request).await?)
}

/// GET /api/templates/:id/versions - All versions, oldest first.
pub async fn list_versions(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> ApiResult<Vec<TemplateVersion>> {
    success(state.repo.list_versions(&tenant, &id).await?)
}

/// GET /api/templates/:id/versions/:version - One version by number.
pub async fn get_version(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((id, version)): Path<(String, i64)>,
) -> ApiResult<TemplateVersion> {
    success(state.repo.get_version(&tenant, &id, version).await?)
}

/// POST /api/templates/:id/archive - Archive a template owned by the caller.
pub async fn archive_template(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> ApiResult<Template> {
    success(state.repo.archive_template(&tenant, &id).await?)
}
