//! Tenant routing endpoint.

use axum::{extract::State, Json};

use super::{success, ApiResult};
use crate::auth::Tenant;
use crate::errors::AppError;
use crate::models::{TenantRoute, UpdateTenantRouteRequest};
use crate::AppState;

/// PUT /api/tenant - Register the slug and custom domain used by `/render`.
pub async fn update_tenant_route(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(request): Json<UpdateTenantRouteRequest>,
) -> ApiResult<TenantRoute> {
    if request.slug.trim().is_empty() {
        return Err(AppError::Validation("Slug is required".to_string()));
    }

    success(state.repo.upsert_tenant_route(&tenant, &request).await?)
}
