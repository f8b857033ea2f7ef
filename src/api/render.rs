//! Public render endpoint.

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};

use crate::errors::AppError;
use crate::render;
use crate::AppState;

/// GET /render/:tenant/:platform/*path - Serve the live artifact verbatim.
pub async fn render_live(
    State(state): State<AppState>,
    Path((tenant_key, platform, path)): Path<(String, String, String)>,
) -> Result<Response, AppError> {
    let artifact = render::resolve(
        state.tenants.as_ref(),
        &state.repo,
        &tenant_key,
        &platform,
        &path,
    )
    .await?;

    match artifact {
        Some(body) => Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response()),
        None => Err(AppError::NotFound(format!(
            "No live screen at {}/{}/{}",
            tenant_key, platform, path
        ))),
    }
}
