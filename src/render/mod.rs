//! Public lookup of the live artifact for `(tenant key, platform, path)`.
//!
//! Nothing is rebuilt here: the stored `resolvedJson` of the live deployment
//! is returned exactly as it was written.

use crate::db::{Repository, TenantDirectory};
use crate::errors::AppError;
use crate::models::Platform;

/// Returns the live artifact, or `None` for any unknown part of the address.
pub async fn resolve(
    tenants: &dyn TenantDirectory,
    repo: &Repository,
    tenant_key: &str,
    platform: &str,
    path: &str,
) -> Result<Option<String>, AppError> {
    let Some(platform) = Platform::from_str(platform) else {
        return Ok(None);
    };
    let Some(tenant) = tenants.resolve_tenant(tenant_key).await? else {
        tracing::debug!(tenant_key, "Render lookup for unknown tenant");
        return Ok(None);
    };

    let slug = normalize_path(path);
    if slug.is_empty() {
        return Ok(None);
    }

    repo.find_live_artifact(&tenant, &slug, platform).await
}

/// `"/Spring-Sale/"` -> `"spring-sale"`.
fn normalize_path(path: &str) -> String {
    path.trim().trim_matches('/').to_ascii_lowercase()
}
