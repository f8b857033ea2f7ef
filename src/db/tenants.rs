//! Tenant routing: which slug or custom domain serves which tenant.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use super::repository::{slugify, Repository};
use crate::errors::{is_unique_violation, AppError};
use crate::models::{TenantRoute, UpdateTenantRouteRequest};

/// Resolves a public lookup key (slug or domain) to a tenant id.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn resolve_tenant(&self, key: &str) -> Result<Option<String>, AppError>;
}

#[async_trait]
impl TenantDirectory for Repository {
    async fn resolve_tenant(&self, key: &str) -> Result<Option<String>, AppError> {
        let key = key.trim().to_ascii_lowercase();
        // A custom domain wins over another tenant's identical slug.
        let row = sqlx::query(
            r#"SELECT id FROM tenants WHERE slug = ? OR domain = ?
            ORDER BY CASE WHEN domain = ? THEN 0 ELSE 1 END LIMIT 1"#,
        )
        .bind(&key)
        .bind(&key)
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get("id")))
    }
}

impl Repository {
    /// Register or replace the caller's public slug and custom domain.
    pub async fn upsert_tenant_route(
        &self,
        tenant: &str,
        request: &UpdateTenantRouteRequest,
    ) -> Result<TenantRoute, AppError> {
        let slug = slugify(&request.slug);
        let domain = request
            .domain
            .as_ref()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty());
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"INSERT INTO tenants (id, slug, domain, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                slug = excluded.slug, domain = excluded.domain, updated_at = excluded.updated_at"#,
        )
        .bind(tenant)
        .bind(&slug)
        .bind(&domain)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(AppError::conflict(
                    "Slug or domain is already registered to another tenant",
                ));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(tenant, slug = %slug, domain = ?domain, "Tenant route updated");

        Ok(TenantRoute {
            id: tenant.to_string(),
            slug,
            domain,
            updated_at: now,
        })
    }
}
