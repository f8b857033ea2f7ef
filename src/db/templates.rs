//! Template store: templates and their append-only version history.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::repository::{
    decode_enum, decode_json, encode, is_retryable, slug_candidate, slugify, Repository,
    MAX_ALLOCATION_ATTEMPTS, MAX_SLUG_ATTEMPTS,
};
use crate::errors::{is_unique_violation, AppError};
use crate::models::{
    CreateTemplateRequest, CreatedTemplate, PublishVersionRequest, ScreenDocument, Template,
    TemplateStatus, TemplateVersion,
};

const TEMPLATE_COLUMNS: &str = "id, creator_id, name, slug, category, status, is_starter, \
    current_version_id, created_at, updated_at";

const VERSION_COLUMNS: &str = "id, template_id, version, screen_json, theme_json, \
    component_versions, changelog, created_at";

impl Repository {
    // ==================== TEMPLATE OPERATIONS ====================

    /// List templates visible to the tenant: its own plus shared starters.
    pub async fn list_templates(&self, tenant: &str) -> Result<Vec<Template>, AppError> {
        let query = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM templates \
             WHERE creator_id = ? OR is_starter = 1 ORDER BY name, id"
        );
        let rows = sqlx::query(&query)
            .bind(tenant)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(template_from_row).collect()
    }

    /// Get a template visible to the tenant.
    pub async fn get_template(&self, tenant: &str, id: &str) -> Result<Template, AppError> {
        match self.fetch_template(id).await? {
            Some(template) if template.is_visible_to(tenant) => Ok(template),
            _ => Err(AppError::NotFound(format!("Template {} not found", id))),
        }
    }

    pub(crate) async fn fetch_template(&self, id: &str) -> Result<Option<Template>, AppError> {
        let query = format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(template_from_row).transpose()
    }

    /// Create a template, optionally with version 1 in the same transaction.
    ///
    /// Slug collisions within the tenant are resolved by suffixing a short
    /// random token; the call does not fail because of them.
    pub async fn create_template(
        &self,
        tenant: &str,
        request: &CreateTemplateRequest,
    ) -> Result<CreatedTemplate, AppError> {
        let base = slugify(&request.name);

        for attempt in 0..MAX_SLUG_ATTEMPTS {
            let slug = slug_candidate(&base, attempt);
            match self.insert_template(tenant, &slug, request).await {
                Ok(created) => return Ok(created),
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(tenant, slug = %slug, "Template slug taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::conflict(format!(
            "Could not allocate a unique slug for '{}'",
            request.name
        )))
    }

    async fn insert_template(
        &self,
        tenant: &str,
        slug: &str,
        request: &CreateTemplateRequest,
    ) -> Result<CreatedTemplate, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let version = request.initial_screen_json.as_ref().map(|screen| TemplateVersion {
            id: uuid::Uuid::new_v4().to_string(),
            template_id: id.clone(),
            version: 1,
            screen_json: screen.clone(),
            theme_json: request.initial_theme_json.clone().unwrap_or_default(),
            component_versions: request.component_versions.clone().unwrap_or_default(),
            changelog: request.changelog.clone(),
            created_at: now.clone(),
        });
        let status = if version.is_some() {
            TemplateStatus::Published
        } else {
            TemplateStatus::Draft
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO templates (id, creator_id, name, slug, category, status, is_starter, current_version_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        )
        .bind(&id)
        .bind(tenant)
        .bind(&request.name)
        .bind(slug)
        .bind(&request.category)
        .bind(status.as_str())
        .bind(request.is_starter as i32)
        .bind(version.as_ref().map(|v| v.id.clone()))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        if let Some(version) = &version {
            sqlx::query(
                "INSERT INTO template_versions (id, template_id, version, screen_json, theme_json, component_versions, changelog, created_at) VALUES (?, ?, 1, ?, ?, ?, ?, ?)"
            )
            .bind(&version.id)
            .bind(&id)
            .bind(encode(&version.screen_json))
            .bind(encode(&version.theme_json))
            .bind(encode(&version.component_versions))
            .bind(&version.changelog)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            template_id = %id,
            tenant,
            slug,
            with_version = version.is_some(),
            "Template created"
        );

        Ok(CreatedTemplate {
            template: Template {
                id,
                creator_id: tenant.to_string(),
                name: request.name.clone(),
                slug: slug.to_string(),
                category: request.category.clone(),
                status,
                is_starter: request.is_starter,
                current_version_id: version.as_ref().map(|v| v.id.clone()),
                created_at: now.clone(),
                updated_at: now,
            },
            version,
        })
    }

    /// Append a new immutable version and make it current.
    ///
    /// The next number is computed and inserted in a single statement; a lost
    /// race surfaces as a uniqueness violation and is retried with a fresh number.
    pub async fn publish_version(
        &self,
        tenant: &str,
        template_id: &str,
        request: &PublishVersionRequest,
    ) -> Result<TemplateVersion, AppError> {
        // Starters are readable by everyone but only their owner may publish.
        let template = match self.fetch_template(template_id).await? {
            Some(template) if template.creator_id == tenant => template,
            _ => {
                return Err(AppError::NotFound(format!(
                    "Template {} not found",
                    template_id
                )))
            }
        };
        if template.status == TemplateStatus::Archived {
            return Err(AppError::Validation(format!(
                "Template {} is archived",
                template_id
            )));
        }

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            match self.try_insert_version(template_id, request).await {
                Ok(version) => {
                    tracing::info!(
                        template_id,
                        version = version.version,
                        "Template version published"
                    );
                    return Ok(version);
                }
                Err(e) if is_retryable(&e) => {
                    tracing::warn!(template_id, attempt, error = %e, "Version allocation raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::conflict(format!(
            "Could not allocate a version number for template {}",
            template_id
        )))
    }

    async fn try_insert_version(
        &self,
        template_id: &str,
        request: &PublishVersionRequest,
    ) -> Result<TemplateVersion, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let component_versions = request.component_versions.clone().unwrap_or_default();

        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before reading MAX.
        let row = sqlx::query(
            r#"INSERT INTO template_versions (
                id, template_id, version, screen_json, theme_json,
                component_versions, changelog, created_at
            )
            SELECT ?, ?, COALESCE(MAX(version), 0) + 1, ?, ?, ?, ?, ?
            FROM template_versions WHERE template_id = ?
            RETURNING version"#,
        )
        .bind(&id)
        .bind(template_id)
        .bind(encode(&request.screen_json))
        .bind(encode(&request.theme_json))
        .bind(encode(&component_versions))
        .bind(&request.changelog)
        .bind(&now)
        .bind(template_id)
        .fetch_one(&mut *tx)
        .await?;
        let version: i64 = row.get("version");

        sqlx::query(
            r#"UPDATE templates SET
                current_version_id = ?,
                status = CASE WHEN status = 'draft' THEN 'published' ELSE status END,
                updated_at = ?
            WHERE id = ?"#,
        )
        .bind(&id)
        .bind(&now)
        .bind(template_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TemplateVersion {
            id,
            template_id: template_id.to_string(),
            version,
            screen_json: request.screen_json.clone(),
            theme_json: request.theme_json.clone(),
            component_versions,
            changelog: request.changelog.clone(),
            created_at: now,
        })
    }

    /// Flip a template to `archived`. Instances keep their pinned versions.
    pub async fn archive_template(&self, tenant: &str, id: &str) -> Result<Template, AppError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE templates SET status = 'archived', updated_at = ? WHERE id = ? AND creator_id = ?",
        )
        .bind(&now)
        .bind(id)
        .bind(tenant)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Template {} not found", id)));
        }

        tracing::info!(template_id = id, tenant, "Template archived");
        self.get_template(tenant, id).await
    }

    // ==================== VERSION OPERATIONS ====================

    /// List all versions of a visible template, oldest first.
    pub async fn list_versions(
        &self,
        tenant: &str,
        template_id: &str,
    ) -> Result<Vec<TemplateVersion>, AppError> {
        self.get_template(tenant, template_id).await?;

        let query = format!(
            "SELECT {VERSION_COLUMNS} FROM template_versions WHERE template_id = ? ORDER BY version"
        );
        let rows = sqlx::query(&query)
            .bind(template_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(version_from_row).collect()
    }

    /// Get one version of a visible template by its number.
    pub async fn get_version(
        &self,
        tenant: &str,
        template_id: &str,
        version: i64,
    ) -> Result<TemplateVersion, AppError> {
        self.get_template(tenant, template_id).await?;
        self.find_version_by_number(template_id, version)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Version {} of template {} not found",
                    version, template_id
                ))
            })
    }

    pub(crate) async fn find_version_by_number(
        &self,
        template_id: &str,
        version: i64,
    ) -> Result<Option<TemplateVersion>, AppError> {
        let query = format!(
            "SELECT {VERSION_COLUMNS} FROM template_versions WHERE template_id = ? AND version = ?"
        );
        let row = sqlx::query(&query)
            .bind(template_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(version_from_row).transpose()
    }

    pub(crate) async fn find_version_by_id(
        &self,
        id: &str,
    ) -> Result<Option<TemplateVersion>, AppError> {
        let query = format!("SELECT {VERSION_COLUMNS} FROM template_versions WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(version_from_row).transpose()
    }
}

// Helper functions for row conversion

fn template_from_row(row: &SqliteRow) -> Result<Template, AppError> {
    let status: String = row.get("status");
    let is_starter: i32 = row.get("is_starter");
    Ok(Template {
        id: row.get("id"),
        creator_id: row.get("creator_id"),
        name: row.get("name"),
        slug: row.get("slug"),
        category: row.get("category"),
        status: decode_enum("status", &status, TemplateStatus::from_str)?,
        is_starter: is_starter != 0,
        current_version_id: row.get("current_version_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn version_from_row(row: &SqliteRow) -> Result<TemplateVersion, AppError> {
    let screen_json: String = row.get("screen_json");
    let theme_json: String = row.get("theme_json");
    let component_versions: String = row.get("component_versions");
    Ok(TemplateVersion {
        id: row.get("id"),
        template_id: row.get("template_id"),
        version: row.get("version"),
        screen_json: decode_json::<ScreenDocument>("screen_json", &screen_json)?,
        theme_json: decode_json::<Map<String, Value>>("theme_json", &theme_json)?,
        component_versions: decode_json::<BTreeMap<String, String>>(
            "component_versions",
            &component_versions,
        )?,
        changelog: row.get("changelog"),
        created_at: row.get("created_at"),
    })
}
