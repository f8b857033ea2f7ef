//! Instance store: a tenant's bindings and overrides over one pinned version.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::repository::{decode_json, encode, slug_candidate, slugify, Repository, MAX_SLUG_ATTEMPTS};
use crate::errors::{is_unique_violation, AppError};
use crate::models::{
    validate_bindings, validate_section_overrides, ContentBinding, CreateInstanceRequest,
    RepinRequest, TemplateInstance, TemplateStatus, TemplateVersion, UpdateBindingsRequest,
    UpdateThemeRequest,
};

const INSTANCE_COLUMNS: &str = "id, creator_id, template_id, template_version_id, name, slug, \
    content_bindings, theme_overrides, section_overrides, custom_css, created_at, updated_at, revision";

impl Repository {
    // ==================== INSTANCE OPERATIONS ====================

    /// List the tenant's instances.
    pub async fn list_instances(&self, tenant: &str) -> Result<Vec<TemplateInstance>, AppError> {
        let query = format!(
            "SELECT {INSTANCE_COLUMNS} FROM template_instances WHERE creator_id = ? ORDER BY slug"
        );
        let rows = sqlx::query(&query)
            .bind(tenant)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(instance_from_row).collect()
    }

    /// Get an instance owned by the tenant.
    pub async fn get_instance(&self, tenant: &str, id: &str) -> Result<TemplateInstance, AppError> {
        let query = format!(
            "SELECT {INSTANCE_COLUMNS} FROM template_instances WHERE id = ? AND creator_id = ?"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(instance_from_row)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("Instance {} not found", id)))
    }

    /// Load an instance together with the version it pins.
    pub async fn get_instance_with_version(
        &self,
        tenant: &str,
        id: &str,
    ) -> Result<(TemplateInstance, TemplateVersion), AppError> {
        let instance = self.get_instance(tenant, id).await?;
        let version = self
            .find_version_by_id(&instance.template_version_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "Instance {} pins missing version {}",
                    id, instance.template_version_id
                ))
            })?;
        Ok((instance, version))
    }

    /// Create an instance pinned to the template's current version.
    pub async fn create_instance(
        &self,
        tenant: &str,
        request: &CreateInstanceRequest,
    ) -> Result<TemplateInstance, AppError> {
        let template = self.get_template(tenant, &request.template_id).await?;
        if template.status == TemplateStatus::Archived {
            return Err(AppError::Validation(format!(
                "Template {} is archived",
                template.id
            )));
        }
        let version_id = template.current_version_id.clone().ok_or_else(|| {
            AppError::Validation(format!("Template {} has no published version", template.id))
        })?;

        // An explicit slug is taken literally; a derived one may be suffixed.
        let (base, attempts) = match &request.slug {
            Some(slug) => (slugify(slug), 1),
            None => (slugify(&request.name), MAX_SLUG_ATTEMPTS),
        };

        for attempt in 0..attempts {
            let slug = slug_candidate(&base, attempt);
            match self
                .insert_instance(tenant, &template.id, &version_id, &slug, &request.name)
                .await
            {
                Ok(instance) => return Ok(instance),
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(tenant, slug = %slug, "Instance slug taken");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::conflict(format!(
            "Slug '{}' is already in use",
            base
        )))
    }

    async fn insert_instance(
        &self,
        tenant: &str,
        template_id: &str,
        version_id: &str,
        slug: &str,
        name: &str,
    ) -> Result<TemplateInstance, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO template_instances (id, creator_id, template_id, template_version_id, name, slug, content_bindings, theme_overrides, section_overrides, custom_css, created_at, updated_at, revision) VALUES (?, ?, ?, ?, ?, ?, '[]', '{}', '{}', NULL, ?, ?, 1)"
        )
        .bind(&id)
        .bind(tenant)
        .bind(template_id)
        .bind(version_id)
        .bind(name)
        .bind(slug)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        tracing::info!(instance_id = %id, tenant, template_id, version_id, "Instance created");

        Ok(TemplateInstance {
            id,
            creator_id: tenant.to_string(),
            template_id: template_id.to_string(),
            template_version_id: version_id.to_string(),
            name: name.to_string(),
            slug: slug.to_string(),
            content_bindings: Vec::new(),
            theme_overrides: Map::new(),
            section_overrides: BTreeMap::new(),
            custom_css: None,
            created_at: now.clone(),
            updated_at: now,
            revision: 1,
        })
    }

    /// Replace the complete binding set.
    pub async fn update_bindings(
        &self,
        tenant: &str,
        id: &str,
        request: &UpdateBindingsRequest,
    ) -> Result<TemplateInstance, AppError> {
        let (existing, version) = self.get_instance_with_version(tenant, id).await?;
        check_revision(&existing, request.expected_revision)?;
        validate_bindings(&request.content_bindings, &version.screen_json)
            .map_err(AppError::Validation)?;

        let updated = TemplateInstance {
            content_bindings: request.content_bindings.clone(),
            ..existing.clone()
        };
        self.write_instance(&existing, updated).await
    }

    /// Replace theme overrides, section overrides and custom CSS together.
    pub async fn update_theme(
        &self,
        tenant: &str,
        id: &str,
        request: &UpdateThemeRequest,
    ) -> Result<TemplateInstance, AppError> {
        let (existing, version) = self.get_instance_with_version(tenant, id).await?;
        check_revision(&existing, request.expected_revision)?;

        let section_overrides = request.section_overrides.clone().unwrap_or_default();
        validate_section_overrides(&section_overrides, &version.screen_json)
            .map_err(AppError::Validation)?;

        let updated = TemplateInstance {
            theme_overrides: request.theme_overrides.clone(),
            section_overrides,
            custom_css: request.custom_css.clone(),
            ..existing.clone()
        };
        self.write_instance(&existing, updated).await
    }

    /// Move the instance to another version of its template.
    ///
    /// Refused while bindings or overrides reference sections the target
    /// version does not have; the caller removes those first.
    pub async fn repin_instance(
        &self,
        tenant: &str,
        id: &str,
        request: &RepinRequest,
    ) -> Result<TemplateInstance, AppError> {
        let existing = self.get_instance(tenant, id).await?;
        check_revision(&existing, request.expected_revision)?;

        let template = self
            .fetch_template(&existing.template_id)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!("Instance {} references a missing template", id))
            })?;

        let target = match request.version {
            Some(number) => self.find_version_by_number(&template.id, number).await?,
            None => match &template.current_version_id {
                Some(version_id) => self.find_version_by_id(version_id).await?,
                None => None,
            },
        }
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Requested version of template {} not found",
                template.id
            ))
        })?;

        let dangling = existing.dangling_sections(&target.screen_json);
        if !dangling.is_empty() {
            return Err(AppError::Validation(format!(
                "Version {} lacks sections referenced by this instance: {}",
                target.version,
                dangling.join(", ")
            )));
        }

        let updated = TemplateInstance {
            template_version_id: target.id.clone(),
            ..existing.clone()
        };
        let instance = self.write_instance(&existing, updated).await?;
        tracing::info!(
            instance_id = id,
            template_id = %template.id,
            version = target.version,
            "Instance re-pinned"
        );
        Ok(instance)
    }

    /// Persist all mutable columns, guarded by the revision read earlier.
    async fn write_instance(
        &self,
        existing: &TemplateInstance,
        updated: TemplateInstance,
    ) -> Result<TemplateInstance, AppError> {
        let now = Utc::now().to_rfc3339();
        let new_revision = existing.revision + 1;

        let result = sqlx::query(
            r#"UPDATE template_instances SET
                template_version_id = ?, content_bindings = ?, theme_overrides = ?,
                section_overrides = ?, custom_css = ?, updated_at = ?, revision = ?
            WHERE id = ? AND creator_id = ? AND revision = ?"#,
        )
        .bind(&updated.template_version_id)
        .bind(encode(&updated.content_bindings))
        .bind(encode(&updated.theme_overrides))
        .bind(encode(&updated.section_overrides))
        .bind(&updated.custom_css)
        .bind(&now)
        .bind(new_revision)
        .bind(&existing.id)
        .bind(&existing.creator_id)
        .bind(existing.revision)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Race condition - revision changed between read and write
            let current = self.get_instance(&existing.creator_id, &existing.id).await?;
            return Err(AppError::Conflict {
                message: "Concurrent modification detected".to_string(),
                current_revision: Some(current.revision),
            });
        }

        Ok(TemplateInstance {
            updated_at: now,
            revision: new_revision,
            ..updated
        })
    }
}

fn check_revision(existing: &TemplateInstance, expected: Option<i64>) -> Result<(), AppError> {
    match expected {
        Some(expected) if expected != existing.revision => Err(AppError::Conflict {
            message: format!(
                "Revision mismatch: expected {}, current {}",
                expected, existing.revision
            ),
            current_revision: Some(existing.revision),
        }),
        _ => Ok(()),
    }
}

fn instance_from_row(row: &SqliteRow) -> Result<TemplateInstance, AppError> {
    let bindings: String = row.get("content_bindings");
    let theme_overrides: String = row.get("theme_overrides");
    let section_overrides: String = row.get("section_overrides");
    Ok(TemplateInstance {
        id: row.get("id"),
        creator_id: row.get("creator_id"),
        template_id: row.get("template_id"),
        template_version_id: row.get("template_version_id"),
        name: row.get("name"),
        slug: row.get("slug"),
        content_bindings: decode_json::<Vec<ContentBinding>>("content_bindings", &bindings)?,
        theme_overrides: decode_json::<Map<String, Value>>("theme_overrides", &theme_overrides)?,
        section_overrides: decode_json::<BTreeMap<String, Map<String, Value>>>(
            "section_overrides",
            &section_overrides,
        )?,
        custom_css: row.get("custom_css"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        revision: row.get("revision"),
    })
}
