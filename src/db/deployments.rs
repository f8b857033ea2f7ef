//! Deployment records, their append-only logs, and the live-slot swap.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::repository::{decode_enum, is_retryable, Repository, MAX_ALLOCATION_ATTEMPTS};
use crate::errors::AppError;
use crate::models::{Deployment, DeploymentLog, DeploymentStatus, LogLevel, Platform};

const DEPLOYMENT_COLUMNS: &str = "id, instance_id, creator_id, platform, version, status, \
    resolved_json, live_url, error, created_at, updated_at";

/// What a promotion carries into the live slot.
pub enum Promotion<'a> {
    /// A finished build: the artifact is written in the same transaction.
    Build {
        resolved_json: &'a str,
        live_url: &'a str,
    },
    /// A rollback: the target's stored artifact and URL are reused as-is.
    Rollback,
}

/// Outcome of a live-slot swap.
#[derive(Debug, Clone)]
pub struct SlotSwap {
    /// `(id, version)` of the deployment that was demoted, if any
    pub demoted: Option<(String, i64)>,
}

impl Repository {
    // ==================== DEPLOYMENT OPERATIONS ====================

    /// Insert a `pending` deployment with the next per-(instance, platform) version.
    ///
    /// Returns `Conflict` when another deployment of the pair is still
    /// `pending` or `building`.
    pub async fn create_pending_deployment(
        &self,
        tenant: &str,
        instance_id: &str,
        platform: Platform,
    ) -> Result<Deployment, AppError> {
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            match self.try_insert_pending(tenant, instance_id, platform).await {
                Ok(Some(deployment)) => return Ok(deployment),
                Ok(None) => {
                    return Err(AppError::conflict(format!(
                        "A {} build for instance {} is already in progress",
                        platform.as_str(),
                        instance_id
                    )));
                }
                Err(e) if is_retryable(&e) => {
                    tracing::warn!(instance_id, platform = platform.as_str(), attempt, error = %e, "Deployment version allocation raced, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::conflict(format!(
            "Could not allocate a deployment version for instance {}",
            instance_id
        )))
    }

    async fn try_insert_pending(
        &self,
        tenant: &str,
        instance_id: &str,
        platform: Platform,
    ) -> Result<Option<Deployment>, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        // Allocation and the in-flight check happen in one statement.
        let row = sqlx::query(
            r#"INSERT INTO deployments (
                id, instance_id, creator_id, platform, version, status, created_at, updated_at
            )
            SELECT ?, ?, ?, ?,
                (SELECT COALESCE(MAX(version), 0) + 1 FROM deployments
                 WHERE instance_id = ? AND platform = ?),
                'pending', ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM deployments
                WHERE instance_id = ? AND platform = ? AND status IN ('pending', 'building')
            )
            RETURNING version"#,
        )
        .bind(&id)
        .bind(instance_id)
        .bind(tenant)
        .bind(platform.as_str())
        .bind(instance_id)
        .bind(platform.as_str())
        .bind(&now)
        .bind(&now)
        .bind(instance_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Deployment {
            id,
            instance_id: instance_id.to_string(),
            creator_id: tenant.to_string(),
            platform,
            version: row.get("version"),
            status: DeploymentStatus::Pending,
            resolved_json: None,
            live_url: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        }))
    }

    /// Move a `pending` deployment to `building`.
    pub async fn mark_building(&self, id: &str) -> Result<(), AppError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE deployments SET status = 'building', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::conflict(format!(
                "Deployment {} is no longer pending",
                id
            )));
        }
        Ok(())
    }

    /// Record a terminal failure together with its log line.
    pub async fn mark_failed(&self, id: &str, message: &str) -> Result<(), AppError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE deployments SET status = 'failed', error = ?, updated_at = ? WHERE id = ? AND status IN ('pending', 'building')",
        )
        .bind(message)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        insert_log(
            &mut tx,
            id,
            LogLevel::Error,
            Some(crate::errors::codes::BUILD_FAILED),
            &format!("Build failed: {}", message),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Atomically make `deployment` the live one for its (instance, platform).
    ///
    /// The previous live row is demoted to `superseded` in the same
    /// transaction, so readers observe either the old or the new live row and
    /// never zero or two.
    pub async fn promote(
        &self,
        deployment: &Deployment,
        promotion: Promotion<'_>,
        log_code: Option<&str>,
        log_message: &str,
    ) -> Result<SlotSwap, AppError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        // The demotion is the transaction's first statement so the write lock
        // is taken before anything is read.
        let demoted = sqlx::query(
            r#"UPDATE deployments SET status = 'superseded', updated_at = ?
            WHERE instance_id = ? AND platform = ? AND status = 'live' AND id != ?
            RETURNING id, version"#,
        )
        .bind(&now)
        .bind(&deployment.instance_id)
        .bind(deployment.platform.as_str())
        .bind(&deployment.id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| (row.get::<String, _>("id"), row.get::<i64, _>("version")));

        let result = match promotion {
            Promotion::Build {
                resolved_json,
                live_url,
            } => {
                sqlx::query(
                    r#"UPDATE deployments SET status = 'live', resolved_json = ?, live_url = ?, updated_at = ?
                    WHERE id = ? AND status = 'building'"#,
                )
                .bind(resolved_json)
                .bind(live_url)
                .bind(&now)
                .bind(&deployment.id)
                .execute(&mut *tx)
                .await?
            }
            Promotion::Rollback => {
                sqlx::query(
                    r#"UPDATE deployments SET status = 'live', updated_at = ?
                    WHERE id = ? AND status IN ('live', 'superseded') AND resolved_json IS NOT NULL"#,
                )
                .bind(&now)
                .bind(&deployment.id)
                .execute(&mut *tx)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls the demotion back.
            return Err(AppError::conflict(format!(
                "Deployment {} can no longer be promoted",
                deployment.id
            )));
        }

        insert_log(&mut tx, &deployment.id, LogLevel::Info, log_code, log_message).await?;
        if let Some((demoted_id, _)) = &demoted {
            insert_log(
                &mut tx,
                demoted_id,
                LogLevel::Info,
                log_code,
                &format!("Superseded by deployment v{}", deployment.version),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(SlotSwap { demoted })
    }

    /// Append a log line to a deployment.
    pub async fn append_log(
        &self,
        deployment_id: &str,
        level: LogLevel,
        code: Option<&str>,
        message: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        insert_log(&mut tx, deployment_id, level, code, message).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get a deployment owned by the tenant.
    pub async fn get_deployment(&self, tenant: &str, id: &str) -> Result<Deployment, AppError> {
        let query = format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = ? AND creator_id = ?"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(deployment_from_row)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("Deployment {} not found", id)))
    }

    /// Deployment history of an instance, newest first.
    pub async fn list_deployments(
        &self,
        tenant: &str,
        instance_id: &str,
        platform: Option<Platform>,
    ) -> Result<Vec<Deployment>, AppError> {
        self.get_instance(tenant, instance_id).await?;

        let query = format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE instance_id = ? AND creator_id = ? AND (? IS NULL OR platform = ?) \
             ORDER BY platform, version DESC"
        );
        let platform = platform.map(|p| p.as_str());
        let rows = sqlx::query(&query)
            .bind(instance_id)
            .bind(tenant)
            .bind(platform)
            .bind(platform)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(deployment_from_row).collect()
    }

    /// Stored artifact of the live deployment behind (tenant, slug, platform).
    pub async fn find_live_artifact(
        &self,
        tenant: &str,
        slug: &str,
        platform: Platform,
    ) -> Result<Option<String>, AppError> {
        let row = sqlx::query(
            r#"SELECT d.resolved_json
            FROM deployments d
            JOIN template_instances i ON i.id = d.instance_id
            WHERE i.creator_id = ? AND i.slug = ? AND d.platform = ? AND d.status = 'live'"#,
        )
        .bind(tenant)
        .bind(slug)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| row.get::<Option<String>, _>("resolved_json")))
    }

    /// Log lines of a deployment owned by the tenant, in insertion order.
    pub async fn list_logs(
        &self,
        tenant: &str,
        deployment_id: &str,
    ) -> Result<Vec<DeploymentLog>, AppError> {
        self.get_deployment(tenant, deployment_id).await?;

        let rows = sqlx::query(
            "SELECT id, deployment_id, level, code, message, created_at FROM deployment_logs WHERE deployment_id = ? ORDER BY id",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(log_from_row).collect()
    }
}

async fn insert_log(
    tx: &mut Transaction<'_, Sqlite>,
    deployment_id: &str,
    level: LogLevel,
    code: Option<&str>,
    message: &str,
) -> Result<(), sqlx::Error> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO deployment_logs (deployment_id, level, code, message, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(deployment_id)
    .bind(level.as_str())
    .bind(code)
    .bind(message)
    .bind(&now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// Helper functions for row conversion

fn deployment_from_row(row: &SqliteRow) -> Result<Deployment, AppError> {
    let platform: String = row.get("platform");
    let status: String = row.get("status");
    Ok(Deployment {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        creator_id: row.get("creator_id"),
        platform: decode_enum("platform", &platform, Platform::from_str)?,
        version: row.get("version"),
        status: decode_enum("status", &status, DeploymentStatus::from_str)?,
        resolved_json: row.get("resolved_json"),
        live_url: row.get("live_url"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn log_from_row(row: &SqliteRow) -> Result<DeploymentLog, AppError> {
    let level: String = row.get("level");
    Ok(DeploymentLog {
        id: row.get("id"),
        deployment_id: row.get("deployment_id"),
        level: decode_enum("level", &level, LogLevel::from_str)?,
        code: row.get("code"),
        message: row.get("message"),
        created_at: row.get("created_at"),
    })
}
