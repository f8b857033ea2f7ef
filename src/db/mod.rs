//! Database module for SQLite persistence.
//!
//! SQLite is the source of truth for templates, instances and deployments.

mod deployments;
mod instances;
mod repository;
mod templates;
mod tenants;

pub use deployments::Promotion;
pub use repository::*;
pub use tenants::TenantDirectory;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run embedded migrations
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            domain TEXT UNIQUE,
            updated_at TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS templates (
            id TEXT PRIMARY KEY,
            creator_id TEXT NOT NULL,
            name TEXT NOT NULL,
            slug TEXT NOT NULL,
            category TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            is_starter INTEGER NOT NULL DEFAULT 0,
            current_version_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (creator_id, slug)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Versions are insert-only: the trigger rejects every UPDATE.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS template_versions (
            id TEXT PRIMARY KEY,
            template_id TEXT NOT NULL REFERENCES templates(id),
            version INTEGER NOT NULL,
            screen_json TEXT NOT NULL,
            theme_json TEXT NOT NULL,
            component_versions TEXT NOT NULL,
            changelog TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (template_id, version)
        );

        CREATE TRIGGER IF NOT EXISTS template_versions_immutable
        BEFORE UPDATE ON template_versions
        BEGIN
            SELECT RAISE(ABORT, 'template versions are immutable');
        END;
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS template_instances (
            id TEXT PRIMARY KEY,
            creator_id TEXT NOT NULL,
            template_id TEXT NOT NULL REFERENCES templates(id),
            template_version_id TEXT NOT NULL REFERENCES template_versions(id),
            name TEXT NOT NULL,
            slug TEXT NOT NULL,
            content_bindings TEXT NOT NULL DEFAULT '[]',
            theme_overrides TEXT NOT NULL DEFAULT '{}',
            section_overrides TEXT NOT NULL DEFAULT '{}',
            custom_css TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            UNIQUE (creator_id, slug)
        );
        "#,
    )
    .execute(pool)
    .await?;

    // At most one live row per (instance, platform); artifacts are write-once.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
            id TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL REFERENCES template_instances(id),
            creator_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            version INTEGER NOT NULL,
            status TEXT NOT NULL,
            resolved_json TEXT,
            live_url TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (instance_id, platform, version)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_live_slot
            ON deployments(instance_id, platform) WHERE status = 'live';

        CREATE TRIGGER IF NOT EXISTS deployments_artifact_write_once
        BEFORE UPDATE OF resolved_json ON deployments
        WHEN OLD.resolved_json IS NOT NULL
        BEGIN
            SELECT RAISE(ABORT, 'resolved artifact is immutable');
        END;
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deployment_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            deployment_id TEXT NOT NULL REFERENCES deployments(id),
            level TEXT NOT NULL,
            code TEXT,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TRIGGER IF NOT EXISTS deployment_logs_no_update
        BEFORE UPDATE ON deployment_logs
        BEGIN
            SELECT RAISE(ABORT, 'deployment logs are append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS deployment_logs_no_delete
        BEFORE DELETE ON deployment_logs
        BEGIN
            SELECT RAISE(ABORT, 'deployment logs are append-only');
        END;
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for common queries
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_templates_creator ON templates(creator_id);
        CREATE INDEX IF NOT EXISTS idx_templates_starter ON templates(is_starter);
        CREATE INDEX IF NOT EXISTS idx_instances_creator ON template_instances(creator_id);
        CREATE INDEX IF NOT EXISTS idx_deployments_pair ON deployments(instance_id, platform, status);
        CREATE INDEX IF NOT EXISTS idx_deployment_logs_deployment ON deployment_logs(deployment_id, id);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
