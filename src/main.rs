//! Stagecraft Backend
//!
//! REST backend for versioned screen templates, per-tenant instances and
//! per-platform deployments with atomic promotion and rollback, on SQLite.

mod api;
mod auth;
mod config;
mod content;
mod db;
mod deploy;
mod errors;
mod models;
mod publish;
mod render;
mod resolver;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{Config, LogFormat};
use content::{ContentSource, HttpContentSource, StaticContentSource};
use db::{Repository, TenantDirectory};
use deploy::DeploymentOrchestrator;
use publish::UrlPublisher;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub config: Arc<Config>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!("Starting Stagecraft Backend");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Bind address: {}", config.bind_addr);

    // Warn if PSK is not configured
    if config.api_psk.is_none() {
        tracing::warn!("No API PSK configured (STAGECRAFT_API_PSK). Authentication is disabled!");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let repo = Arc::new(Repository::new(pool));

    let content: Arc<dyn ContentSource> = match &config.content_source_url {
        Some(url) => {
            tracing::info!("Content source: {}", url);
            Arc::new(HttpContentSource::new(url.clone(), config.content_timeout)?)
        }
        None => {
            tracing::warn!(
                "No content source configured (STAGECRAFT_CONTENT_SOURCE_URL). Bound sections will fall back to their defaults"
            );
            Arc::new(StaticContentSource::new())
        }
    };

    let orchestrator = Arc::new(DeploymentOrchestrator::new(
        repo.clone(),
        content,
        Arc::new(UrlPublisher::new(config.public_base_url.clone())),
        config.content_timeout,
    ));

    let state = AppState {
        repo: repo.clone(),
        orchestrator,
        tenants: repo,
        config: Arc::new(config.clone()),
    };

    // Build router
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Clone PSK for the auth layer
    let psk = state.config.api_psk.clone();

    // API routes
    let api_routes = Router::new()
        // Templates
        .route("/templates", get(api::list_templates).post(api::create_template))
        .route("/templates/{id}", get(api::get_template))
        .route("/templates/{id}/archive", post(api::archive_template))
        .route(
            "/templates/{id}/versions",
            get(api::list_versions).post(api::publish_version),
        )
        .route("/templates/{id}/versions/{version}", get(api::get_version))
        // Instances
        .route("/instances", get(api::list_instances).post(api::create_instance))
        .route("/instances/{id}", get(api::get_instance))
        .route("/instances/{id}/bindings", put(api::update_bindings))
        .route("/instances/{id}/theme", put(api::update_theme))
        .route("/instances/{id}/repin", post(api::repin_instance))
        // Deployments
        .route(
            "/instances/{id}/deployments",
            get(api::list_deployments).post(api::create_deployment),
        )
        .route("/deployments/{id}", get(api::get_deployment))
        .route("/deployments/{id}/rollback", post(api::rollback_deployment))
        .route("/deployments/{id}/logs", get(api::list_deployment_logs))
        // Tenant routing
        .route("/tenant", put(api::update_tenant_route))
        // Apply PSK auth middleware
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_check))
        .route("/render/{tenant}/{platform}/{*path}", get(api::render_live));

    Router::new()
        .nest("/api", api_routes)
        .merge(public_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests;
