//! Deployment orchestration: `pending -> building -> (live | failed)`.
//!
//! A deployment row is created first, then the build routine captures
//! content, resolves the screen and promotes the artifact into the live slot
//! of its (instance, platform) pair. Builds of different pairs run
//! independently; a second build of the same pair is refused while one is in
//! flight.

mod rollback;

use std::sync::Arc;
use std::time::Duration;

use crate::content::{self, ContentSource};
use crate::db::{Promotion, Repository};
use crate::errors::{codes, AppError};
use crate::models::{Deployment, LogLevel, Platform};
use crate::publish::{LivePublisher, PublishTarget};
use crate::resolver;

pub struct DeploymentOrchestrator {
    repo: Arc<Repository>,
    content: Arc<dyn ContentSource>,
    publisher: Arc<dyn LivePublisher>,
    content_timeout: Duration,
}

impl DeploymentOrchestrator {
    pub fn new(
        repo: Arc<Repository>,
        content: Arc<dyn ContentSource>,
        publisher: Arc<dyn LivePublisher>,
        content_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            content,
            publisher,
            content_timeout,
        }
    }

    /// Create a deployment for `(instance, platform)` and build it right away.
    ///
    /// Returns the live deployment, or `BuildFailed` naming the failed record.
    pub async fn create_deployment(
        &self,
        tenant: &str,
        instance_id: &str,
        platform: &str,
    ) -> Result<Deployment, AppError> {
        let platform = Platform::from_str(platform).ok_or_else(|| {
            tracing::warn!(instance_id, platform, "Rejected deployment for unknown platform");
            AppError::Validation(format!(
                "Invalid platform '{}': expected web, mobile or tv",
                platform
            ))
        })?;
        let instance = self.repo.get_instance(tenant, instance_id).await?;

        let deployment = self
            .repo
            .create_pending_deployment(tenant, &instance.id, platform)
            .await?;
        tracing::info!(
            deployment_id = %deployment.id,
            instance_id,
            platform = platform.as_str(),
            version = deployment.version,
            "Deployment created"
        );

        self.run_build(tenant, deployment).await
    }

    /// Build a `pending` deployment to completion.
    ///
    /// Any error marks the deployment `failed`; the previous live deployment
    /// of the pair stays in place.
    pub async fn run_build(
        &self,
        tenant: &str,
        deployment: Deployment,
    ) -> Result<Deployment, AppError> {
        match self.build(tenant, &deployment).await {
            Ok(()) => self.repo.get_deployment(tenant, &deployment.id).await,
            Err(e) => {
                let message = e.message();
                tracing::error!(
                    deployment_id = %deployment.id,
                    instance_id = %deployment.instance_id,
                    platform = deployment.platform.as_str(),
                    error = %message,
                    "Build failed"
                );
                if let Err(mark_err) = self.repo.mark_failed(&deployment.id, &message).await {
                    tracing::error!(
                        deployment_id = %deployment.id,
                        error = %mark_err,
                        "Could not record build failure"
                    );
                }
                Err(AppError::BuildFailed {
                    deployment_id: deployment.id.clone(),
                    message,
                })
            }
        }
    }

    async fn build(&self, tenant: &str, deployment: &Deployment) -> Result<(), AppError> {
        self.repo
            .append_log(
                &deployment.id,
                LogLevel::Info,
                None,
                &format!(
                    "Deployment v{} created for platform {}",
                    deployment.version,
                    deployment.platform.as_str()
                ),
            )
            .await?;

        self.repo.mark_building(&deployment.id).await?;

        let (instance, version) = self
            .repo
            .get_instance_with_version(tenant, &deployment.instance_id)
            .await?;
        self.repo
            .append_log(
                &deployment.id,
                LogLevel::Info,
                None,
                &format!(
                    "Building template version {} with {} binding(s)",
                    version.version,
                    instance.content_bindings.len()
                ),
            )
            .await?;

        let captured = content::capture(
            self.content.as_ref(),
            &instance.content_bindings,
            self.content_timeout,
        )
        .await;

        let resolution = resolver::resolve(&version, &instance, deployment.platform, &captured)
            .map_err(|e| AppError::Internal(format!("Resolution failed: {}", e)))?;
        let resolved_json = resolution
            .to_json()
            .map_err(|e| AppError::Internal(format!("Resolution failed: {}", e)))?;

        for warning in &resolution.warnings {
            self.repo
                .append_log(
                    &deployment.id,
                    LogLevel::Warn,
                    Some(codes::BUILD_DEGRADED),
                    &format!(
                        "Section '{}' fell back to defaults: {}",
                        warning.section_id, warning.message
                    ),
                )
                .await?;
        }
        if resolution.is_degraded() {
            tracing::warn!(
                deployment_id = %deployment.id,
                degraded_sections = resolution.warnings.len(),
                "Build degraded"
            );
        }

        let live_url = self
            .publisher
            .publish(&PublishTarget {
                tenant,
                instance_id: &instance.id,
                instance_slug: &instance.slug,
                platform: deployment.platform,
                deployment_id: &deployment.id,
                deployment_version: deployment.version,
            })
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let swap = self
            .repo
            .promote(
                deployment,
                Promotion::Build {
                    resolved_json: &resolved_json,
                    live_url: &live_url,
                },
                None,
                &format!("Build succeeded; v{} is live at {}", deployment.version, live_url),
            )
            .await?;

        tracing::info!(
            deployment_id = %deployment.id,
            instance_id = %deployment.instance_id,
            platform = deployment.platform.as_str(),
            version = deployment.version,
            superseded = ?swap.demoted.as_ref().map(|(_, v)| *v),
            "Deployment is live"
        );
        Ok(())
    }

    /// Deployment history of an instance.
    pub async fn list_deployments(
        &self,
        tenant: &str,
        instance_id: &str,
        platform: Option<&str>,
    ) -> Result<Vec<Deployment>, AppError> {
        let platform = match platform {
            Some(raw) => Some(Platform::from_str(raw).ok_or_else(|| {
                AppError::Validation(format!("Invalid platform '{}'", raw))
            })?),
            None => None,
        };
        self.repo.list_deployments(tenant, instance_id, platform).await
    }
}
