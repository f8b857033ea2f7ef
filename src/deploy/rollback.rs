//! Rollback: re-promote a previously built artifact without rebuilding.

use super::DeploymentOrchestrator;
use crate::db::Promotion;
use crate::errors::{codes, AppError};
use crate::models::{Deployment, DeploymentStatus, LogLevel};

impl DeploymentOrchestrator {
    /// Make `deployment_id` the live deployment of its (instance, platform).
    ///
    /// Only the stored `resolved_json` is reused; content sources and the
    /// resolver are never consulted, so a rollback succeeds even while every
    /// binding would currently fail.
    pub async fn rollback(&self, tenant: &str, deployment_id: &str) -> Result<Deployment, AppError> {
        let target = self.repo.get_deployment(tenant, deployment_id).await?;

        if !target.is_promotable() {
            let message = format!(
                "Deployment v{} ({}) has no successful build to roll back to",
                target.version,
                target.status.as_str()
            );
            tracing::warn!(deployment_id, status = target.status.as_str(), "Rollback rejected");
            self.repo
                .append_log(
                    &target.id,
                    LogLevel::Warn,
                    Some(codes::ROLLBACK),
                    &format!("Rollback rejected: {}", message),
                )
                .await?;
            return Err(AppError::Validation(message));
        }

        if target.status == DeploymentStatus::Live {
            self.repo
                .append_log(
                    &target.id,
                    LogLevel::Info,
                    Some(codes::ROLLBACK),
                    "Rollback requested for the live deployment; nothing to do",
                )
                .await?;
            return Ok(target);
        }

        let swap = self
            .repo
            .promote(
                &target,
                Promotion::Rollback,
                Some(codes::ROLLBACK),
                &format!("Rolled back: v{} is live again", target.version),
            )
            .await?;

        tracing::info!(
            deployment_id,
            instance_id = %target.instance_id,
            platform = target.platform.as_str(),
            version = target.version,
            superseded = ?swap.demoted.as_ref().map(|(_, v)| *v),
            "Rollback complete"
        );

        self.repo.get_deployment(tenant, deployment_id).await
    }
}
