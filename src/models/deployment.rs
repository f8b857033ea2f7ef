//! Deployment and deployment log models.

use serde::{Deserialize, Serialize};

/// Runtime target a deployment is built for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Web,
    Mobile,
    Tv,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Web => "web",
            Platform::Mobile => "mobile",
            Platform::Tv => "tv",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Platform::Web),
            "mobile" => Some(Platform::Mobile),
            "tv" => Some(Platform::Tv),
            _ => None,
        }
    }
}

/// Deployment lifecycle: `pending -> building -> (live | failed)`.
///
/// `superseded` marks a formerly live deployment that a later promotion
/// demoted; it keeps its artifact and can be promoted again by a rollback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Building,
    Live,
    Failed,
    Superseded,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Building => "building",
            DeploymentStatus::Live => "live",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Superseded => "superseded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeploymentStatus::Pending),
            "building" => Some(DeploymentStatus::Building),
            "live" => Some(DeploymentStatus::Live),
            "failed" => Some(DeploymentStatus::Failed),
            "superseded" => Some(DeploymentStatus::Superseded),
            _ => None,
        }
    }
}

/// One build attempt for one `(instance, platform)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub instance_id: String,
    pub creator_id: String,
    pub platform: Platform,
    pub version: i64,
    pub status: DeploymentStatus,
    /// Serialized resolved document, stored verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Deployment {
    /// Whether a rollback may re-promote this deployment's artifact.
    pub fn is_promotable(&self) -> bool {
        self.resolved_json.is_some()
            && matches!(
                self.status,
                DeploymentStatus::Live | DeploymentStatus::Superseded
            )
    }
}

/// Severity of a deployment log line.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Append-only log line attached to a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentLog {
    pub id: i64,
    pub deployment_id: String,
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    pub created_at: String,
}

/// Request body for creating a deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentRequest {
    pub platform: String,
}

/// Query parameters for listing deployments.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentListQuery {
    #[serde(default)]
    pub platform: Option<String>,
}
