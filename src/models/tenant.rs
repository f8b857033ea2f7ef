//! Tenant routing model used by public render lookups.

use serde::{Deserialize, Serialize};

/// Lookup keys under which a tenant's screens are served.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRoute {
    pub id: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub updated_at: String,
}

/// Request body for registering the caller's slug and custom domain.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTenantRouteRequest {
    pub slug: String,
    #[serde(default)]
    pub domain: Option<String>,
}
