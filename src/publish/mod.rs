//! Publish side-channel: decides the `liveUrl` recorded on a promoted deployment.
//!
//! Serving the artifact at that URL (CDN push, cache purge) happens outside
//! this service; the core only records what the publisher returns.

use std::fmt;

use async_trait::async_trait;

use crate::models::Platform;

/// Everything a publisher may need to place an artifact.
#[derive(Debug, Clone)]
pub struct PublishTarget<'a> {
    pub tenant: &'a str,
    pub instance_id: &'a str,
    pub instance_slug: &'a str,
    pub platform: Platform,
    pub deployment_id: &'a str,
    pub deployment_version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishError(pub String);

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "publish failed: {}", self.0)
    }
}

impl std::error::Error for PublishError {}

#[async_trait]
pub trait LivePublisher: Send + Sync {
    /// Returns the URL the artifact will be served from once promoted.
    async fn publish(&self, target: &PublishTarget<'_>) -> Result<String, PublishError>;
}

/// Assigns a stable per-slot URL under a configured base.
pub struct UrlPublisher {
    base_url: String,
}

impl UrlPublisher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LivePublisher for UrlPublisher {
    async fn publish(&self, target: &PublishTarget<'_>) -> Result<String, PublishError> {
        let url = format!(
            "{}/{}/{}/{}",
            self.base_url,
            target.tenant,
            target.platform.as_str(),
            target.instance_slug
        );
        tracing::debug!(
            instance_id = target.instance_id,
            deployment_id = target.deployment_id,
            version = target.deployment_version,
            url = %url,
            "Assigned live URL"
        );
        Ok(url)
    }
}
