//! Content sources that back section bindings (courses, feeds, leaderboards).
//!
//! A fetch either returns data (possibly empty) or a [`ContentError`]; the
//! build treats errors as "fall back to static defaults", never as "no data".

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::models::ContentBinding;
use crate::resolver::{CapturedBinding, CapturedContent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// The source has no resource for this binding.
    NotFound,
    /// The source rejected the binding's query.
    InvalidQuery(String),
    /// Transport or upstream failure.
    Unavailable(String),
    Timeout(Duration),
}

impl fmt::Display for ContentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentError::NotFound => write!(f, "content source not found"),
            ContentError::InvalidQuery(msg) => write!(f, "invalid query: {}", msg),
            ContentError::Unavailable(msg) => write!(f, "content source unavailable: {}", msg),
            ContentError::Timeout(after) => write!(f, "timed out after {} ms", after.as_millis()),
        }
    }
}

impl std::error::Error for ContentError {}

/// Lookup contract for external content. Implementations must be
/// side-effect free from the caller's point of view.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(
        &self,
        binding_type: &str,
        resource_id: Option<&str>,
        query: Option<&Value>,
    ) -> Result<Value, ContentError>;
}

/// Fetch every binding concurrently, each bounded by `timeout`.
pub async fn capture(
    source: &dyn ContentSource,
    bindings: &[ContentBinding],
    timeout: Duration,
) -> CapturedContent {
    let fetches = bindings.iter().map(|binding| async move {
        let fetch = source.fetch(
            &binding.binding_type,
            binding.resource_id.as_deref(),
            binding.query.as_ref(),
        );
        let outcome = match tokio::time::timeout(timeout, fetch).await {
            Ok(Ok(data)) => CapturedBinding::Data(data),
            Ok(Err(e)) => CapturedBinding::Failed(e.to_string()),
            Err(_) => CapturedBinding::Failed(ContentError::Timeout(timeout).to_string()),
        };
        if let CapturedBinding::Failed(reason) = &outcome {
            tracing::warn!(
                section_id = %binding.section_id,
                binding_type = %binding.binding_type,
                reason = %reason,
                "Content binding failed"
            );
        }
        (binding.section_id.clone(), outcome)
    });

    join_all(fetches).await.into_iter().collect()
}

/// In-memory source keyed by `(binding_type, resource_id)`.
///
/// Used when no content service is configured, and in tests.
#[derive(Default)]
pub struct StaticContentSource {
    entries: RwLock<HashMap<(String, Option<String>), Result<Value, ContentError>>>,
}

impl StaticContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, binding_type: &str, resource_id: Option<&str>, data: Value) {
        self.entries.write().await.insert(
            (binding_type.to_string(), resource_id.map(str::to_string)),
            Ok(data),
        );
    }

    pub async fn fail(&self, binding_type: &str, resource_id: Option<&str>, error: ContentError) {
        self.entries.write().await.insert(
            (binding_type.to_string(), resource_id.map(str::to_string)),
            Err(error),
        );
    }
}

#[async_trait]
impl ContentSource for StaticContentSource {
    async fn fetch(
        &self,
        binding_type: &str,
        resource_id: Option<&str>,
        _query: Option<&Value>,
    ) -> Result<Value, ContentError> {
        let key = (binding_type.to_string(), resource_id.map(str::to_string));
        self.entries
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or(Err(ContentError::NotFound))
    }
}

/// Content service reached over HTTP: `GET {base}/{binding_type}`.
pub struct HttpContentSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContentSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn fetch(
        &self,
        binding_type: &str,
        resource_id: Option<&str>,
        query: Option<&Value>,
    ) -> Result<Value, ContentError> {
        let url = format!("{}/{}", self.base_url, binding_type);
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(resource_id) = resource_id {
            params.push(("resourceId", resource_id.to_string()));
        }
        if let Some(query) = query {
            params.push(("query", query.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| ContentError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ContentError::NotFound);
        }
        if status == reqwest::StatusCode::BAD_REQUEST
            || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            let body = response.text().await.unwrap_or_default();
            return Err(ContentError::InvalidQuery(body));
        }
        if !status.is_success() {
            return Err(ContentError::Unavailable(format!("upstream status {}", status)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ContentError::Unavailable(format!("malformed response: {}", e)))
    }
}
