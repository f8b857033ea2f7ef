//! Integration tests for the Stagecraft backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::future::join_all;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use crate::config::{Config, LogFormat};
use crate::content::{ContentError, StaticContentSource};
use crate::db::{init_database, Repository};
use crate::deploy::DeploymentOrchestrator;
use crate::publish::{LivePublisher, PublishError, PublishTarget, UrlPublisher};
use crate::{create_router, AppState};

const TENANT_A: &str = "tenant-a";
const TENANT_B: &str = "tenant-b";

/// Publisher that can be switched into a failing state mid-test.
struct SwitchablePublisher {
    inner: UrlPublisher,
    failing: AtomicBool,
}

#[async_trait]
impl LivePublisher for SwitchablePublisher {
    async fn publish(&self, target: &PublishTarget<'_>) -> Result<String, PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError("upload rejected".to_string()));
        }
        self.inner.publish(target).await
    }
}

/// Builds application state over a fresh database in `temp_dir`.
async fn test_state(
    temp_dir: &TempDir,
    psk: Option<String>,
) -> (AppState, Arc<StaticContentSource>, Arc<SwitchablePublisher>) {
    let db_path = temp_dir.path().join("test.sqlite");

    // Initialize database
    let pool = init_database(&db_path).await.expect("Failed to init DB");
    let repo = Arc::new(Repository::new(pool));

    let content = Arc::new(StaticContentSource::new());
    let publisher = Arc::new(SwitchablePublisher {
        inner: UrlPublisher::new("http://live.test"),
        failing: AtomicBool::new(false),
    });

    let config = Config {
        api_psk: psk,
        db_path,
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        log_level: "warn".to_string(),
        log_format: LogFormat::Pretty,
        content_source_url: None,
        content_timeout: Duration::from_millis(500),
        public_base_url: "http://live.test".to_string(),
    };

    let orchestrator = Arc::new(DeploymentOrchestrator::new(
        repo.clone(),
        content.clone(),
        publisher.clone(),
        config.content_timeout,
    ));

    let state = AppState {
        repo: repo.clone(),
        orchestrator,
        tenants: repo,
        config: Arc::new(config),
    };

    (state, content, publisher)
}

/// Test fixture for integration tests.
struct TestFixture {
    client: Client,
    base_url: String,
    content: Arc<StaticContentSource>,
    publisher: Arc<SwitchablePublisher>,
    _temp_dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_psk(Some("test-api-key".to_string())).await
    }

    async fn with_psk(psk: Option<String>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (state, content, publisher) = test_state(&temp_dir, psk.clone()).await;

        let app = create_router(state);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");
        let base_url = format!("http://{}", addr);

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut client_builder = Client::builder();
        if let Some(key) = psk {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert("x-api-key", key.parse().unwrap());
            client_builder = client_builder.default_headers(headers);
        }

        TestFixture {
            client: client_builder.build().unwrap(),
            base_url,
            content,
            publisher,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        tenant: &str,
        path: &str,
        body: Option<Value>,
    ) -> (u16, Value) {
        let mut request = self
            .client
            .request(method, self.url(path))
            .header("x-tenant-id", tenant);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let resp = request.send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn get(&self, tenant: &str, path: &str) -> (u16, Value) {
        self.send(Method::GET, tenant, path, None).await
    }

    async fn post(&self, tenant: &str, path: &str, body: Value) -> (u16, Value) {
        self.send(Method::POST, tenant, path, Some(body)).await
    }

    async fn put(&self, tenant: &str, path: &str, body: Value) -> (u16, Value) {
        self.send(Method::PUT, tenant, path, Some(body)).await
    }

    async fn render(&self, tenant_key: &str, platform: &str, path: &str) -> (u16, String) {
        let resp = self
            .client
            .get(self.url(&format!("/render/{}/{}/{}", tenant_key, platform, path)))
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.text().await.unwrap())
    }

    async fn deploy(&self, tenant: &str, instance_id: &str, platform: &str) -> (u16, Value) {
        self.post(
            tenant,
            &format!("/api/instances/{}/deployments", instance_id),
            json!({ "platform": platform }),
        )
        .await
    }
}

fn hero_pricing_screen() -> Value {
    json!({
        "sections": [
            {
                "id": "hero",
                "type": "hero",
                "props": { "headline": "Learn faster" },
                "style": { "primary": "#ffffff", "padding": 8 }
            },
            {
                "id": "pricing",
                "type": "pricing_table",
                "props": { "columns": 3 },
                "style": { "primary": "#eeeeee", "padding": 16 },
                "data": [{ "name": "Free" }]
            }
        ]
    })
}

/// Creates a published template and an instance pinned to version 1.
async fn create_template_and_instance(
    fixture: &TestFixture,
    tenant: &str,
    screen: Value,
) -> (String, Value) {
    let (status, body) = fixture
        .post(
            tenant,
            "/api/templates",
            json!({
                "name": "Landing",
                "category": "marketing",
                "initialScreenJson": screen,
                "initialThemeJson": { "primary": "#111111", "fontFamily": "Inter" },
                "componentVersions": { "hero": "2.1.0" }
            }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    let template_id = body["data"]["template"]["id"].as_str().unwrap().to_string();

    let (status, body) = fixture
        .post(
            tenant,
            "/api/instances",
            json!({ "templateId": template_id, "name": "Spring Sale" }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);

    (template_id, body["data"].clone())
}

fn resolved(deployment: &Value) -> Value {
    serde_json::from_str(deployment["resolvedJson"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_router_serves_public_routes_without_psk() {
    let temp_dir = TempDir::new().unwrap();
    let (state, _, _) = test_state(&temp_dir, Some("secret-key".to_string())).await;
    let app = create_router(state);

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::get("/render/nobody/web/home").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(Request::get("/api/templates").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_missing_psk() {
    let fixture = TestFixture::new().await;

    // Request without API key
    let resp = Client::new()
        .get(fixture.url("/api/templates"))
        .header("x-tenant-id", TENANT_A)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_auth_invalid_psk() {
    let fixture = TestFixture::new().await;

    let resp = Client::new()
        .get(fixture.url("/api/templates"))
        .header("x-api-key", "wrong-key")
        .header("x-tenant-id", TENANT_A)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_auth_bearer_token() {
    let fixture = TestFixture::new().await;

    let resp = Client::new()
        .get(fixture.url("/api/templates"))
        .header("authorization", "Bearer test-api-key")
        .header("x-tenant-id", TENANT_A)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_missing_tenant_header() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/api/templates"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_dev_mode_without_psk() {
    let fixture = TestFixture::with_psk(None).await;

    let (status, body) = fixture.get(TENANT_A, "/api/templates").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_template_versions() {
    let fixture = TestFixture::new().await;

    // Create without an initial version: stays draft
    let (status, body) = fixture
        .post(
            TENANT_A,
            "/api/templates",
            json!({ "name": "Course Page", "category": "courses" }),
        )
        .await;
    assert_eq!(status, 200);
    let template = &body["data"]["template"];
    assert_eq!(template["status"], "draft");
    assert_eq!(template["slug"], "course-page");
    assert!(body["data"].get("version").is_none());
    let template_id = template["id"].as_str().unwrap().to_string();

    // First publish
    let (status, body) = fixture
        .post(
            TENANT_A,
            &format!("/api/templates/{}/versions", template_id),
            json!({ "screenJson": hero_pricing_screen(), "changelog": "first cut" }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["version"], 1);
    let v1_id = body["data"]["id"].as_str().unwrap().to_string();

    // Second publish
    let (status, body) = fixture
        .post(
            TENANT_A,
            &format!("/api/templates/{}/versions", template_id),
            json!({ "screenJson": { "sections": [] }, "themeJson": { "primary": "#000" } }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["version"], 2);
    let v2_id = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = fixture
        .get(TENANT_A, &format!("/api/templates/{}", template_id))
        .await;
    assert_eq!(body["data"]["status"], "published");
    assert_eq!(body["data"]["currentVersionId"], v2_id.as_str());

    // Version 1 is unchanged by the later publish
    let (status, body) = fixture
        .get(TENANT_A, &format!("/api/templates/{}/versions/1", template_id))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["id"], v1_id.as_str());
    assert_eq!(body["data"]["changelog"], "first cut");
    assert_eq!(body["data"]["screenJson"]["sections"][0]["id"], "hero");

    let (_, body) = fixture
        .get(TENANT_A, &format!("/api/templates/{}/versions", template_id))
        .await;
    let versions: Vec<i64> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["version"].as_i64().unwrap())
        .collect();
    assert_eq!(versions, vec![1, 2]);

    let (status, _) = fixture
        .get(TENANT_A, &format!("/api/templates/{}/versions/9", template_id))
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_author_keys_survive_publish_and_build() {
    let fixture = TestFixture::new().await;
    let screen = json!({
        "layout": "stacked",
        "sections": [
            {
                "id": "hero",
                "type": "hero",
                "variant": "dark",
                "props": { "headline": "Hi" },
                "style": {}
            }
        ]
    });
    let (template_id, instance) =
        create_template_and_instance(&fixture, TENANT_A, screen.clone()).await;

    let (status, body) = fixture
        .get(TENANT_A, &format!("/api/templates/{}/versions/1", template_id))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["screenJson"], screen);

    let (status, body) = fixture
        .deploy(TENANT_A, instance["id"].as_str().unwrap(), "web")
        .await;
    assert_eq!(status, 200);
    let artifact = resolved(&body["data"]);
    assert_eq!(artifact["layout"], "stacked");
    assert_eq!(artifact["sections"][0]["variant"], "dark");
    assert_eq!(artifact["sections"][0]["source"], "static");
}

#[tokio::test]
async fn test_concurrent_publishes_get_contiguous_versions() {
    let fixture = TestFixture::new().await;
    let (template_id, _) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;

    let path = format!("/api/templates/{}/versions", template_id);
    let publishes = (0..10).map(|i| {
        fixture.post(
            TENANT_A,
            &path,
            json!({ "screenJson": hero_pricing_screen(), "changelog": format!("edit {}", i) }),
        )
    });
    let results = join_all(publishes).await;

    let mut versions: Vec<i64> = results
        .iter()
        .map(|(status, body)| {
            assert_eq!(*status, 200, "{}", body);
            body["data"]["version"].as_i64().unwrap()
        })
        .collect();
    versions.sort();
    assert_eq!(versions, (2..=11).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_template_validation_errors() {
    let fixture = TestFixture::new().await;

    let (status, body) = fixture
        .post(
            TENANT_A,
            "/api/templates",
            json!({ "name": "  ", "category": "marketing" }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = fixture
        .post(
            TENANT_A,
            "/api/templates",
            json!({ "name": "Landing", "category": "" }),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = fixture
        .post(
            TENANT_A,
            "/api/templates",
            json!({
                "name": "Landing",
                "category": "marketing",
                "initialScreenJson": { "sections": [
                    { "id": "hero", "type": "hero" },
                    { "id": "hero", "type": "faq" }
                ]}
            }),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Duplicate section id"));
}

#[tokio::test]
async fn test_archived_template_is_read_only() {
    let fixture = TestFixture::new().await;
    let (template_id, _) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;

    let (status, body) = fixture
        .post(
            TENANT_A,
            &format!("/api/templates/{}/archive", template_id),
            json!({}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "archived");

    let (status, body) = fixture
        .post(
            TENANT_A,
            &format!("/api/templates/{}/versions", template_id),
            json!({ "screenJson": hero_pricing_screen() }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = fixture
        .post(
            TENANT_A,
            "/api/instances",
            json!({ "templateId": template_id, "name": "Another" }),
        )
        .await;
    assert_eq!(status, 400);

    // Archived versions stay readable
    let (status, _) = fixture
        .get(TENANT_A, &format!("/api/templates/{}/versions/1", template_id))
        .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_instance_slugs() {
    let fixture = TestFixture::new().await;
    let (template_id, first) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    assert_eq!(first["slug"], "spring-sale");
    assert_eq!(first["revision"], 1);

    // A derived slug that collides gets a suffix
    let (status, body) = fixture
        .post(
            TENANT_A,
            "/api/instances",
            json!({ "templateId": template_id, "name": "Spring Sale" }),
        )
        .await;
    assert_eq!(status, 200);
    let slug = body["data"]["slug"].as_str().unwrap();
    assert!(slug.starts_with("spring-sale-"));

    // An explicit slug that collides is a conflict
    let (status, body) = fixture
        .post(
            TENANT_A,
            "/api/instances",
            json!({ "templateId": template_id, "name": "Other", "slug": "spring-sale" }),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_bindings_replace_and_clear() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let path = format!("/api/instances/{}/bindings", instance["id"].as_str().unwrap());

    let (status, body) = fixture
        .put(
            TENANT_A,
            &path,
            json!({
                "contentBindings": [
                    { "sectionId": "pricing", "bindingType": "plans", "resourceId": "p1" }
                ],
                "expectedRevision": 1
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["revision"], 2);
    assert_eq!(body["data"]["contentBindings"][0]["bindingType"], "plans");

    let instance_id = instance["id"].as_str().unwrap();
    fixture
        .content
        .insert("plans", Some("p1"), json!([{ "name": "Pro" }]))
        .await;
    let (status, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    assert_eq!(status, 200);
    let pricing = &resolved(&body["data"])["sections"][1];
    assert_eq!(pricing["source"], "bound");
    assert_eq!(pricing["data"], json!([{ "name": "Pro" }]));

    // An empty list clears every binding
    let (status, body) = fixture
        .put(
            TENANT_A,
            &path,
            json!({ "contentBindings": [], "expectedRevision": 2 }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["contentBindings"], json!([]));
    assert_eq!(body["data"]["revision"], 3);

    // The next build falls back to the section's static defaults
    let (status, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    assert_eq!(status, 200);
    let pricing = &resolved(&body["data"])["sections"][1];
    assert_eq!(pricing["id"], "pricing");
    assert_eq!(pricing["source"], "static");
    assert_eq!(pricing["data"], json!([{ "name": "Free" }]));
}

#[tokio::test]
async fn test_binding_validation() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let path = format!("/api/instances/{}/bindings", instance["id"].as_str().unwrap());

    let (status, body) = fixture
        .put(
            TENANT_A,
            &path,
            json!({ "contentBindings": [{ "sectionId": "faq", "bindingType": "faqs" }] }),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"]["message"].as_str().unwrap().contains("faq"));

    let (status, _) = fixture
        .put(
            TENANT_A,
            &path,
            json!({ "contentBindings": [
                { "sectionId": "hero", "bindingType": "courses" },
                { "sectionId": "hero", "bindingType": "courses" }
            ]}),
        )
        .await;
    assert_eq!(status, 400);

    let (status, _) = fixture
        .put(
            TENANT_A,
            &format!("/api/instances/{}/theme", instance["id"].as_str().unwrap()),
            json!({ "sectionOverrides": { "faq": { "padding": 4 } } }),
        )
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_instance_revision_conflict() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let path = format!("/api/instances/{}/theme", instance["id"].as_str().unwrap());

    let (status, _) = fixture
        .put(
            TENANT_A,
            &path,
            json!({ "themeOverrides": { "primary": "#123456" }, "expectedRevision": 1 }),
        )
        .await;
    assert_eq!(status, 200);

    // Second writer still holds revision 1
    let (status, body) = fixture
        .put(
            TENANT_A,
            &path,
            json!({ "themeOverrides": { "primary": "#654321" }, "expectedRevision": 1 }),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "CONFLICT");
    assert_eq!(body["error"]["details"]["currentRevision"], 2);

    let (_, body) = fixture
        .get(
            TENANT_A,
            &format!("/api/instances/{}", instance["id"].as_str().unwrap()),
        )
        .await;
    assert_eq!(body["data"]["themeOverrides"]["primary"], "#123456");
}

#[tokio::test]
async fn test_end_to_end_build_and_repin() {
    let fixture = TestFixture::new().await;
    let (template_id, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap().to_string();

    fixture
        .content
        .insert("plans", Some("p1"), json!([{ "name": "Pro" }, { "name": "Team" }]))
        .await;

    let (status, _) = fixture
        .put(
            TENANT_A,
            &format!("/api/instances/{}/bindings", instance_id),
            json!({ "contentBindings": [
                { "sectionId": "pricing", "bindingType": "plans", "resourceId": "p1" }
            ]}),
        )
        .await;
    assert_eq!(status, 200);

    let (status, _) = fixture
        .put(
            TENANT_A,
            &format!("/api/instances/{}/theme", instance_id),
            json!({
                "themeOverrides": { "primary": "#ff0000" },
                "sectionOverrides": { "pricing": { "padding": 32 } },
                "customCss": ".hero { margin: 0 }"
            }),
        )
        .await;
    assert_eq!(status, 200);

    let (status, body) = fixture.deploy(TENANT_A, &instance_id, "web").await;
    assert_eq!(status, 200, "{}", body);
    let first = body["data"].clone();
    assert_eq!(first["status"], "live");
    assert_eq!(first["version"], 1);
    assert_eq!(first["liveUrl"], "http://live.test/tenant-a/web/spring-sale");

    let screen = resolved(&first);
    assert_eq!(screen["templateVersion"], 1);
    assert_eq!(screen["theme"], json!({ "fontFamily": "Inter", "primary": "#ff0000" }));
    assert_eq!(screen["sections"][0]["style"], json!({ "padding": 8, "primary": "#ff0000" }));
    assert_eq!(screen["sections"][0]["source"], "static");
    assert_eq!(screen["sections"][1]["style"], json!({ "padding": 32, "primary": "#ff0000" }));
    assert_eq!(screen["sections"][1]["data"], json!([{ "name": "Pro" }, { "name": "Team" }]));
    assert_eq!(screen["sections"][1]["source"], "bound");
    assert_eq!(screen["customCss"], ".hero { margin: 0 }");
    assert_eq!(screen["componentVersions"], json!({ "hero": "2.1.0" }));

    // The render endpoint serves the stored artifact byte-for-byte
    let (status, _) = fixture.put(TENANT_A, "/api/tenant", json!({ "slug": "acme" })).await;
    assert_eq!(status, 200);
    let (status, text) = fixture.render("acme", "web", "spring-sale").await;
    assert_eq!(status, 200);
    assert_eq!(text, first["resolvedJson"].as_str().unwrap());

    // Publish v2 with an extra section; the instance stays on v1
    let mut v2_screen = hero_pricing_screen();
    v2_screen["sections"]
        .as_array_mut()
        .unwrap()
        .push(json!({ "id": "faq", "type": "faq", "props": { "items": 4 } }));
    let (status, _) = fixture
        .post(
            TENANT_A,
            &format!("/api/templates/{}/versions", template_id),
            json!({ "screenJson": v2_screen, "themeJson": { "primary": "#111111", "fontFamily": "Inter" } }),
        )
        .await;
    assert_eq!(status, 200);

    let (status, body) = fixture.deploy(TENANT_A, &instance_id, "web").await;
    assert_eq!(status, 200);
    let second = body["data"].clone();
    assert_eq!(second["version"], 2);
    assert_eq!(resolved(&second)["templateVersion"], 1);
    assert_eq!(resolved(&second)["sections"].as_array().unwrap().len(), 2);

    // Repin to the current version, then build again
    let (_, body) = fixture
        .get(TENANT_A, &format!("/api/instances/{}", instance_id))
        .await;
    let revision = body["data"]["revision"].as_i64().unwrap();
    let (status, body) = fixture
        .post(
            TENANT_A,
            &format!("/api/instances/{}/repin", instance_id),
            json!({ "expectedRevision": revision }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);

    let (status, body) = fixture.deploy(TENANT_A, &instance_id, "web").await;
    assert_eq!(status, 200);
    let third = body["data"].clone();
    let screen = resolved(&third);
    assert_eq!(screen["templateVersion"], 2);
    assert_eq!(screen["sections"][2]["id"], "faq");

    // Only the newest web deployment is live
    let (_, body) = fixture
        .get(
            TENANT_A,
            &format!("/api/instances/{}/deployments?platform=web", instance_id),
        )
        .await;
    let statuses: Vec<(i64, String)> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| {
            (
                d["version"].as_i64().unwrap(),
                d["status"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            (3, "live".to_string()),
            (2, "superseded".to_string()),
            (1, "superseded".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_platforms_are_independent() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();

    let (_, web) = fixture.deploy(TENANT_A, instance_id, "web").await;
    let (_, tv) = fixture.deploy(TENANT_A, instance_id, "tv").await;
    assert_eq!(web["data"]["version"], 1);
    assert_eq!(tv["data"]["version"], 1);
    assert_eq!(web["data"]["status"], "live");
    assert_eq!(tv["data"]["status"], "live");
    assert_eq!(resolved(&tv["data"])["platform"], "tv");

    let (status, body) = fixture.deploy(TENANT_A, instance_id, "watch").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_degraded_build_goes_live_with_warning() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();

    fixture
        .content
        .fail("plans", None, ContentError::Unavailable("connection refused".into()))
        .await;
    fixture
        .put(
            TENANT_A,
            &format!("/api/instances/{}/bindings", instance_id),
            json!({ "contentBindings": [{ "sectionId": "pricing", "bindingType": "plans" }] }),
        )
        .await;

    let (status, body) = fixture.deploy(TENANT_A, instance_id, "mobile").await;
    assert_eq!(status, 200);
    let deployment = body["data"].clone();
    assert_eq!(deployment["status"], "live");

    let screen = resolved(&deployment);
    assert_eq!(screen["sections"][1]["data"], json!([{ "name": "Free" }]));
    assert_eq!(screen["sections"][1]["source"], "static");

    let (status, body) = fixture
        .get(
            TENANT_A,
            &format!("/api/deployments/{}/logs", deployment["id"].as_str().unwrap()),
        )
        .await;
    assert_eq!(status, 200);
    let logs = body["data"].as_array().unwrap();
    let degraded: Vec<&Value> = logs
        .iter()
        .filter(|l| l["code"] == "BUILD_DEGRADED")
        .collect();
    assert_eq!(degraded.len(), 1);
    assert_eq!(degraded[0]["level"], "warn");
    assert!(degraded[0]["message"].as_str().unwrap().contains("pricing"));
}

#[tokio::test]
async fn test_failed_build_keeps_previous_live() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();
    fixture.put(TENANT_A, "/api/tenant", json!({ "slug": "acme" })).await;

    let (_, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    let first = body["data"].clone();

    fixture.publisher.failing.store(true, Ordering::SeqCst);
    let (status, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    assert_eq!(status, 422);
    assert_eq!(body["error"]["code"], "BUILD_FAILED");
    let failed_id = body["error"]["details"]["deploymentId"]
        .as_str()
        .unwrap()
        .to_string();

    let (_, body) = fixture
        .get(TENANT_A, &format!("/api/deployments/{}", failed_id))
        .await;
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["version"], 2);
    assert!(body["data"]["error"].as_str().unwrap().contains("upload rejected"));
    assert!(body["data"].get("resolvedJson").is_none());

    let (_, body) = fixture
        .get(TENANT_A, &format!("/api/deployments/{}/logs", failed_id))
        .await;
    let last = body["data"].as_array().unwrap().last().unwrap().clone();
    assert_eq!(last["level"], "error");
    assert_eq!(last["code"], "BUILD_FAILED");

    // The previous deployment still serves
    let (_, body) = fixture
        .get(TENANT_A, &format!("/api/deployments/{}", first["id"].as_str().unwrap()))
        .await;
    assert_eq!(body["data"]["status"], "live");
    let (status, text) = fixture.render("acme", "web", "spring-sale").await;
    assert_eq!(status, 200);
    assert_eq!(text, first["resolvedJson"].as_str().unwrap());

    // A failed deployment is not a rollback target
    let (status, _) = fixture
        .post(
            TENANT_A,
            &format!("/api/deployments/{}/rollback", failed_id),
            json!({}),
        )
        .await;
    assert_eq!(status, 400);

    // Failures do not block later builds
    fixture.publisher.failing.store(false, Ordering::SeqCst);
    let (status, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["version"], 3);
}

#[tokio::test]
async fn test_rollback_reuses_stored_artifact() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();
    fixture.put(TENANT_A, "/api/tenant", json!({ "slug": "acme" })).await;
    fixture
        .put(
            TENANT_A,
            &format!("/api/instances/{}/bindings", instance_id),
            json!({ "contentBindings": [{ "sectionId": "pricing", "bindingType": "plans" }] }),
        )
        .await;

    fixture.content.insert("plans", None, json!([{ "name": "Pro" }])).await;
    let (_, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    let first = body["data"].clone();

    fixture.content.insert("plans", None, json!([{ "name": "Enterprise" }])).await;
    let (_, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    let second = body["data"].clone();
    assert_ne!(first["resolvedJson"], second["resolvedJson"]);

    // Content is now unavailable; rollback must not need it
    fixture
        .content
        .fail("plans", None, ContentError::Unavailable("down".into()))
        .await;

    let (status, body) = fixture
        .post(
            TENANT_A,
            &format!("/api/deployments/{}/rollback", first["id"].as_str().unwrap()),
            json!({}),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["data"]["status"], "live");
    assert_eq!(body["data"]["resolvedJson"], first["resolvedJson"]);
    assert_eq!(body["data"]["liveUrl"], first["liveUrl"]);

    let (_, body) = fixture
        .get(TENANT_A, &format!("/api/deployments/{}", second["id"].as_str().unwrap()))
        .await;
    assert_eq!(body["data"]["status"], "superseded");

    let (status, text) = fixture.render("acme", "web", "spring-sale").await;
    assert_eq!(status, 200);
    assert_eq!(text, first["resolvedJson"].as_str().unwrap());

    let (_, body) = fixture
        .get(
            TENANT_A,
            &format!("/api/deployments/{}/logs", first["id"].as_str().unwrap()),
        )
        .await;
    assert!(body["data"]
        .as_array()
        .unwrap()
        .iter()
        .any(|l| l["code"] == "ROLLBACK"));
}

#[tokio::test]
async fn test_rollback_to_live_is_noop() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();

    let (_, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    let live = body["data"].clone();
    let path = format!("/api/deployments/{}/rollback", live["id"].as_str().unwrap());

    for _ in 0..2 {
        let (status, body) = fixture.post(TENANT_A, &path, json!({})).await;
        assert_eq!(status, 200);
        assert_eq!(body["data"]["status"], "live");
        assert_eq!(body["data"]["resolvedJson"], live["resolvedJson"]);
    }

    let (_, body) = fixture
        .get(
            TENANT_A,
            &format!("/api/instances/{}/deployments", instance_id),
        )
        .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_at_most_one_live_under_concurrency() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();

    // Concurrent builds of one pair: the rest are refused while one is in flight
    let results = join_all((0..6).map(|_| fixture.deploy(TENANT_A, instance_id, "web"))).await;
    assert!(results.iter().any(|(status, _)| *status == 200));
    for (status, body) in &results {
        assert!(*status == 200 || *status == 409, "{} {}", status, body);
    }

    let (_, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    let latest_id = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = fixture
        .get(
            TENANT_A,
            &format!("/api/instances/{}/deployments?platform=web", instance_id),
        )
        .await;
    let ids: Vec<String> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap().to_string())
        .collect();
    assert!(ids.len() >= 2);

    // Concurrent rollbacks across the history
    let fixture = &fixture;
    let rollbacks = ids.iter().chain(std::iter::once(&latest_id)).map(|id| {
        let path = format!("/api/deployments/{}/rollback", id);
        async move { fixture.post(TENANT_A, &path, json!({})).await }
    });
    for (status, body) in join_all(rollbacks).await {
        assert!(status == 200 || status == 409, "{} {}", status, body);
    }

    let (_, body) = fixture
        .get(
            TENANT_A,
            &format!("/api/instances/{}/deployments?platform=web", instance_id),
        )
        .await;
    let live = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|d| d["status"] == "live")
        .count();
    assert_eq!(live, 1);
}

#[tokio::test]
async fn test_build_racing_rollback_keeps_one_live() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();
    let list_path = format!("/api/instances/{}/deployments?platform=web", instance_id);

    let (status, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    assert_eq!(status, 200);
    let first_id = body["data"]["id"].as_str().unwrap().to_string();
    let rollback_path = format!("/api/deployments/{}/rollback", first_id);

    for round in 0..8 {
        let ((build_status, build), (rollback_status, rollback)) = tokio::join!(
            fixture.deploy(TENANT_A, instance_id, "web"),
            fixture.post(TENANT_A, &rollback_path, json!({})),
        );
        assert!(
            build_status == 200 || build_status == 409,
            "round {}: {} {}",
            round,
            build_status,
            build
        );
        assert!(
            rollback_status == 200 || rollback_status == 409,
            "round {}: {} {}",
            round,
            rollback_status,
            rollback
        );

        let (_, body) = fixture.get(TENANT_A, &list_path).await;
        let live: Vec<&Value> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|d| d["status"] == "live")
            .collect();
        assert_eq!(live.len(), 1, "round {}: {}", round, body);
    }
}

#[tokio::test]
async fn test_repin_rejects_dangling_sections() {
    let fixture = TestFixture::new().await;
    let (template_id, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();

    fixture
        .put(
            TENANT_A,
            &format!("/api/instances/{}/bindings", instance_id),
            json!({ "contentBindings": [{ "sectionId": "pricing", "bindingType": "plans" }] }),
        )
        .await;

    // v2 drops the pricing section
    fixture
        .post(
            TENANT_A,
            &format!("/api/templates/{}/versions", template_id),
            json!({ "screenJson": { "sections": [{ "id": "hero", "type": "hero" }] } }),
        )
        .await;

    let (status, body) = fixture
        .post(
            TENANT_A,
            &format!("/api/instances/{}/repin", instance_id),
            json!({ "version": 2 }),
        )
        .await;
    assert_eq!(status, 400);
    assert!(body["error"]["message"].as_str().unwrap().contains("pricing"));

    let (status, _) = fixture
        .post(
            TENANT_A,
            &format!("/api/instances/{}/repin", instance_id),
            json!({ "version": 7 }),
        )
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_tenant_isolation() {
    let fixture = TestFixture::new().await;
    let (template_id, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let instance_id = instance["id"].as_str().unwrap();
    let (_, body) = fixture.deploy(TENANT_A, instance_id, "web").await;
    let deployment_id = body["data"]["id"].as_str().unwrap().to_string();

    for path in [
        format!("/api/templates/{}", template_id),
        format!("/api/templates/{}/versions", template_id),
        format!("/api/instances/{}", instance_id),
        format!("/api/instances/{}/deployments", instance_id),
        format!("/api/deployments/{}", deployment_id),
        format!("/api/deployments/{}/logs", deployment_id),
    ] {
        let (status, body) = fixture.get(TENANT_B, &path).await;
        assert_eq!(status, 404, "{}", path);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    let (status, _) = fixture.deploy(TENANT_B, instance_id, "web").await;
    assert_eq!(status, 404);
    let (status, _) = fixture
        .post(
            TENANT_B,
            &format!("/api/deployments/{}/rollback", deployment_id),
            json!({}),
        )
        .await;
    assert_eq!(status, 404);
    let (status, _) = fixture
        .post(
            TENANT_B,
            "/api/instances",
            json!({ "templateId": template_id, "name": "Stolen" }),
        )
        .await;
    assert_eq!(status, 404);

    let (_, body) = fixture.get(TENANT_B, "/api/templates").await;
    assert_eq!(body["data"], json!([]));
    let (_, body) = fixture.get(TENANT_B, "/api/instances").await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_starter_templates_are_shared() {
    let fixture = TestFixture::new().await;
    let (status, body) = fixture
        .post(
            TENANT_A,
            "/api/templates",
            json!({
                "name": "Starter Landing",
                "category": "starter",
                "isStarter": true,
                "initialScreenJson": hero_pricing_screen()
            }),
        )
        .await;
    assert_eq!(status, 200);
    let template_id = body["data"]["template"]["id"].as_str().unwrap().to_string();

    let (_, body) = fixture.get(TENANT_B, "/api/templates").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = fixture
        .post(
            TENANT_B,
            "/api/instances",
            json!({ "templateId": template_id, "name": "My Landing" }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["creatorId"], TENANT_B);

    // Only the owner may publish
    let (_, before) = fixture
        .get(TENANT_A, &format!("/api/templates/{}", template_id))
        .await;
    let (status, _) = fixture
        .post(
            TENANT_B,
            &format!("/api/templates/{}/versions", template_id),
            json!({ "screenJson": { "sections": [] } }),
        )
        .await;
    assert_eq!(status, 404);
    let (_, after) = fixture
        .get(TENANT_A, &format!("/api/templates/{}", template_id))
        .await;
    assert_eq!(after["data"]["currentVersionId"], before["data"]["currentVersionId"]);

    let (_, body) = fixture
        .get(TENANT_A, &format!("/api/templates/{}/versions", template_id))
        .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // Only the owner may archive
    let (status, _) = fixture
        .post(
            TENANT_B,
            &format!("/api/templates/{}/archive", template_id),
            json!({}),
        )
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_render_not_found() {
    let fixture = TestFixture::new().await;
    let (_, instance) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    fixture.put(TENANT_A, "/api/tenant", json!({ "slug": "acme", "domain": "Acme.Example.com" })).await;

    // Nothing deployed yet
    let (status, _) = fixture.render("acme", "web", "spring-sale").await;
    assert_eq!(status, 404);

    fixture
        .deploy(TENANT_A, instance["id"].as_str().unwrap(), "web")
        .await;

    let (status, _) = fixture.render("acme.example.com", "web", "Spring-Sale/").await;
    assert_eq!(status, 200);

    let (status, _) = fixture.render("unknown", "web", "spring-sale").await;
    assert_eq!(status, 404);
    let (status, _) = fixture.render("acme", "watch", "spring-sale").await;
    assert_eq!(status, 404);
    let (status, _) = fixture.render("acme", "tv", "spring-sale").await;
    assert_eq!(status, 404);
    let (status, _) = fixture.render("acme", "web", "missing").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_domain_match_beats_slug_match() {
    let fixture = TestFixture::new().await;
    let (_, instance_a) =
        create_template_and_instance(&fixture, TENANT_A, hero_pricing_screen()).await;
    let (_, instance_b) =
        create_template_and_instance(&fixture, TENANT_B, hero_pricing_screen()).await;
    fixture
        .deploy(TENANT_A, instance_a["id"].as_str().unwrap(), "web")
        .await;
    fixture
        .deploy(TENANT_B, instance_b["id"].as_str().unwrap(), "web")
        .await;

    let (status, _) = fixture.put(TENANT_A, "/api/tenant", json!({ "slug": "acme" })).await;
    assert_eq!(status, 200);
    let (status, _) = fixture
        .put(TENANT_B, "/api/tenant", json!({ "slug": "bravo", "domain": "ACME" }))
        .await;
    assert_eq!(status, 200);

    for _ in 0..5 {
        let (status, body) = fixture.render("acme", "web", "spring-sale").await;
        assert_eq!(status, 200);
        let artifact: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(artifact["instanceId"], instance_b["id"]);
    }

    let (_, body) = fixture.render("bravo", "web", "spring-sale").await;
    let artifact: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(artifact["instanceId"], instance_b["id"]);
}

#[tokio::test]
async fn test_tenant_route_conflict() {
    let fixture = TestFixture::new().await;

    let (status, body) = fixture.put(TENANT_A, "/api/tenant", json!({ "slug": "Acme" })).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["slug"], "acme");

    let (status, body) = fixture.put(TENANT_B, "/api/tenant", json!({ "slug": "acme" })).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "CONFLICT");

    // Re-registering the same tenant replaces its route
    let (status, _) = fixture.put(TENANT_A, "/api/tenant", json!({ "slug": "acme-co" })).await;
    assert_eq!(status, 200);
    let (status, _) = fixture.put(TENANT_B, "/api/tenant", json!({ "slug": "acme" })).await;
    assert_eq!(status, 200);
}
