use super::*;
use crate::config::{AuthConfig, StaticTokenConfig};
use crate::identity::{StaticTokenResolver, TokenResolver};
use crate::tasks::DownloadTaskService;
use crate::test_helpers::{TestEnv, test_env};
use crate::types::AccountId;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tower::ServiceExt; // for oneshot()


const ALICE_TOKEN: &str = "alice-token";
const BOB_TOKEN: &str = "bob-token";

/// Test environment plus a router wired to it
struct ApiHarness {
    env: TestEnv,
    state: AppState,
}

impl ApiHarness {
    async fn new() -> Self {
        let env = test_env().await;
        let tasks = Arc::new(DownloadTaskService::new(
            env.db.clone(),
            env.blobs.clone(),
            env.config.mq.topic.clone(),
            Arc::new(Notify::new()),
            env.config.api.max_page_size,
        ));
        let tokens: Arc<dyn TokenResolver> = Arc::new(StaticTokenResolver::new(&AuthConfig {
            tokens: vec![
                StaticTokenConfig {
                    token: ALICE_TOKEN.into(),
                    account_id: AccountId(1),
                    expires_at: None,
                },
                StaticTokenConfig {
                    token: BOB_TOKEN.into(),
                    account_id: AccountId(2),
                    expires_at: None,
                },
            ],
        }));
        Self {
            env,
            state: AppState::new(tasks, tokens),
        }
    }

    fn router(&self) -> Router {
        create_router(self.state.clone(), &self.env.config.api)
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router().oneshot(request).await.unwrap()
    }
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    match body {
        Some(json) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint_needs_no_token() {
    let harness = ApiHarness::new().await;

    let response = harness
        .send(request("GET", "/api/v1/health", None, None))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let harness = ApiHarness::new().await;

    let response = harness
        .send(request("GET", "/api/v1/nope", None, None))
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_task_routes_require_a_token() {
    let harness = ApiHarness::new().await;

    for (method, uri) in [
        ("GET", "/api/v1/tasks"),
        ("POST", "/api/v1/tasks"),
        ("GET", "/api/v1/tasks/1"),
        ("PATCH", "/api/v1/tasks/1"),
        ("DELETE", "/api/v1/tasks/1"),
        ("GET", "/api/v1/tasks/1/file"),
    ] {
        let response = harness.send(request(method, uri, None, None)).await;
        assert_eq!(
            response.status(),
            StatusCode::UNAUTHORIZED,
            "{} {} should require a token",
            method,
            uri
        );
    }
}

#[tokio::test]
async fn test_cors_enabled() {
    let harness = ApiHarness::new().await;
    let mut config = harness.env.config.api.clone();
    config.cors_enabled = true;
    config.cors_origins = vec!["*".to_string()];
    let app = create_router(harness.state.clone(), &config);

    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .contains_key("access-control-allow-origin"),
        "CORS header should be present when CORS is enabled"
    );
}

#[tokio::test]
async fn test_cors_disabled() {
    let harness = ApiHarness::new().await;
    let mut config = harness.env.config.api.clone();
    config.cors_enabled = false;
    let app = create_router(harness.state.clone(), &config);

    let request = Request::builder()
        .uri("/api/v1/health")
        .header("Origin", "http://localhost:3000")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert!(!response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn test_server_serves_and_shuts_down() {
    let harness = ApiHarness::new().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let state = harness.state.clone();
        let config = harness.env.config.api.clone();
        let shutdown = shutdown.clone();
        async move { serve(listener, state, &config, shutdown).await }
    });

    let response = reqwest::get(format!("http://{}/api/v1/health", address))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
