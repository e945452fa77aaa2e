//! Integration tests for the HTTP API
//!
//! These tests exercise the API endpoints using tower::ServiceExt::oneshot()
//! without starting a real server or requiring network access.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use syncbridge::{
    Config, MemoryService, QueryMatchStrategy, RootCatalog, ServiceRegistry, Store, SyncEngine,
};
use syncbridge_server::{api, db::TokenRegistry, AppState};
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

const PASSWORD: &str = "test-password";

struct TestServer {
    _temp_dir: TempDir,
    _shutdown: watch::Sender<bool>,
    state: Arc<AppState>,
    alice: String,
    bob: String,
}

impl TestServer {
    /// A hub with a seeded `todos` service, owner checks on `username`
    /// and tokens for alice and bob.
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(temp_dir.path());
        let store = Arc::new(Store::new(&config).unwrap());
        let root = RootCatalog::load_or_create(&store, &config).await.unwrap();

        let todos = MemoryService::new("id").with_records(vec![
            json!({"id": "1", "title": "Buy milk", "username": "alice"}),
            json!({"id": "2", "title": "Walk dog", "username": "bob"}),
        ]);
        let services = ServiceRegistry::new().with("todos", Arc::new(todos)).unwrap();
        let strategy = QueryMatchStrategy::new(services.clone()).with_owner_field("username");
        let engine = SyncEngine::start(Arc::clone(&store), root, services, Arc::new(strategy), &config)
            .await
            .unwrap();

        let tokens = Arc::new(TokenRegistry::open(&config.tokens_db_path()).unwrap());
        let alice = tokens.issue("alice-laptop", Some("alice")).unwrap();
        let bob = tokens.issue("bob-phone", Some("bob")).unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(AppState::new(
            engine,
            store,
            tokens,
            PASSWORD,
            Duration::from_secs(5),
            shutdown_rx,
        ));

        Self {
            _temp_dir: temp_dir,
            _shutdown: shutdown,
            state,
            alice,
            bob,
        }
    }

    fn app(&self) -> Router {
        api::router(Arc::clone(&self.state))
    }
}

/// Helper to read a response body as JSON
async fn body_json(body: Body) -> Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn send_json(method: &str, uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = TestServer::new().await;

    let resp = server.app().oneshot(get("/health", None)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn test_catalog_requires_token() {
    let server = TestServer::new().await;

    let resp = server.app().oneshot(get("/catalog", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .app()
        .oneshot(get("/catalog", Some("sb_not_issued")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .app()
        .oneshot(get("/catalog", Some(&server.alice)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp.into_body()).await;
    assert_eq!(
        body["rootDocumentId"],
        json!(server.state.engine.root().url().as_str())
    );
}

#[tokio::test]
async fn test_create_partition() {
    let server = TestServer::new().await;
    let query = json!({"username": "alice"});

    let resp = server
        .app()
        .oneshot(send_json("POST", "/automerge", Some(&server.alice), &query))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let entry = body_json(resp.into_body()).await;
    assert_eq!(entry["query"], query);
    let url = entry["url"].as_str().unwrap().to_string();

    // Same query returns the same partition
    let resp = server
        .app()
        .oneshot(send_json("POST", "/automerge", Some(&server.alice), &query))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(body_json(resp.into_body()).await["url"], json!(url));

    let resp = server
        .app()
        .oneshot(get(&format!("/automerge/{url}"), Some(&server.alice)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let snapshot = body_json(resp.into_body()).await;
    assert_eq!(snapshot["todos"]["1"]["title"], json!("Buy milk"));
    assert!(snapshot["todos"].get("2").is_none());
}

#[tokio::test]
async fn test_partition_owner_checks() {
    let server = TestServer::new().await;
    let query = json!({"username": "alice"});

    // Bob cannot create alice's partition
    let resp = server
        .app()
        .oneshot(send_json("POST", "/automerge", Some(&server.bob), &query))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = server
        .app()
        .oneshot(send_json("POST", "/automerge", Some(&server.alice), &query))
        .await
        .unwrap();
    let url = body_json(resp.into_body()).await["url"]
        .as_str()
        .unwrap()
        .to_string();

    // ... cannot see it
    let resp = server
        .app()
        .oneshot(get("/automerge", Some(&server.bob)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp.into_body()).await, json!([]));

    let resp = server
        .app()
        .oneshot(get(&format!("/automerge/{url}"), Some(&server.bob)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // ... and cannot delete it
    let resp = server
        .app()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/automerge/{url}"))
                .header("authorization", format!("Bearer {}", server.bob))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = server
        .app()
        .oneshot(get("/automerge", Some(&server.alice)))
        .await
        .unwrap();
    let listed = body_json(resp.into_body()).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["url"], json!(url));
}

#[tokio::test]
async fn test_remove_partition() {
    let server = TestServer::new().await;
    let query = json!({"username": "alice"});

    let resp = server
        .app()
        .oneshot(send_json("POST", "/automerge", Some(&server.alice), &query))
        .await
        .unwrap();
    let url = body_json(resp.into_body()).await["url"]
        .as_str()
        .unwrap()
        .to_string();

    let delete = |token: &str| {
        Request::builder()
            .method("DELETE")
            .uri(format!("/automerge/{url}"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };

    let resp = server.app().oneshot(delete(&server.alice)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp.into_body()).await["url"], json!(url));
    assert!(server.state.engine.root().entries().unwrap().is_empty());

    let resp = server.app().oneshot(delete(&server.alice)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_partition_url() {
    let server = TestServer::new().await;

    let resp = server
        .app()
        .oneshot(get("/automerge/not-a-document", Some(&server.alice)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .app()
        .oneshot(get(
            "/automerge/automerge:0123456789abcdef0123456789abcdef",
            Some(&server.alice),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sync_rejects_before_upgrade() {
    let server = TestServer::new().await;

    let resp = server.app().oneshot(get("/sync", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .app()
        .oneshot(get("/sync?access_token=sb_not_issued", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // A valid token gets past authentication; the plain GET then fails the
    // WebSocket handshake instead.
    let resp = server
        .app()
        .oneshot(get(&format!("/sync?access_token={}", server.alice), None))
        .await
        .unwrap();
    assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn test_token_management() {
    let server = TestServer::new().await;

    let resp = server
        .app()
        .oneshot(send_json(
            "POST",
            "/tokens",
            None,
            &json!({"password": "wrong", "name": "carol"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .app()
        .oneshot(send_json(
            "POST",
            "/tokens",
            None,
            &json!({"password": PASSWORD, "name": "carol", "user": "carol"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let issued = body_json(resp.into_body()).await;
    assert_eq!(issued["name"], json!("carol"));
    let token = issued["token"].as_str().unwrap().to_string();

    let resp = server
        .app()
        .oneshot(get("/automerge", Some(&token)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .app()
        .oneshot(send_json(
            "DELETE",
            "/tokens/carol",
            None,
            &json!({"password": PASSWORD}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = server
        .app()
        .oneshot(get("/automerge", Some(&token)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .app()
        .oneshot(send_json(
            "DELETE",
            "/tokens/carol",
            None,
            &json!({"password": PASSWORD}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
