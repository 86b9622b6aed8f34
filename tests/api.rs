//! HTTP surface: authentication, stats JSON, dashboard and metrics

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use heapwatch::api::{create_app, ApiState, Credentials, DashboardTemplate};
use heapwatch::system::{stats::FIELD_NAMES, AgentMetrics, GaugeSink};
use tower::ServiceExt;

fn app(dashboard: DashboardTemplate) -> (Router, AgentMetrics) {
    let metrics = AgentMetrics::new().unwrap();
    let state = ApiState::new(
        Credentials::new("admin", "secret"),
        metrics.registry().clone(),
        dashboard,
    );
    (create_app(state), metrics)
}

fn get(uri: &str, auth: Option<(&str, &str)>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some((user, pass)) = auth {
        let encoded = STANDARD.encode(format!("{}:{}", user, pass));
        builder = builder.header(header::AUTHORIZATION, format!("Basic {}", encoded));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_stats_requires_credentials() {
    let (app, _) = app(DashboardTemplate::Builtin);
    let response = app.oneshot(get("/stats", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        r#"Basic realm="restricted""#
    );
}

#[tokio::test]
async fn test_stats_rejects_wrong_password() {
    let (app, _) = app(DashboardTemplate::Builtin);
    let response = app.oneshot(get("/stats", Some(("admin", "guess")))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn test_stats_returns_snapshot_json() {
    let (app, _) = app(DashboardTemplate::Builtin);
    let response = app.oneshot(get("/stats", Some(("admin", "secret")))).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );

    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    let object = body.as_object().unwrap();
    for name in FIELD_NAMES {
        let value = object.get(name).unwrap_or_else(|| panic!("missing {}", name));
        let number = value.as_f64().unwrap_or_else(|| panic!("{} is not a number", name));
        if name == "GCCPUFraction" {
            assert!((0.0..=1.0).contains(&number), "GCCPUFraction out of range: {}", number);
        } else {
            assert!(value.is_u64(), "{} is not a non-negative integer", name);
        }
    }
}

#[tokio::test]
async fn test_dashboard_served_with_credentials() {
    let (app, _) = app(DashboardTemplate::Builtin);

    let response = app.clone().oneshot(get("/dashboard", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(get("/dashboard", Some(("admin", "secret")))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/html"));
    assert!(body_string(response).await.contains("/stats"));
}

#[tokio::test]
async fn test_dashboard_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dashboard.html");
    std::fs::write(&path, "<html><body>custom</body></html>").unwrap();

    let (app, _) = app(DashboardTemplate::File(path));
    let response = app.oneshot(get("/dashboard", Some(("admin", "secret")))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "<html><body>custom</body></html>");
}

#[tokio::test]
async fn test_dashboard_missing_template_is_server_error() {
    let dir = tempfile::tempdir().unwrap();
    let (app, _) = app(DashboardTemplate::File(dir.path().join("absent.html")));

    let response = app.oneshot(get("/dashboard", Some(("admin", "secret")))).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_string(response).await.contains("absent.html"));
}

#[tokio::test]
async fn test_metrics_unauthenticated() {
    let (app, metrics) = app(DashboardTemplate::Builtin);
    metrics.memory_alloc.record(4096.0);

    let response = app.oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("# TYPE heapwatch_memory_alloc_bytes gauge"));
    assert!(body.contains("heapwatch_memory_alloc_bytes 4096"));
}
