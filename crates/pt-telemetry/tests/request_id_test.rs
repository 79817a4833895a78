use axum::{body::Body, http::Request, middleware, routing::get, Router};
use pt_telemetry::request_id::request_id_middleware;
use tower::ServiceExt;

fn app() -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .layer(middleware::from_fn(request_id_middleware))
}

#[tokio::test]
async fn generates_request_id_when_missing() {
    let resp = app()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let id = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn echoes_caller_request_id() {
    let resp = app()
        .oneshot(
            Request::builder()
                .uri("/")
                .header("X-Request-Id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.headers().get("x-request-id").unwrap(), "abc-123");
}
