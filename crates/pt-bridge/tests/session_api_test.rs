use std::sync::Arc;

use pt_bridge::http_api::{api_router, ApiState};
use pt_core::config::Config;
use pt_core::naming::build_session_name;
use pt_session::testing::{FakeTmux, LocalShellAttacher};
use serde_json::Value;

const TOKEN: &str = "session-api-token";

/// Spin up an API server backed by `fake` on a random port.
async fn start_test_server(fake: &FakeTmux) -> (String, Arc<ApiState>) {
    let state = Arc::new(ApiState::with_backends(
        Config::default(),
        TOKEN,
        Arc::new(fake.clone()),
        Arc::new(LocalShellAttacher::cat()),
    ));
    let router = api_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}"), state)
}

fn session(id: &str) -> String {
    build_session_name(TOKEN, Some(id)).unwrap().to_string()
}

// ===========================================================================
// Health and auth
// ===========================================================================

#[tokio::test]
async fn health_needs_no_credential() {
    let fake = FakeTmux::new();
    let (base, _state) = start_test_server(&fake).await;

    let resp = reqwest::get(format!("{base}/api/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert!(body["uptime_seconds"].is_number());
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn session_routes_reject_missing_or_wrong_credential() {
    let fake = FakeTmux::new();
    let (base, _state) = start_test_server(&fake).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/api/sessions")).send().await.unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let resp = client
        .delete(format!("{base}/api/sessions/abc"))
        .header("X-API-Key", "not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn bearer_and_api_key_headers_both_work() {
    let fake = FakeTmux::new();
    let (base, _state) = start_test_server(&fake).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/api/sessions"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{base}/api/sessions"))
        .header("X-API-Key", TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

// ===========================================================================
// Listing
// ===========================================================================

#[tokio::test]
async fn list_is_scoped_to_the_callers_prefix() {
    let fake = FakeTmux::new();
    fake.insert_session(&session("one"), 1_700_000_000, 0);
    fake.insert_session(&session("two"), 1_700_000_100, 1);
    fake.insert_session(&build_session_name(TOKEN, None).unwrap().to_string(), 1_700_000_200, 0);
    fake.insert_session(&build_session_name("someone-else", Some("one")).unwrap().to_string(), 1_700_000_000, 0);
    fake.insert_session("scratch", 1_700_000_000, 0);
    let (base, _state) = start_test_server(&fake).await;

    let resp = reqwest::Client::new()
        .get(format!("{base}/api/sessions"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(body.len(), 3);

    let mut ids: Vec<Value> = body.iter().map(|s| s["session_id"].clone()).collect();
    ids.sort_by_key(|v| v.to_string());
    assert!(ids.contains(&Value::Null));
    assert!(ids.contains(&Value::from("one")));
    assert!(ids.contains(&Value::from("two")));

    let two = body.iter().find(|s| s["session_id"] == "two").unwrap();
    assert_eq!(two["attached"], true);
    assert_eq!(two["name"], session("two"));
    let one = body.iter().find(|s| s["session_id"] == "one").unwrap();
    assert_eq!(one["attached"], false);
}

#[tokio::test]
async fn list_without_tmux_server_is_empty() {
    let fake = FakeTmux::new();
    let (base, _state) = start_test_server(&fake).await;

    let body: Vec<Value> = reqwest::Client::new()
        .get(format!("{base}/api/sessions"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body.is_empty());
}

// ===========================================================================
// Kill
// ===========================================================================

#[tokio::test]
async fn delete_kills_and_is_idempotent() {
    let fake = FakeTmux::new();
    fake.insert_session(&session("doomed"), 1_700_000_000, 0);
    let (base, _state) = start_test_server(&fake).await;
    let client = reqwest::Client::new();

    for _ in 0..2 {
        let resp = client
            .delete(format!("{base}/api/sessions/doomed"))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "killed");
        assert_eq!(body["session_id"], "doomed");
    }
    assert!(!fake.has(&session("doomed")));

    let kill = &fake.calls_for("kill-session")[0];
    assert_eq!(kill[2], format!("={}", session("doomed")));
}

#[tokio::test]
async fn malformed_id_is_rejected_before_tmux() {
    let fake = FakeTmux::new();
    let (base, _state) = start_test_server(&fake).await;
    let client = reqwest::Client::new();

    for bad in ["x;rm", "a%20b", "a.b", "semi%3Bcolon"] {
        let resp = client
            .delete(format!("{base}/api/sessions/{bad}"))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400, "session id {bad:?}");
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].is_string());
    }
    assert!(fake.calls().is_empty(), "issued {:?}", fake.calls());
}

// ===========================================================================
// Introspection
// ===========================================================================

#[tokio::test]
async fn cwd_and_foreground_report_the_active_pane() {
    let fake = FakeTmux::new();
    fake.insert_session(&session("work"), 1_700_000_000, 0);
    fake.set_foreground(&session("work"), "/srv/project", "vim");
    let (base, _state) = start_test_server(&fake).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{base}/api/sessions/work/cwd"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["session_id"], "work");
    assert_eq!(body["cwd"], "/srv/project");

    let body: Value = client
        .get(format!("{base}/api/sessions/work/foreground"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["command"], "vim");
}

#[tokio::test]
async fn introspecting_a_missing_session_is_not_found() {
    let fake = FakeTmux::new();
    let (base, _state) = start_test_server(&fake).await;
    let client = reqwest::Client::new();

    for path in ["cwd", "foreground"] {
        let resp = client
            .get(format!("{base}/api/sessions/ghost/{path}"))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404, "{path}");
    }
}
