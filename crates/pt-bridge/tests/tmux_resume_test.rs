//! End-to-end resume against a real tmux server on a private socket.
//! Skipped when tmux is not installed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pt_bridge::http_api::{api_router, ApiState};
use pt_core::config::Config;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const TOKEN: &str = "resume-test-token";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn tmux_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Kills the private tmux server when the test ends.
struct SocketGuard(String);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::process::Command::new("tmux")
            .args(["-L", &self.0, "kill-server"])
            .output();
    }
}

async fn start_server(socket: &str) -> String {
    let mut config = Config::default();
    config.tmux.socket_name = Some(socket.to_string());
    config.tmux.default_workdir = Some("/tmp".into());
    let state = Arc::new(ApiState::new(config, TOKEN));
    let router = api_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr.to_string()
}

async fn connect(addr: &str) -> Ws {
    let url = format!("ws://{addr}/ws?token={TOKEN}&sessionId=resume&cols=100&rows=30");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("handshake");
    ws
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn reconnect_resumes_with_state_intact() {
    if !tmux_available() {
        eprintln!("tmux not installed, skipping");
        return;
    }
    let socket = format!("pt-test-{}", uuid::Uuid::new_v4().simple());
    let _guard = SocketGuard(socket.clone());
    let addr = start_server(&socket).await;
    let workdir = tempfile::tempdir().unwrap();
    let workdir_path = workdir.path().canonicalize().unwrap();

    // First connection creates the session and changes its directory.
    let mut ws = connect(&addr).await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "connected", "resumed": false}));
    let command = format!("cd '{}' && echo resume-$((40+2))\n", workdir_path.display());
    ws.send(Message::Text(json!({"type": "input", "data": command}).to_string().into()))
        .await
        .unwrap();

    let mut seen = String::new();
    while !seen.contains("resume-42") {
        let msg = next_json(&mut ws).await;
        if msg["type"] == "output" {
            seen.push_str(msg["data"].as_str().unwrap());
        }
    }
    ws.close(None).await.unwrap();
    drop(ws);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Second connection resumes and replays the earlier output.
    let mut ws = connect(&addr).await;
    assert_eq!(next_json(&mut ws).await, json!({"type": "connected", "resumed": true}));
    let replay = next_json(&mut ws).await;
    assert_eq!(replay["type"], "scrollback");
    assert!(replay["data"].as_str().unwrap().contains("resume-42"));

    // The shell kept its working directory across the reconnect.
    let body: Value = reqwest::Client::new()
        .get(format!("http://{addr}/api/sessions/resume/cwd"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let cwd = std::path::PathBuf::from(body["cwd"].as_str().unwrap());
    assert_eq!(cwd.canonicalize().unwrap(), workdir_path);

    let resp = reqwest::Client::new()
        .delete(format!("http://{addr}/api/sessions/resume"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}
