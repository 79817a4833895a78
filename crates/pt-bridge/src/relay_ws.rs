//! The relay gateway: one task per WebSocket connection, pumping bytes
//! between the socket and a PTY attached to a tmux session.
//!
//! Lifecycle of a connection:
//!
//! 1. Authenticate and validate the session id. Failures close with 4001 or
//!    4002 before any tmux command runs.
//! 2. Create the tmux session if it does not exist (`resumed` records which).
//! 3. Claim the session in the [`ConnectionRegistry`]. A previous holder is
//!    evicted (closed with 4003) and its acknowledgement awaited, so the old
//!    client sees its close before the new one sees `connected`.
//! 4. Attach a [`PtyBridge`], send `connected`, then the history replay.
//! 5. Pump until the client leaves, a newer connection evicts this one, the
//!    attach subprocess exits, or the server shuts down. Teardown kills the bridge (detaching from
//!    tmux, never killing the session) and releases the registry entry.
//!
//! Three tasks cooperate: the pump (PTY output to the outbound queue, with
//! backpressure), the writer (sole owner of the socket sink, plus the
//! heartbeat), and the connection task itself (inbound messages and control
//! flow).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pt_core::naming::{build_session_name, SessionName};
use pt_session::bridge::{BridgeExit, PtyBridge};

use crate::auth::credential_from_headers;
use crate::flow::FlowControl;
use crate::http_api::ApiState;
use crate::origin::validate_websocket_origin;
use crate::protocol::{ClientMessage, CloseReason, ServerMessage, Utf8Stream};
use crate::registry::{ConnectionHandle, Eviction};

/// Coalescing stops once an `output` message reaches this many bytes.
pub const MAX_OUTPUT_MESSAGE_BYTES: usize = 32 * 1024;

/// How long a closing connection waits for the pump to forward the last
/// output of an exited subprocess.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// How long teardown waits for the writer to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Query parameters of `GET /ws`.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    pub token: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// GET /ws: relay WebSocket.
pub async fn relay_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(status) = validate_websocket_origin(&headers, &state.config.security.allowed_origins)
    {
        return status.into_response();
    }
    let header_token = credential_from_headers(&headers);
    ws.on_upgrade(move |socket| serve_connection(socket, state, params, header_token))
}

/// Resolve the session name, or the close reason if the handshake is bad.
/// Runs before any tmux command.
fn authorize(
    state: &ApiState,
    params: &HandshakeParams,
    header_token: Option<String>,
) -> Result<SessionName, CloseReason> {
    let token = params
        .token
        .clone()
        .or(header_token)
        .ok_or(CloseReason::AuthFailed)?;
    if !state.validator.validate(&token) {
        return Err(CloseReason::AuthFailed);
    }
    build_session_name(&token, params.session_id.as_deref())
        .map_err(|_| CloseReason::InvalidSessionId)
}

// ---------------------------------------------------------------------------
// Outbound queue and writer
// ---------------------------------------------------------------------------

enum Outbound {
    /// A message plus the number of flow-controlled bytes it carries.
    Message(ServerMessage, usize),
    Close(CloseReason),
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Owns the sink: serializes queued messages, releases their flow bytes
/// once written, and sends heartbeat pings. Ends after a close frame, when
/// the queue is closed, or when the socket fails.
async fn write_loop(
    mut sink: WsSink,
    queue: flume::Receiver<Outbound>,
    flow: Arc<FlowControl>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    loop {
        tokio::select! {
            next = queue.recv_async() => match next {
                Ok(Outbound::Message(msg, bytes)) => {
                    let sent = match msg.to_json() {
                        Ok(json) => sink.send(Message::Text(json.into())).await,
                        Err(e) => {
                            warn!("failed to encode relay message: {e}");
                            Ok(())
                        }
                    };
                    flow.release(bytes);
                    if sent.is_err() {
                        break;
                    }
                }
                Ok(Outbound::Close(reason)) => {
                    let frame = CloseFrame {
                        code: reason.code(),
                        reason: reason.reason().into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!("close frame not delivered: {e}");
                    }
                    break;
                }
                Err(_) => break,
            },
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!("heartbeat ping failed, connection lost");
                    break;
                }
            }
        }
    }
    // Unblock a pump waiting on capacity that will never be drained.
    flow.release(usize::MAX);
}

/// Wait for the writer to finish, aborting it if it hangs on a dead peer.
async fn finish_writer(writer: JoinHandle<()>) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("writer did not drain in time, aborting");
        abort.abort();
    }
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

/// Forward PTY output to the outbound queue in order, coalescing queued
/// chunks and pausing while the writer is behind. Ends when the PTY closes.
async fn pump_output(
    output: flume::Receiver<Vec<u8>>,
    queue: flume::Sender<Outbound>,
    flow: Arc<FlowControl>,
) {
    let mut decoder = Utf8Stream::new();
    loop {
        flow.wait_for_capacity().await;
        let Ok(mut buf) = output.recv_async().await else {
            break;
        };
        while buf.len() < MAX_OUTPUT_MESSAGE_BYTES {
            match output.try_recv() {
                Ok(more) => buf.extend_from_slice(&more),
                Err(_) => break,
            }
        }
        let data = decoder.decode(&buf);
        if data.is_empty() {
            continue;
        }
        let bytes = data.len();
        flow.acquire(bytes);
        if queue.send(Outbound::Message(ServerMessage::Output { data }, bytes)).is_err() {
            return;
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let bytes = rest.len();
        flow.acquire(bytes);
        let _ = queue.send(Outbound::Message(ServerMessage::Output { data: rest }, bytes));
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

enum Ending {
    ClientGone,
    Superseded(Eviction),
    Exited(Option<BridgeExit>),
    Shutdown,
}

struct Connection {
    id: Uuid,
    name: SessionName,
    state: Arc<ApiState>,
    queue: flume::Sender<Outbound>,
}

impl Connection {
    fn send(&self, msg: ServerMessage) {
        // The writer is gone only if the socket is; teardown follows.
        let _ = self.queue.send(Outbound::Message(msg, 0));
    }

    fn close(&self, reason: CloseReason) {
        let _ = self.queue.send(Outbound::Close(reason));
    }

    async fn handle_inbound(&self, msg: Message, bridge: &PtyBridge) -> bool {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(cmd) => self.handle_command(cmd, bridge).await,
                Err(e) => {
                    debug!(conn_id = %self.id, "unparseable client message: {e}");
                    self.send(ServerMessage::error(format!("invalid message: {e}")));
                }
            },
            Message::Binary(data) => {
                bridge.write(&data);
            }
            Message::Close(_) => return false,
            Message::Ping(_) | Message::Pong(_) => {}
        }
        true
    }

    async fn handle_command(&self, cmd: ClientMessage, bridge: &PtyBridge) {
        match cmd {
            ClientMessage::Input { data } => {
                bridge.write(data.as_bytes());
            }
            ClientMessage::Resize { cols, rows } => {
                if cols == 0 || rows == 0 {
                    self.send(ServerMessage::error("resize dimensions must be positive"));
                    return;
                }
                // Independent best-effort calls: either may fail alone.
                if let Err(e) = bridge.resize(cols, rows) {
                    warn!(session = %self.name, cols, rows, "PTY resize failed: {e}");
                }
                if let Err(e) = self.state.tmux.resize_session(&self.name, cols, rows).await {
                    debug!(session = %self.name, cols, rows, "tmux resize failed: {e}");
                }
            }
            ClientMessage::Ping => {
                self.send(ServerMessage::Pong {
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
            }
            ClientMessage::CaptureScrollback => {
                let max_lines = self.state.config.relay.capture_max_lines;
                match self.state.tmux.capture_scrollback(&self.name, max_lines).await {
                    Ok(data) => self.send(ServerMessage::ScrollbackContent { data }),
                    Err(e) => {
                        warn!(session = %self.name, "scrollback capture failed: {e}");
                        self.send(ServerMessage::error(format!("capture failed: {e}")));
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    socket: WebSocket,
    state: Arc<ApiState>,
    params: HandshakeParams,
    header_token: Option<String>,
) {
    let relay_cfg = state.config.relay.clone();
    let (sink, stream) = socket.split();
    let flow = Arc::new(FlowControl::new(
        relay_cfg.high_water_bytes,
        relay_cfg.low_water_bytes,
    ));
    let (queue, queue_rx) = flume::unbounded();
    let writer = tokio::spawn(write_loop(
        sink,
        queue_rx,
        flow.clone(),
        Duration::from_secs(relay_cfg.heartbeat_secs),
    ));

    let name = match authorize(&state, &params, header_token) {
        Ok(name) => name,
        Err(reason) => {
            info!(code = reason.code(), "relay handshake rejected: {}", reason.reason());
            let _ = queue.send(Outbound::Close(reason));
            drop(queue);
            finish_writer(writer).await;
            return;
        }
    };

    let conn = Connection {
        id: Uuid::new_v4(),
        name,
        state,
        queue,
    };
    let cols = params.cols.filter(|c| *c > 0).unwrap_or(relay_cfg.default_cols);
    let rows = params.rows.filter(|r| *r > 0).unwrap_or(relay_cfg.default_rows);
    info!(conn_id = %conn.id, session = %conn.name, cols, rows, "relay connection opened");

    let eviction = run_connection(&conn, stream, flow, cols, rows).await;

    let Connection { id, name, state, queue } = conn;
    if state.registry.release(&name, id) {
        debug!(conn_id = %id, session = %name, "released session");
    }
    drop(queue);
    finish_writer(writer).await;
    if let Some(eviction) = eviction {
        let _ = eviction.ack.send(());
    }
    info!(conn_id = %id, session = %name, "relay connection closed");
}

/// Serve one authenticated connection. Returns the eviction to acknowledge
/// when a newer connection superseded this one; the caller acknowledges
/// after the close frame has been written.
async fn run_connection(
    conn: &Connection,
    mut stream: WsStream,
    flow: Arc<FlowControl>,
    cols: u16,
    rows: u16,
) -> Option<Eviction> {
    let state = &conn.state;

    // Create or resume. A concurrent first connection may win the create;
    // its session is then resumed.
    let mut resumed = state.tmux.has_session(&conn.name).await;
    if !resumed {
        let workdir = state.config.tmux.workdir();
        match state.tmux.create_session(&conn.name, cols, rows, &workdir).await {
            Ok(()) => {}
            Err(e) if state.tmux.has_session(&conn.name).await => {
                debug!(session = %conn.name, "session created concurrently, resuming: {e}");
                resumed = true;
            }
            Err(e) => {
                warn!(session = %conn.name, "failed to create tmux session: {e}");
                conn.send(ServerMessage::error(format!("failed to create session: {e}")));
                conn.close(CloseReason::AttachFailed);
                return None;
            }
        }
    }

    // Claim, evicting any previous holder.
    let (evict_tx, evict_rx) = flume::bounded::<Eviction>(1);
    let handle = ConnectionHandle::new(conn.id, evict_tx.clone());
    if let Some(previous) = state.registry.claim(conn.name.clone(), handle) {
        info!(conn_id = %conn.id, session = %conn.name, evicted = %previous.id(), "superseding previous connection");
        let timeout = Duration::from_millis(state.config.relay.eviction_timeout_ms);
        if !previous.evict(timeout).await {
            debug!(session = %conn.name, evicted = %previous.id(), "eviction not acknowledged");
        }
    }

    // Attach.
    let attacher = state.attacher.clone();
    let target = conn.name.clone();
    let attached = tokio::task::spawn_blocking(move || attacher.attach(&target, cols, rows)).await;
    let mut bridge = match attached {
        Ok(Ok(bridge)) => bridge,
        Ok(Err(e)) => {
            warn!(session = %conn.name, "attach failed: {e}");
            conn.send(ServerMessage::error(format!("attach failed: {e}")));
            conn.close(CloseReason::AttachFailed);
            return None;
        }
        Err(e) => {
            warn!(session = %conn.name, "attach task failed: {e}");
            conn.send(ServerMessage::error("attach failed"));
            conn.close(CloseReason::AttachFailed);
            return None;
        }
    };
    let Some(exit_rx) = bridge.take_exit() else {
        conn.close(CloseReason::AttachFailed);
        return None;
    };

    conn.send(ServerMessage::Connected { resumed });
    let replay_lines = state.config.relay.scrollback_replay_lines;
    match state.tmux.capture_scrollback(&conn.name, replay_lines).await {
        Ok(data) if !data.trim().is_empty() => conn.send(ServerMessage::Scrollback { data }),
        Ok(_) => {}
        Err(e) => debug!(session = %conn.name, "history replay skipped: {e}"),
    }

    let mut pump = tokio::spawn(pump_output(bridge.output(), conn.queue.clone(), flow));
    let mut closing = state.shutdown_watch();
    // Owns the watch borrow so no `watch::Ref` lives in this future's state.
    let shutdown = async move {
        if closing.wait_for(|closing| *closing).await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(exit_rx);
    tokio::pin!(shutdown);

    let ending = loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(msg)) => {
                    if !conn.handle_inbound(msg, &bridge).await {
                        break Ending::ClientGone;
                    }
                }
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id, "socket error: {e}");
                    break Ending::ClientGone;
                }
                None => break Ending::ClientGone,
            },
            Ok(eviction) = evict_rx.recv_async() => break Ending::Superseded(eviction),
            exit = &mut exit_rx => break Ending::Exited(exit.ok()),
            _ = &mut shutdown => break Ending::Shutdown,
        }
    };
    drop(evict_tx);

    match ending {
        Ending::ClientGone => {
            debug!(conn_id = %conn.id, session = %conn.name, "client disconnected");
            bridge.kill();
            pump.abort();
            let _ = pump.await;
        }
        Ending::Superseded(eviction) => {
            info!(conn_id = %conn.id, session = %conn.name, "superseded by a newer connection");
            bridge.kill();
            pump.abort();
            let _ = pump.await;
            conn.close(CloseReason::Superseded);
            return Some(eviction);
        }
        Ending::Exited(exit) => {
            let status = exit
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown exit status".into());
            info!(conn_id = %conn.id, session = %conn.name, %status, "attach subprocess exited");
            if tokio::time::timeout(FINAL_FLUSH_TIMEOUT, &mut pump).await.is_err() {
                pump.abort();
            }
            conn.send(ServerMessage::error(format!("session ended ({status})")));
            conn.close(CloseReason::SessionEnded);
            bridge.kill();
        }
        Ending::Shutdown => {
            debug!(conn_id = %conn.id, session = %conn.name, "detaching for shutdown");
            bridge.kill();
            pump.abort();
            let _ = pump.await;
            conn.close(CloseReason::Shutdown);
        }
    }
    None
}
