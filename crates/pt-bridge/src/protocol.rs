//! JSON messages exchanged over the relay WebSocket.

use serde::{Deserialize, Serialize};

/// Client to relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Raw input for the terminal.
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    /// Full ANSI-preserving snapshot of the pane.
    CaptureScrollback,
}

/// Relay to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Output { data: String },
    /// Recent history replayed once per attach.
    Scrollback { data: String },
    /// Answer to [`ClientMessage::CaptureScrollback`].
    ScrollbackContent { data: String },
    Connected { resumed: bool },
    Error { error: String },
    /// Milliseconds since the Unix epoch.
    Pong { timestamp: i64 },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

/// Why the relay closed a connection. Clients key their retry policy off
/// the code: no retry on 4001/4002, no immediate reconnect on 4003.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AuthFailed,
    InvalidSessionId,
    Superseded,
    AttachFailed,
    SessionEnded,
    Shutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::AuthFailed => 4001,
            CloseReason::InvalidSessionId => 4002,
            CloseReason::Superseded => 4003,
            CloseReason::AttachFailed | CloseReason::SessionEnded => 1011,
            CloseReason::Shutdown => 1001,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::AuthFailed => "authentication failed",
            CloseReason::InvalidSessionId => "invalid session id",
            CloseReason::Superseded => "superseded by a newer connection",
            CloseReason::AttachFailed => "attach failed",
            CloseReason::SessionEnded => "session ended",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

// ---------------------------------------------------------------------------
// Utf8Stream
// ---------------------------------------------------------------------------

/// Incremental UTF-8 decoder for PTY output.
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives. Bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Flush whatever is held back, lossily.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
