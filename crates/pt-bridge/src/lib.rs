//! Network surface of persistty: the WebSocket relay gateway and the
//! session-management REST API.
//!
//! Key modules:
//! - [`relay_ws`]: per-connection gateway pumping bytes between a WebSocket
//!   and a PTY attached to a tmux session
//! - [`registry`]: session name to live connection, used for eviction
//! - [`protocol`]: wire messages and close codes
//! - [`flow`]: outbound backpressure accounting
//! - [`http_api`]: shared state, router and REST handlers
//! - [`auth`]: constant-time credential check and the API key layer

pub mod api_error;
pub mod auth;
pub mod flow;
pub mod http_api;
pub mod origin;
pub mod protocol;
pub mod registry;
pub mod relay_ws;
