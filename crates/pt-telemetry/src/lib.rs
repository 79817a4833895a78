//! Logging bootstrap and request correlation for persistty services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   selected by [`logging::LogFormat`]
//! - **Request IDs**: axum middleware that tags every HTTP request with an
//!   `X-Request-Id` and a matching tracing span

pub mod logging;
pub mod request_id;
