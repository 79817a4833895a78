//! WebSocket Origin allow-list.
//!
//! Browsers do not apply CORS to WebSocket upgrades; they only send the
//! page's Origin and leave the decision to the server. An empty allow-list
//! disables the check (the credential still gates every connection).

use axum::http::{HeaderMap, StatusCode};

/// Check the upgrade request's Origin against `allowed_origins`.
///
/// An entry matches the origin exactly, or with any numeric port appended
/// (`http://localhost` admits `http://localhost:3000`). With a non-empty
/// list a missing or non-UTF-8 Origin is rejected.
pub fn validate_websocket_origin(
    headers: &HeaderMap,
    allowed_origins: &[String],
) -> Result<(), StatusCode> {
    if allowed_origins.is_empty() {
        return Ok(());
    }

    let origin = headers
        .get("origin")
        .ok_or(StatusCode::FORBIDDEN)?
        .to_str()
        .map_err(|_| StatusCode::FORBIDDEN)?;

    let is_allowed = allowed_origins.iter().any(|allowed| {
        if origin == allowed {
            return true;
        }
        origin
            .strip_prefix(allowed.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .is_some_and(|port| port.chars().all(|c| c.is_ascii_digit()))
    });

    if is_allowed {
        Ok(())
    } else {
        tracing::warn!(origin, "rejected WebSocket origin");
        Err(StatusCode::FORBIDDEN)
    }
}
