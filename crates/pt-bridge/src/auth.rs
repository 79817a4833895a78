//! Credential checks for the relay and the REST API.
//!
//! Both surfaces share one secret. Candidates are hashed with SHA-256 and the
//! fixed-length digests are compared in constant time, so neither the length
//! nor the content of the secret leaks through timing.
//!
//! REST requests carry the credential in `X-API-Key` or
//! `Authorization: Bearer <token>`; the WebSocket handshake also accepts it
//! as a `token` query parameter because browsers cannot set headers there.

use axum::{
    body::Body,
    http::{HeaderMap, Request, Response, StatusCode},
    response::IntoResponse,
};
use ring::digest::{digest, SHA256};
use std::sync::Arc;
use std::task::{Context, Poll};
use subtle::ConstantTimeEq;
use tower::{Layer, Service};

// ---------------------------------------------------------------------------
// CredentialValidator
// ---------------------------------------------------------------------------

/// Holds the digest of the configured secret.
pub struct CredentialValidator {
    expected: [u8; 32],
}

impl CredentialValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            expected: sha256(secret),
        }
    }

    /// Constant-time check of `candidate` against the configured secret.
    pub fn validate(&self, candidate: &str) -> bool {
        bool::from(sha256(candidate)[..].ct_eq(&self.expected[..]))
    }
}

impl std::fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialValidator { .. }")
    }
}

fn sha256(input: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest(&SHA256, input.as_bytes()).as_ref());
    out
}

/// An authenticated credential, inserted into request extensions by
/// [`AuthMiddleware`]. Handlers derive the session prefix from it.
#[derive(Clone)]
pub struct Credential(pub String);

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// The credential carried in `X-API-Key` or `Authorization: Bearer`.
pub fn credential_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|s| s.to_string())
        })
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// A [`tower::Layer`] that wraps services with [`AuthMiddleware`].
#[derive(Clone)]
pub struct AuthLayer {
    validator: Arc<CredentialValidator>,
}

impl AuthLayer {
    pub fn new(validator: Arc<CredentialValidator>) -> Self {
        Self { validator }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            validator: self.validator.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthMiddleware
// ---------------------------------------------------------------------------

/// The middleware service produced by [`AuthLayer`].
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    validator: Arc<CredentialValidator>,
}

impl<S> Service<Request<Body>> for AuthMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let validator = self.validator.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match credential_from_headers(req.headers()) {
                Some(token) if validator.validate(&token) => {
                    req.extensions_mut().insert(Credential(token));
                    inner.call(req).await
                }
                _ => {
                    tracing::debug!(path = %req.uri().path(), "rejected unauthenticated request");
                    let resp = (
                        StatusCode::UNAUTHORIZED,
                        axum::Json(serde_json::json!({"error": "unauthorized"})),
                    )
                        .into_response();
                    Ok(resp)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::{Extension, Router};
    use tower::ServiceExt;

    fn test_router(secret: &str) -> Router {
        Router::new()
            .route(
                "/whoami",
                get(|Extension(cred): Extension<Credential>| async move { cred.0 }),
            )
            .layer(AuthLayer::new(Arc::new(CredentialValidator::new(secret))))
    }

    #[test]
    fn validator_accepts_only_the_secret() {
        let v = CredentialValidator::new("secret123");
        assert!(v.validate("secret123"));
        assert!(!v.validate("secret12"));
        assert!(!v.validate("secret1234"));
        assert!(!v.validate(""));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential("hunter2".into());
        assert!(!format!("{cred:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn valid_x_api_key_header() {
        let app = test_router("secret123");
        let req = Request::builder()
            .uri("/whoami")
            .header("X-API-Key", "secret123")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"secret123");
    }

    #[tokio::test]
    async fn valid_bearer_token() {
        let app = test_router("secret123");
        let req = Request::builder()
            .uri("/whoami")
            .header("Authorization", "Bearer secret123")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_key_returns_401() {
        let app = test_router("secret123");
        let req = Request::builder().uri("/whoami").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_bearer_returns_401() {
        let app = test_router("secret123");
        let req = Request::builder()
            .uri("/whoami")
            .header("Authorization", "Bearer wrong")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
