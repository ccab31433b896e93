use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use karigo_common::AppError;

/// Headers accepted for the shared internal secret.
pub const INTERNAL_KEY_HEADERS: [&str; 2] = ["x-internal-key", "x-internal-api-key"];

/// Shared secret that gates service-to-service endpoints.
#[derive(Clone)]
pub struct InternalKey(Arc<str>);

impl InternalKey {
    pub fn new(key: &str) -> Self {
        Self(Arc::from(key))
    }

    pub fn matches(&self, presented: &str) -> bool {
        !self.0.is_empty() && bool::from(self.0.as_bytes().ct_eq(presented.as_bytes()))
    }

    /// True when any accepted header carries the key.
    pub fn authorizes(&self, headers: &HeaderMap) -> bool {
        INTERNAL_KEY_HEADERS
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|value| value.to_str().ok())
            .any(|value| self.matches(value))
    }
}

/// Rejects requests that do not carry the internal key.
///
/// Mount with `axum::middleware::from_fn_with_state(key, require_internal_key)`.
pub async fn require_internal_key(
    State(key): State<InternalKey>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !key.authorizes(&headers) {
        tracing::warn!(path = %request.uri().path(), "Rejected call without internal key");
        return Err(AppError::Unauthorized("missing or invalid internal key".to_string()));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Router};
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route("/internal", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                InternalKey::new("s3cret"),
                require_internal_key,
            ))
    }

    async fn status_with(header: Option<(&str, &str)>) -> StatusCode {
        let mut request = Request::builder().uri("/internal");
        if let Some((name, value)) = header {
            request = request.header(name, value);
        }
        app()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn accepts_either_header_name() {
        assert_eq!(status_with(Some(("x-internal-key", "s3cret"))).await, StatusCode::OK);
        assert_eq!(status_with(Some(("x-internal-api-key", "s3cret"))).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_keys() {
        assert_eq!(status_with(None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_with(Some(("x-internal-key", "guess"))).await, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn an_empty_configured_key_never_matches() {
        assert!(!InternalKey::new("").matches(""));
    }
}
