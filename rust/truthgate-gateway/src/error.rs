//! The error kinds surfaced by the dispatcher, uniform across surfaces.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Challenge header attached to API 401 responses.
pub const API_CHALLENGE: &str = r#"ApiKey realm="/api""#;

#[derive(Debug, Error)]
pub enum GateError {
    /// A configured host whose production folder does not exist yet.
    #[error("Site not found.")]
    SiteNotFound,

    /// A mapped site's CID is not present on the local node.
    #[error("Site not available locally.")]
    NotFoundLocal,

    /// A path is missing inside a locally-present CID and no SPA fallback
    /// applied.
    #[error("Not found.")]
    NotFoundContent,

    /// Credentials missing or invalid on a surface that requires them.
    /// The body is fixed so that missing and invalid are indistinguishable.
    #[error("Unauthorized.")]
    Unauthorized,

    /// Tier exceeded on the boundary crossing; carries `Retry-After`
    /// seconds.
    #[error("Rate limited.")]
    RateLimited { retry_after_secs: u64 },

    /// Banned, true-banned, or cross-CID access without authentication.
    #[error("Forbidden.")]
    Forbidden,

    /// Node 5xx or connection failure outside the stale-cache classes.
    #[error("Upstream failure.")]
    UpstreamTransient,

    /// Malformed publish or otherwise unusable request.
    #[error("{0}")]
    BadRequest(String),
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::SiteNotFound | GateError::NotFoundLocal | GateError::NotFoundContent => {
                StatusCode::NOT_FOUND
            }
            GateError::Unauthorized => StatusCode::UNAUTHORIZED,
            GateError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GateError::Forbidden => StatusCode::FORBIDDEN,
            GateError::UpstreamTransient => StatusCode::BAD_GATEWAY,
            GateError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        match &self {
            GateError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, API_CHALLENGE)],
                self.to_string(),
            )
                .into_response(),
            GateError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                self.to_string(),
            )
                .into_response(),
            _ => (self.status(), self.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_the_taxonomy() {
        assert_eq!(GateError::NotFoundLocal.status(), StatusCode::NOT_FOUND);
        assert_eq!(GateError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GateError::RateLimited { retry_after_secs: 9 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(GateError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(GateError::UpstreamTransient.status(), StatusCode::BAD_GATEWAY);
    }
}
