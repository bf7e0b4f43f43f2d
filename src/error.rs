//! HTTP mapping for [`PalmError`].
//!
//! Every failure response carries a JSON `{"error": message}` body. Rate
//! limiting adds `retryAfter` to the body and a `Retry-After` header.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use palm_rag_core::error::PalmError;

/// Handler error type: a [`PalmError`] that knows how to become a response.
#[derive(Debug)]
pub struct ApiError(pub PalmError);

impl From<PalmError> for ApiError {
    fn from(err: PalmError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError(PalmError::Validation(msg.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PalmError::Validation(_) => StatusCode::BAD_REQUEST,
            PalmError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PalmError::Provider(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PalmError::NotFound(_) => StatusCode::NOT_FOUND,
            PalmError::Unauthorized => StatusCode::UNAUTHORIZED,
            PalmError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
        }

        match &self.0 {
            PalmError::RateLimited {
                retry_after_secs,
                reset_at,
            } => {
                let body = Json(json!({
                    "error": "Too many requests. Please try again later.",
                    "retryAfter": retry_after_secs,
                    "resetAt": reset_at,
                }));
                let mut response = (status, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            other => (status, Json(json!({ "error": other.to_string() }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::validation("q too short").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(PalmError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(PalmError::Provider("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError(PalmError::Unauthorized).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after_header() {
        let response = ApiError(PalmError::RateLimited {
            retry_after_secs: 42,
            reset_at: 0,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }
}
