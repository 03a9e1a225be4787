//! HTTP handlers and the error envelope.

pub mod admin;
pub mod events;
pub mod optimize;
pub mod sync;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use morph_core::CoreError;
use serde_json::json;

/// Pulls the api key off the `X-API-Key` header.
pub fn api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Pulls the request origin for the domain allow-list check.
pub fn origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Core errors mapped onto the JSON error envelope `{error, detail}`.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Forbidden(_) | CoreError::QuotaExceeded { .. } => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict { .. } => StatusCode::CONFLICT,
            CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::StorageUnavailable(_) | CoreError::DeadlineExceeded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Llm(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        let mut body = json!({
            "error": self.0.code(),
            "detail": self.0.to_string(),
        });
        // A lost CAS race hands the caller the authoritative record.
        if let CoreError::Conflict { current } = &self.0 {
            body["current"] = serde_json::to_value(current).unwrap_or_default();
        }

        let mut response = (status, Json(body)).into_response();
        if let CoreError::RateLimited { retry_after_secs } = &self.0 {
            if let Ok(v) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", v);
            }
        }
        response
    }
}
