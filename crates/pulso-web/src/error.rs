//! API error mapping: every core error kind becomes a stable string code
//! plus a user-safe message. Internal structure never leaks.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use pulso_core::CoreError;

pub struct ApiError(pub CoreError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

pub fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::SourceSchema(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::Auth(_) => StatusCode::UNAUTHORIZED,
        CoreError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let message = match &self.0 {
            // Internal detail stays in the logs.
            CoreError::Config(_) | CoreError::TransientIo(_) => {
                "temporarily unavailable".to_string()
            }
            other => other.to_string(),
        };
        (
            status,
            Json(json!({ "error": self.0.code(), "message": message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_stable_statuses() {
        assert_eq!(
            status_for(&CoreError::NotFound("bill".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CoreError::RateLimit { wait_secs: 270 }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&CoreError::Auth("bad hmac".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&CoreError::Forbidden("plan".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&CoreError::Conflict("dup".into())),
            StatusCode::CONFLICT
        );
    }
}
