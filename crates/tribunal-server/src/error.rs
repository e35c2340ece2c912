use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tribunal_core::errors::CoreError;

/// Maps the core taxonomy onto HTTP statuses with a structured body.
/// Internal errors are logged with a correlation id and never leak detail.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match &self.0 {
            CoreError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::Conflict(_)
            | CoreError::StaleVersion { .. }
            | CoreError::IllegalTransition { .. }
            | CoreError::Cancelled => StatusCode::CONFLICT,
            CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Transport(_) | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            let correlation_id = format!("corr-{:016x}", rand::random::<u64>());
            tracing::error!(
                event = "internal_error",
                correlation_id = %correlation_id,
                error = %self.0
            );
            return (
                status,
                Json(serde_json::json!({
                    "error_kind": "internal",
                    "correlation_id": correlation_id,
                })),
            )
                .into_response();
        }

        (
            status,
            Json(serde_json::json!({
                "error_kind": kind,
                "message": self.0.to_string(),
            })),
        )
            .into_response()
    }
}
