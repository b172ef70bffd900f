//! Error-to-response mapping.
//!
//! Domain errors become `{code, description}` with their carried HTTP
//! status. Anything else is a bare 500 — internals stay inside.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use armada_core::DirectorError;

#[derive(Debug)]
pub struct ApiError(anyhow::Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0.downcast::<DirectorError>() {
            Ok(domain) => {
                let status = StatusCode::from_u16(domain.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (
                    status,
                    Json(json!({
                        "code": domain.code(),
                        "description": domain.to_string(),
                    })),
                )
                    .into_response()
            }
            Err(other) => {
                error!(error = %other, "request failed unexpectedly");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}
