use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::{HostwrightError, ValidationErrors};

/// Error response: `{"error": "...", "errors": {field: [..]}}`.
#[derive(Debug)]
pub struct ApiError(HostwrightError);

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<&'a ValidationErrors>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            HostwrightError::Validation(_) | HostwrightError::Json(_) => StatusCode::BAD_REQUEST,
            HostwrightError::Authorization(_) => StatusCode::FORBIDDEN,
            HostwrightError::NotFound { .. } => StatusCode::NOT_FOUND,
            HostwrightError::StateConflict(_) | HostwrightError::Transition(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<HostwrightError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "Request failed");
        }

        let errors = match &self.0 {
            HostwrightError::Validation(errors) => Some(errors),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            errors,
        };
        (status, Json(body)).into_response()
    }
}
