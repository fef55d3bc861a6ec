use crate::error::EnrollmentError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("No face found: {0}")]
    Unprocessable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EnrollmentError> for ApiError {
    fn from(e: EnrollmentError) -> Self {
        match e {
            EnrollmentError::NoFace => ApiError::Unprocessable(e.to_string()),
            EnrollmentError::InvalidName(_) | EnrollmentError::UndecodableImage(_) => {
                ApiError::BadRequest(e.to_string())
            }
            EnrollmentError::Oracle(_) | EnrollmentError::Persist(_) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{e:#}"))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
        let body = ErrorResponse {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;

    #[test]
    fn test_enrollment_errors_map_to_status() {
        let status = |e: EnrollmentError| ApiError::from(e).status_code();
        assert_eq!(status(EnrollmentError::NoFace), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            status(EnrollmentError::InvalidName("../x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(EnrollmentError::UndecodableImage("truncated".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(EnrollmentError::Oracle(OracleError::Inference("boom".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(EnrollmentError::Persist("disk full".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
