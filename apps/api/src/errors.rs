use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::chat::TurnError;
use crate::documents::NormalizationError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Request cancelled")]
    Cancelled,

    /// The model endpoint is temporarily unusable; the user may retry.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// The model endpoint rejected the request for a reason retrying will not fix.
    #[error("Model misconfigured: {0}")]
    ModelMisconfigured(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<NormalizationError> for AppError {
    fn from(e: NormalizationError) -> Self {
        match e {
            NormalizationError::UnsupportedFormat(_) => AppError::UnsupportedMedia(e.to_string()),
            NormalizationError::SizeExceeded { .. } => AppError::PayloadTooLarge(e.to_string()),
            // Normally turned into a degraded attachment before it gets here.
            NormalizationError::ExtractionFailed { .. } => AppError::Validation(e.to_string()),
        }
    }
}

impl From<TurnError> for AppError {
    fn from(e: TurnError) -> Self {
        match e {
            TurnError::EmptyQuery => AppError::Validation(e.to_string()),
            TurnError::Cancelled => AppError::Cancelled,
            TurnError::Temporary(message) => AppError::ModelUnavailable(message),
            TurnError::Configuration(message) => AppError::ModelMisconfigured(message),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::UnsupportedMedia(msg) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_FORMAT",
                msg.clone(),
            ),
            AppError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "SIZE_EXCEEDED", msg.clone())
            }
            // 499: client closed request (nginx convention).
            AppError::Cancelled => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                "CANCELLED",
                "The request was cancelled".to_string(),
            ),
            AppError::ModelUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "TEMPORARILY_UNAVAILABLE",
                msg.clone(),
            ),
            AppError::ModelMisconfigured(msg) => {
                (StatusCode::BAD_GATEWAY, "CONFIGURATION_PROBLEM", msg.clone())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
