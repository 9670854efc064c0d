use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::warn;

use crate::chat::errors::MessagingError;

#[derive(Serialize)]
pub struct ErrorMessage {
    pub status: &'static str,
    pub message: String,
}

impl ErrorMessage {
    #[inline]
    pub fn new(message: String) -> Self {
        Self {
            status: "error",
            message,
        }
    }
}

#[derive(Debug)]
pub enum VerboseHTTPError {
    Standard(StatusCode, String),
}

impl IntoResponse for VerboseHTTPError {
    fn into_response(self) -> Response {
        match self {
            Self::Standard(status, message) => {
                let error_message = ErrorMessage::new(message);
                (status, axum::Json(error_message)).into_response()
            }
        }
    }
}

impl From<MessagingError> for VerboseHTTPError {
    fn from(err: MessagingError) -> Self {
        let status = match &err {
            MessagingError::Validation(_) => StatusCode::BAD_REQUEST,
            MessagingError::NotFound(_) => StatusCode::NOT_FOUND,
            MessagingError::AccessDenied(_) => StatusCode::FORBIDDEN,
            MessagingError::Conflict(_) => StatusCode::CONFLICT,
            MessagingError::TransientStore(_) => {
                warn!(error = %err, "Storage failure surfaced to client");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        Self::Standard(status, err.to_string())
    }
}
