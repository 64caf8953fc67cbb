//! Rendering of service errors as JSON HTTP responses.

use std::time::Duration;

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common::{protocol::ErrorResponse, ServiceError};

use crate::error::VaultError;

/// Error returned by handlers: a [`ServiceError`] plus an optional retry hint.
#[derive(Debug)]
pub struct ApiError {
    error: ServiceError,
    retry_after: Option<Duration>,
}

impl ApiError {
    /// The underlying service error.
    pub fn service_error(&self) -> &ServiceError {
        &self.error
    }

    fn message(&self) -> String {
        match &self.error {
            ServiceError::Field { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        let retry_after = match &e {
            VaultError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        };
        Self {
            error: e.into(),
            retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse::new(self.error.code(), self.message());
        let mut resp = (status, Json(body)).into_response();
        if let Some(wait) = self.retry_after {
            // Whole seconds, rounded up so clients never retry early.
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            resp.headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        resp
    }
}
