use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::utils::response::error as error_response;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Payment gateway error: {0}")]
    GatewayError(String),

    #[error("Transaction lock timeout for reference {0}")]
    LockTimeout(String),

    #[error("Unknown transaction reference: {0}")]
    UnknownTransaction(String),

    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal server error")]
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::GatewayError(_) => StatusCode::BAD_GATEWAY,
            AppError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UnknownTransaction(_) => StatusCode::NOT_FOUND,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ExternalServiceError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::GatewayError(_) => "GATEWAY_ERROR",
            AppError::LockTimeout(_) => "LOCK_TIMEOUT",
            AppError::UnknownTransaction(_) => "UNKNOWN_TRANSACTION",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn log(&self) {
        match self {
            AppError::ValidationError(msg)
            | AppError::NotFound(msg)
            | AppError::GatewayError(msg)
            | AppError::LockTimeout(msg)
            | AppError::UnknownTransaction(msg)
            | AppError::ExternalServiceError(msg)
            | AppError::InternalServerError(msg) => {
                error!(error = ?self, message = %msg, "Application error");
            }
            AppError::DatabaseError(e) => {
                error!(error = ?e, "Database error");
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log internal details
        self.log();

        // Only expose high-level message to the client
        let public_message = match &self {
            AppError::ValidationError(msg)
            | AppError::NotFound(msg)
            | AppError::GatewayError(msg)
            | AppError::ExternalServiceError(msg)
            | AppError::InternalServerError(msg) => msg.clone(),
            AppError::LockTimeout(_) => {
                "Transaction is being processed, try again shortly".to_string()
            }
            AppError::UnknownTransaction(reference) => {
                format!("No transaction found for reference {reference}")
            }
            AppError::DatabaseError(_) => "A database error occurred".to_string(),
        };

        // Do not expose internal details in the API response
        let details = None;

        error_response(code, public_message, details, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_maps_to_service_unavailable() {
        let err = AppError::LockTimeout("ws_CO_123".to_string());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "LOCK_TIMEOUT");
    }

    #[test]
    fn test_gateway_error_maps_to_bad_gateway() {
        let err = AppError::GatewayError("initiate failed".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_validation_error_is_client_fault() {
        let err = AppError::ValidationError("Only 0 available".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
