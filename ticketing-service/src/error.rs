use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use payment_gateways::PaymentError;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("only {available} tickets left for template {template_id}")]
    OutOfStock { template_id: Uuid, available: i32 },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ticket already used at {used_at}")]
    AlreadyUsed { used_at: DateTime<Utc> },

    #[error("ticket cancelled")]
    TicketCancelled,

    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("promoter quota exhausted")]
    QuotaExhausted,

    #[error("invalid or inactive code")]
    InvalidOrInactiveCode,

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::OutOfStock { .. } => StatusCode::CONFLICT,
            AppError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyUsed { .. } => StatusCode::CONFLICT,
            AppError::TicketCancelled => StatusCode::CONFLICT,
            AppError::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::QuotaExhausted => StatusCode::CONFLICT,
            AppError::InvalidOrInactiveCode => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::OutOfStock { .. } => "OUT_OF_STOCK",
            AppError::InvalidSignature(_) => "INVALID_SIGNATURE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AlreadyUsed { .. } => "ALREADY_USED",
            AppError::TicketCancelled => "TICKET_CANCELLED",
            AppError::GatewayUnavailable(_) => "GATEWAY_UNAVAILABLE",
            AppError::QuotaExhausted => "QUOTA_EXHAUSTED",
            AppError::InvalidOrInactiveCode => "INVALID_OR_INACTIVE_CODE",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            AppError::OutOfStock {
                template_id,
                available,
            } => Some(json!({ "templateId": template_id, "available": available })),
            AppError::AlreadyUsed { used_at } => Some(json!({ "usedAt": used_at })),
            _ => None,
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Internal(_) => "an internal error occurred".to_string(),
            AppError::InvalidSignature(_) => "invalid signature".to_string(),
            other => other.to_string(),
        }
    }

    fn log(&self) {
        match self {
            AppError::Internal(msg) => error!(code = self.code(), message = %msg, "internal error"),
            AppError::GatewayUnavailable(msg) => {
                error!(code = self.code(), message = %msg, "payment gateway error")
            }
            other => warn!(code = other.code(), error = %other, "request rejected"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.log();

        let body = json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.public_message(),
                "details": self.details(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Conflict(what) => AppError::Conflict(what),
            StoreError::Database(e) => AppError::Internal(format!("database: {}", e)),
            StoreError::Unexpected(e) => AppError::Internal(format!("{:#}", e)),
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidSignature(msg) => AppError::InvalidSignature(msg),
            PaymentError::GatewayUnavailable(msg) => AppError::GatewayUnavailable(msg),
            PaymentError::Declined(msg) => AppError::Validation(format!("payment declined: {}", msg)),
            PaymentError::Malformed(msg) => AppError::Validation(msg),
            PaymentError::Unsupported(msg) => AppError::Validation(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_meaning() {
        let err: AppError = StoreError::NotFound("order".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: AppError = StoreError::Unexpected(anyhow::anyhow!("pool timed out")).into();
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(err.public_message(), "an internal error occurred");
    }

    #[test]
    fn only_outages_map_to_bad_gateway() {
        let err: AppError = PaymentError::GatewayUnavailable("timeout".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err: AppError = PaymentError::Declined("card expired".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err: AppError = PaymentError::InvalidSignature("v1 mismatch".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }
}
