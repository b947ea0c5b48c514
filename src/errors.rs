use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::gateway::GatewayError;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned for every failed request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Bad Request",
    "code": "INSUFFICIENT_STOCK",
    "message": "Insufficient stock: only 1 unit(s) of Desk Lamp available",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Stable, machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Order must contain at least one item")]
    EmptyOrder,

    #[error("Shipping address is missing a state")]
    MissingShippingState,

    #[error("Product unavailable: {0}")]
    ProductUnavailable(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Payment verification failed")]
    PaymentVerificationFailed,

    #[error("Duplicate payment blocked")]
    DuplicatePayment,

    #[error("Order has already been paid")]
    OrderAlreadyPaid,

    #[error("Order is closed: {0}")]
    OrderClosed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payment conflict: {0}")]
    PaymentConflict(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::EmptyOrder
            | Self::MissingShippingState
            | Self::ProductUnavailable(_)
            | Self::InsufficientStock(_)
            | Self::InvalidAmount(_)
            | Self::MalformedPayload(_)
            | Self::PaymentVerificationFailed
            | Self::DuplicatePayment
            | Self::OrderAlreadyPaid
            | Self::OrderClosed(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) | Self::InvalidWebhookSignature => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) | Self::PaymentConflict(_) => StatusCode::CONFLICT,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::DatabaseError(_)
            | Self::Gateway(_)
            | Self::SerializationError(_)
            | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code clients can branch on.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ValidationError(_) => "VALIDATION_ERROR",
            Self::EmptyOrder => "EMPTY_ORDER",
            Self::MissingShippingState => "MISSING_SHIPPING_STATE",
            Self::ProductUnavailable(_) => "PRODUCT_UNAVAILABLE",
            Self::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            Self::InvalidAmount(_) => "INVALID_AMOUNT",
            Self::Unauthorized(_) => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::InvalidWebhookSignature => "INVALID_WEBHOOK_SIGNATURE",
            Self::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            Self::PaymentVerificationFailed => "PAYMENT_VERIFICATION_FAILED",
            Self::DuplicatePayment => "DUPLICATE_PAYMENT",
            Self::OrderAlreadyPaid => "ORDER_ALREADY_PAID",
            Self::OrderClosed(_) => "ORDER_CLOSED",
            Self::Conflict(_) => "CONFLICT",
            Self::PaymentConflict(_) => "PAYMENT_CONFLICT",
            Self::RateLimitExceeded => "RATE_LIMITED",
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::SerializationError(_) | Self::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal and integrity errors return generic messages; the detail goes to logs.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                "Internal server error".to_string()
            }
            Self::Gateway(_) => "Payment gateway unavailable, please retry".to_string(),
            Self::PaymentVerificationFailed
            | Self::DuplicatePayment
            | Self::PaymentConflict(_) => "Payment could not be verified".to_string(),
            Self::RateLimitExceeded => "Rate limit exceeded".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "request failed");
        }

        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.error_code().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}
