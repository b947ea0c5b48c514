use axum::{extract::State, http::StatusCode, Json};

use crate::auth::AuthUser;
use crate::errors::ServiceError;
use crate::handlers::ClientIp;
use crate::services::payments::{CreateSessionInput, PaymentSession};
use crate::services::verification::{RequestContext, VerificationOutcome, VerifyPaymentInput};
use crate::{ApiResponse, AppState};

/// Open a gateway payment attempt for one of the caller's orders.
///
/// Returns 201 for a new attempt and 200 when a pending attempt is reused.
#[utoipa::path(
    post,
    path = "/api/v1/payments/sessions",
    summary = "Create payment session",
    request_body = CreateSessionInput,
    responses(
        (status = 201, description = "Payment attempt created", body = ApiResponse<PaymentSession>),
        (status = 200, description = "Pending attempt reused", body = ApiResponse<PaymentSession>),
        (status = 400, description = "Invalid amount or order closed", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Order belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::errors::ErrorResponse),
        (status = 500, description = "Gateway unavailable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn create_payment_session(
    State(state): State<AppState>,
    auth_user: AuthUser,
    client_ip: ClientIp,
    Json(request): Json<CreateSessionInput>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentSession>>), ServiceError> {
    let session = state
        .services
        .payments
        .create_session(auth_user.user_id, request, client_ip.as_deref())
        .await?;

    let status = if session.reused {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(ApiResponse::success(session))))
}

/// Confirm a payment using the values the checkout widget returned.
#[utoipa::path(
    post,
    path = "/api/v1/payments/verify",
    summary = "Verify payment",
    request_body = VerifyPaymentInput,
    responses(
        (status = 200, description = "Payment verified (or already verified)", body = ApiResponse<VerificationOutcome>),
        (status = 400, description = "Verification failed, duplicate payment or order already paid", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 403, description = "Payment belongs to another user", body = crate::errors::ErrorResponse),
        (status = 404, description = "Payment attempt not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Concurrent settlement conflict", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    client_ip: ClientIp,
    Json(request): Json<VerifyPaymentInput>,
) -> Result<Json<ApiResponse<VerificationOutcome>>, ServiceError> {
    let ctx = RequestContext::new(auth_user.user_id, client_ip.0);
    let outcome = state.services.verification.verify(&ctx, request).await?;

    let message = if outcome.already_processed {
        "Payment already verified"
    } else {
        "Payment verified"
    };
    Ok(Json(ApiResponse::success_with_message(
        outcome,
        message.to_string(),
    )))
}
