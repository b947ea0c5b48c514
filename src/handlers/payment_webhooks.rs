use axum::{extract::State, http::HeaderMap, Json};
use bytes::Bytes;

use crate::errors::ServiceError;
use crate::handlers::ClientIp;
use crate::webhooks::WebhookAck;
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";
pub const EVENT_ID_HEADER: &str = "x-razorpay-event-id";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// POST /api/v1/payments/webhook
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    params(
        ("x-razorpay-signature" = String, Header, description = "Hex HMAC-SHA256 of the raw body"),
        ("x-razorpay-event-id" = Option<String>, Header, description = "Gateway delivery id"),
    ),
    responses(
        (status = 200, description = "Webhook acknowledged", body = WebhookAck),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 400, description = "Invalid payload", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    client_ip: ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let ack = state
        .services
        .webhooks
        .process(
            &body,
            header_str(&headers, SIGNATURE_HEADER),
            header_str(&headers, EVENT_ID_HEADER),
            client_ip.as_deref(),
        )
        .await?;
    Ok(Json(ack))
}
