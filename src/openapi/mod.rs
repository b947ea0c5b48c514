use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront Payments API",
        version = "1.0.0",
        description = r#"
# Storefront Payments API

Order intake and payment reconciliation for the storefront.

## Flow

1. `POST /orders` turns cart lines into a priced, taxed order and reserves stock.
2. `POST /payments/sessions` opens a gateway payment attempt for that order.
3. The browser completes payment in the gateway widget, then calls
   `POST /payments/verify` with the signed result.
4. The gateway independently calls `POST /payments/webhook`. Either path may
   arrive first; both settle the order exactly once.

## Authentication

Customer endpoints require a bearer token:

```
Authorization: Bearer <your-jwt-token>
```

The webhook endpoint is authenticated by the `x-razorpay-signature` header instead.

## Rate Limiting

Payment endpoints are rate-limited. Check the response headers:
- `X-RateLimit-Limit`: Maximum requests per window
- `X-RateLimit-Remaining`: Remaining requests in current window
- `X-RateLimit-Reset`: Seconds until the window resets

## Error Handling

Errors share one body shape with a stable `code`:

```json
{
  "error": "Bad Request",
  "code": "PAYMENT_VERIFICATION_FAILED",
  "message": "Payment could not be verified",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
    ),
    servers(
        (url = "http://localhost:8080/api/v1", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Order intake endpoints"),
        (name = "Payments", description = "Payment session, verification and webhook endpoints"),
    ),
    paths(
        crate::handlers::orders::create_order,
        crate::handlers::orders::get_order,
        crate::handlers::payments::create_payment_session,
        crate::handlers::payments::verify_payment,
        crate::handlers::payment_webhooks::payment_webhook,
    ),
    components(
        schemas(
            crate::ApiResponse<serde_json::Value>,
            crate::handlers::orders::OrderResponse,
            crate::handlers::orders::OrderItemResponse,
            crate::services::orders::PlaceOrderInput,
            crate::services::orders::OrderLineInput,
            crate::services::orders::ShippingAddressInput,
            crate::services::tax::TaxBreakdown,
            crate::services::payments::CreateSessionInput,
            crate::services::payments::PaymentSession,
            crate::services::verification::VerifyPaymentInput,
            crate::services::verification::VerificationOutcome,
            crate::webhooks::WebhookAck,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&BearerSecurity)
)]
pub struct ApiDocV1;

struct BearerSecurity;

impl Modify for BearerSecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_every_route() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("Storefront Payments API"));
        for path in [
            "/api/v1/orders",
            "/api/v1/orders/{id}",
            "/api/v1/payments/sessions",
            "/api/v1/payments/verify",
            "/api/v1/payments/webhook",
        ] {
            assert!(json.contains(path), "missing {path}");
        }
        assert!(json.contains("\"Bearer\""));
    }
}
