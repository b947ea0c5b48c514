use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ServiceError;

pub const PAYMENT_CAPTURED: &str = "payment.captured";
pub const PAYMENT_AUTHORIZED: &str = "payment.authorized";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const ORDER_PAID: &str = "order.paid";

/// Payment entity as delivered in `payload.payment.entity`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentEntity {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(skip)]
    pub raw: Value,
}

impl PaymentEntity {
    /// Gateway order id the payment was made against.
    pub fn gateway_order_id(&self) -> Result<&str, ServiceError> {
        self.order_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ServiceError::MalformedPayload("payment entity has no order_id".into()))
    }

    /// `"{code}: {description}"` with gateway defaults filled in.
    pub fn failure_reason(&self) -> String {
        format!(
            "{}: {}",
            self.error_code.as_deref().unwrap_or("UNKNOWN_ERROR"),
            self.error_description
                .as_deref()
                .unwrap_or("payment failed at gateway")
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderEntity {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Webhook notification, decoded once after the signature check.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PaymentCaptured(PaymentEntity),
    PaymentAuthorized(PaymentEntity),
    PaymentFailed(PaymentEntity),
    OrderPaid {
        order: OrderEntity,
        payment: PaymentEntity,
    },
    Unknown {
        event: String,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Value,
}

fn entity(payload: &Value, name: &str, event: &str) -> Result<Value, ServiceError> {
    payload
        .get(name)
        .and_then(|wrapper| wrapper.get("entity"))
        .filter(|entity| entity.is_object())
        .cloned()
        .ok_or_else(|| {
            ServiceError::MalformedPayload(format!("{} event is missing payload.{}.entity", event, name))
        })
}

fn payment_entity(payload: &Value, event: &str) -> Result<PaymentEntity, ServiceError> {
    let raw = entity(payload, "payment", event)?;
    let mut payment: PaymentEntity = serde_json::from_value(raw.clone())
        .map_err(|e| ServiceError::MalformedPayload(format!("invalid payment entity: {}", e)))?;
    payment.raw = raw;
    Ok(payment)
}

impl WebhookEvent {
    pub fn decode(raw_body: &[u8]) -> Result<Self, ServiceError> {
        let envelope: Envelope = serde_json::from_slice(raw_body)
            .map_err(|e| ServiceError::MalformedPayload(e.to_string()))?;
        let payload = &envelope.payload;

        let event = match envelope.event.as_str() {
            PAYMENT_CAPTURED => Self::PaymentCaptured(payment_entity(payload, PAYMENT_CAPTURED)?),
            PAYMENT_AUTHORIZED => {
                Self::PaymentAuthorized(payment_entity(payload, PAYMENT_AUTHORIZED)?)
            }
            PAYMENT_FAILED => Self::PaymentFailed(payment_entity(payload, PAYMENT_FAILED)?),
            ORDER_PAID => {
                let order = serde_json::from_value(entity(payload, "order", ORDER_PAID)?)
                    .map_err(|e| ServiceError::MalformedPayload(format!("invalid order entity: {}", e)))?;
                Self::OrderPaid {
                    order,
                    payment: payment_entity(payload, ORDER_PAID)?,
                }
            }
            _ => Self::Unknown {
                event: envelope.event,
            },
        };
        Ok(event)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::PaymentCaptured(_) => PAYMENT_CAPTURED,
            Self::PaymentAuthorized(_) => PAYMENT_AUTHORIZED,
            Self::PaymentFailed(_) => PAYMENT_FAILED,
            Self::OrderPaid { .. } => ORDER_PAID,
            Self::Unknown { event } => event,
        }
    }
}
