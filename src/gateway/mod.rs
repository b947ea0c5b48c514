pub mod razorpay;
pub mod signature;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::middleware_helpers::retry::RetryPolicy;

pub use razorpay::RazorpayClient;

/// Name recorded on payment logs created through this gateway
pub const GATEWAY_NAME: &str = "razorpay";

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway returned {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("gateway response could not be decoded: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Transport failures, throttling and 5xx responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

pub struct GatewayRetryPolicy;

impl RetryPolicy<GatewayError> for GatewayRetryPolicy {
    fn is_retryable(&self, error: &GatewayError) -> bool {
        error.is_retryable()
    }
}

/// Request to open a payment order at the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct CreateGatewayOrder {
    /// Amount in minor units (paise)
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub notes: BTreeMap<String, String>,
}

/// Gateway-side order created for one payment attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(skip)]
    pub raw: Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, GatewayError>;

    /// Publishable key id handed to the checkout widget.
    fn key_id(&self) -> &str;
}

/// Converts a major-unit amount to minor units. `None` if it has sub-paise
/// precision or does not fit.
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    let minor = amount * Decimal::ONE_HUNDRED;
    if minor.fract() != Decimal::ZERO {
        return None;
    }
    minor.to_i64()
}
