use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::config::RazorpayConfig;
use crate::entities::{OrderStatus, PaymentLogStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::gateway::signature::verify_payment_signature;
use crate::security::{actions, SecurityEvent, SecurityLogger, SecuritySeverity};
use crate::services::reconciliation::{PaymentReconciler, SettlementSource};

/// Caller identity for an authenticated request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: Uuid,
    pub ip: Option<String>,
}

impl RequestContext {
    pub fn new(user_id: Uuid, ip: Option<String>) -> Self {
        Self { user_id, ip }
    }
}

/// Values the checkout widget hands back after a successful payment.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct VerifyPaymentInput {
    #[serde(alias = "razorpay_order_id")]
    #[validate(length(min = 1, max = 64))]
    pub gateway_order_id: String,
    #[serde(alias = "razorpay_payment_id")]
    #[validate(length(min = 1, max = 64))]
    pub gateway_payment_id: String,
    #[serde(alias = "razorpay_signature")]
    #[validate(length(min = 1, max = 256))]
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VerificationOutcome {
    pub order_id: Uuid,
    pub order_number: String,
    pub payment_id: String,
    pub payment_status: PaymentStatus,
    pub order_status: OrderStatus,
    /// True when the payment had already been settled before this call
    pub already_processed: bool,
}

#[derive(Clone)]
pub struct PaymentVerificationService {
    reconciler: PaymentReconciler,
    security: SecurityLogger,
    key_secret: Arc<str>,
}

impl PaymentVerificationService {
    pub fn new(
        reconciler: PaymentReconciler,
        security: SecurityLogger,
        razorpay: &RazorpayConfig,
    ) -> Self {
        Self {
            reconciler,
            security,
            key_secret: Arc::from(razorpay.key_secret.as_str()),
        }
    }

    /// Confirms a payment reported by the browser and settles the order.
    #[instrument(skip(self, ctx, input), fields(user_id = %ctx.user_id, gateway_order_id = %input.gateway_order_id))]
    pub async fn verify(
        &self,
        ctx: &RequestContext,
        input: VerifyPaymentInput,
    ) -> Result<VerificationOutcome, ServiceError> {
        input.validate()?;
        let gateway_order_id = input.gateway_order_id.trim();
        let payment_id = input.gateway_payment_id.trim();
        let ip = ctx.ip.as_deref();

        let log = self
            .reconciler
            .find_latest_log(gateway_order_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment attempt {} not found", gateway_order_id))
            })?;
        let order = self.reconciler.find_order(log.order_id).await?;

        if order.user_id != ctx.user_id {
            self.security
                .record(
                    SecurityEvent::new(
                        actions::UNAUTHORIZED_PAYMENT_VERIFICATION,
                        SecuritySeverity::High,
                        json!({
                            "order_id": order.id,
                            "gateway_order_id": gateway_order_id,
                        }),
                    )
                    .user(ctx.user_id)
                    .ip(ip)
                    .blocked(),
                )
                .await;
            return Err(ServiceError::Forbidden(
                "payment belongs to another user".to_string(),
            ));
        }

        if log.status == PaymentLogStatus::Paid
            && log.razorpay_payment_id.as_deref() == Some(payment_id)
        {
            info!(%payment_id, "payment already verified");
            return Ok(VerificationOutcome {
                order_id: order.id,
                order_number: order.order_number,
                payment_id: payment_id.to_string(),
                payment_status: order.payment_status,
                order_status: order.status,
                already_processed: true,
            });
        }

        if let Some(other) = self.reconciler.find_paid_duplicate(payment_id, log.id).await? {
            self.security
                .record(
                    SecurityEvent::new(
                        actions::DUPLICATE_PAYMENT_ATTEMPT,
                        SecuritySeverity::Critical,
                        json!({
                            "payment_id": payment_id,
                            "order_id": order.id,
                            "settled_log_id": other.id,
                            "settled_order_id": other.order_id,
                        }),
                    )
                    .user(ctx.user_id)
                    .ip(ip)
                    .blocked(),
                )
                .await;
            metrics::counter!("storefront.duplicate_payments", 1);
            self.reconciler
                .mark_failed(&log, "payment id already used for another order", None, None)
                .await?;
            return Err(ServiceError::DuplicatePayment);
        }

        if order.payment_status == PaymentStatus::Paid {
            warn!(order_id = %order.id, "order already paid by a different payment");
            self.reconciler
                .mark_failed(&log, "order already paid", None, None)
                .await?;
            return Err(ServiceError::OrderAlreadyPaid);
        }

        if !verify_payment_signature(&self.key_secret, gateway_order_id, payment_id, &input.signature)
        {
            // The payment id is unverified here, so it is not stored.
            self.reconciler
                .mark_failed(&log, "signature verification failed", None, None)
                .await?;
            self.security
                .record(
                    SecurityEvent::new(
                        actions::PAYMENT_SIGNATURE_MISMATCH,
                        SecuritySeverity::High,
                        json!({
                            "order_id": order.id,
                            "gateway_order_id": gateway_order_id,
                            "claimed_payment_id": payment_id,
                        }),
                    )
                    .user(ctx.user_id)
                    .ip(ip)
                    .blocked(),
                )
                .await;
            metrics::counter!("storefront.signature_mismatches", 1, "source" => "client_verification");
            return Err(ServiceError::PaymentVerificationFailed);
        }

        let settlement = self
            .reconciler
            .settle_paid(
                &log,
                payment_id,
                Some(input.signature.trim()),
                SettlementSource::ClientVerification,
                None,
            )
            .await?;

        let already_processed = settlement.already_processed();
        let order = settlement.order();
        Ok(VerificationOutcome {
            order_id: order.id,
            order_number: order.order_number.clone(),
            payment_id: payment_id.to_string(),
            payment_status: order.payment_status,
            order_status: order.status,
            already_processed,
        })
    }
}
