use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use crate::config::RazorpayConfig;
use crate::entities::{payment_log, PaymentLogStatus};
use crate::errors::ServiceError;
use crate::gateway::signature::verify_webhook_signature;
use crate::security::{actions, SecurityEvent, SecurityLogger, SecuritySeverity};
use crate::services::reconciliation::{PaymentReconciler, SettlementSource};

use super::events::{PaymentEntity, WebhookEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAckStatus {
    /// State changed because of this delivery
    Processed,
    /// Delivery repeated work that was already done
    AlreadyProcessed,
    /// Event type or gateway order this service does not track
    Ignored,
    /// Valid delivery that must not be applied; flagged for manual follow-up
    Rejected,
}

/// Body returned to the gateway for every authenticated delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub status: WebhookAckStatus,
    pub event: String,
}

impl WebhookAck {
    fn new(status: WebhookAckStatus, event: &str) -> Self {
        Self {
            status,
            event: event.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct WebhookProcessor {
    reconciler: PaymentReconciler,
    security: SecurityLogger,
    webhook_secret: Arc<str>,
}

impl WebhookProcessor {
    pub fn new(
        reconciler: PaymentReconciler,
        security: SecurityLogger,
        razorpay: &RazorpayConfig,
    ) -> Self {
        Self {
            reconciler,
            security,
            webhook_secret: Arc::from(razorpay.webhook_secret.as_str()),
        }
    }

    /// Authenticates and applies one gateway delivery.
    ///
    /// The body is not parsed until its signature has been checked.
    #[instrument(skip(self, raw_body, signature, ip), fields(event_id = event_id.unwrap_or("-")))]
    pub async fn process(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
        event_id: Option<&str>,
        ip: Option<&str>,
    ) -> Result<WebhookAck, ServiceError> {
        let authentic = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| verify_webhook_signature(&self.webhook_secret, raw_body, s))
            .unwrap_or(false);

        if !authentic {
            self.security
                .record(
                    SecurityEvent::new(
                        actions::INVALID_WEBHOOK_SIGNATURE,
                        SecuritySeverity::High,
                        json!({
                            "signature_present": signature.is_some(),
                            "body_length": raw_body.len(),
                            "event_id": event_id,
                        }),
                    )
                    .ip(ip)
                    .blocked(),
                )
                .await;
            metrics::counter!("storefront.signature_mismatches", 1, "source" => "webhook");
            return Err(ServiceError::InvalidWebhookSignature);
        }

        let event = WebhookEvent::decode(raw_body)?;
        let name = event.name().to_string();
        info!(event = %name, "webhook received");
        metrics::counter!("storefront.webhooks_received", 1, "event" => name.clone());

        match event {
            WebhookEvent::PaymentCaptured(payment) | WebhookEvent::PaymentAuthorized(payment) => {
                let gateway_order_id = payment.gateway_order_id()?.to_string();
                self.apply_success(&name, &gateway_order_id, &payment, ip).await
            }
            WebhookEvent::OrderPaid { order, payment } => {
                self.apply_success(&name, &order.id, &payment, ip).await
            }
            WebhookEvent::PaymentFailed(payment) => self.apply_failure(&name, &payment).await,
            WebhookEvent::Unknown { .. } => {
                info!(event = %name, "ignoring unhandled webhook event");
                Ok(WebhookAck::new(WebhookAckStatus::Ignored, &name))
            }
        }
    }

    async fn find_log(
        &self,
        event: &str,
        gateway_order_id: &str,
    ) -> Result<Option<payment_log::Model>, ServiceError> {
        let log = self.reconciler.find_latest_log(gateway_order_id).await?;
        if log.is_none() {
            warn!(%event, %gateway_order_id, "webhook for unknown gateway order");
        }
        Ok(log)
    }

    async fn flag_for_refund(
        &self,
        log: &payment_log::Model,
        payment: &PaymentEntity,
        event: &str,
        reason: &str,
        ip: Option<&str>,
    ) {
        self.security
            .record(
                SecurityEvent::new(
                    actions::CAPTURE_ON_CLOSED_ORDER,
                    SecuritySeverity::Critical,
                    json!({
                        "payment_log_id": log.id,
                        "order_id": log.order_id,
                        "payment_id": payment.id,
                        "amount_minor": payment.amount,
                        "event": event,
                        "reason": reason,
                    }),
                )
                .ip(ip)
                .blocked(),
            )
            .await;
    }

    async fn apply_success(
        &self,
        event: &str,
        gateway_order_id: &str,
        payment: &PaymentEntity,
        ip: Option<&str>,
    ) -> Result<WebhookAck, ServiceError> {
        let Some(log) = self.find_log(event, gateway_order_id).await? else {
            return Ok(WebhookAck::new(WebhookAckStatus::Ignored, event));
        };
        let payment_id = payment.id.as_str();

        match log.status {
            PaymentLogStatus::Paid if log.razorpay_payment_id.as_deref() == Some(payment_id) => {
                info!(%payment_id, "payment already settled");
                return Ok(WebhookAck::new(WebhookAckStatus::AlreadyProcessed, event));
            }
            PaymentLogStatus::Paid => {
                self.security
                    .record(
                        SecurityEvent::new(
                            actions::PAYMENT_SETTLEMENT_CONFLICT,
                            SecuritySeverity::Critical,
                            json!({
                                "payment_log_id": log.id,
                                "settled_payment_id": log.razorpay_payment_id,
                                "reported_payment_id": payment_id,
                                "event": event,
                            }),
                        )
                        .ip(ip)
                        .blocked(),
                    )
                    .await;
                return Ok(WebhookAck::new(WebhookAckStatus::Rejected, event));
            }
            PaymentLogStatus::Failed => {
                self.flag_for_refund(&log, payment, event, "payment attempt already failed", ip)
                    .await;
                return Ok(WebhookAck::new(WebhookAckStatus::Rejected, event));
            }
            PaymentLogStatus::Pending => {}
        }

        if let Some(other) = self.reconciler.find_paid_duplicate(payment_id, log.id).await? {
            self.security
                .record(
                    SecurityEvent::new(
                        actions::DUPLICATE_PAYMENT_ATTEMPT,
                        SecuritySeverity::Critical,
                        json!({
                            "payment_id": payment_id,
                            "order_id": log.order_id,
                            "settled_log_id": other.id,
                            "settled_order_id": other.order_id,
                            "event": event,
                        }),
                    )
                    .ip(ip)
                    .blocked(),
                )
                .await;
            metrics::counter!("storefront.duplicate_payments", 1);
            self.reconciler
                .mark_failed(&log, "payment id already used for another order", None, None)
                .await?;
            return Ok(WebhookAck::new(WebhookAckStatus::Rejected, event));
        }

        let gateway_response = Some(payment.raw.clone()).filter(|raw| !raw.is_null());
        match self
            .reconciler
            .settle_paid(&log, payment_id, None, SettlementSource::Webhook, gateway_response)
            .await
        {
            Ok(settlement) if settlement.already_processed() => {
                Ok(WebhookAck::new(WebhookAckStatus::AlreadyProcessed, event))
            }
            Ok(_) => Ok(WebhookAck::new(WebhookAckStatus::Processed, event)),
            Err(ServiceError::OrderAlreadyPaid) => {
                self.reconciler
                    .mark_failed(&log, "order already paid by another payment", None, None)
                    .await?;
                self.flag_for_refund(&log, payment, event, "order already paid", ip)
                    .await;
                Ok(WebhookAck::new(WebhookAckStatus::Rejected, event))
            }
            Err(ServiceError::OrderClosed(reason)) => {
                self.flag_for_refund(&log, payment, event, &reason, ip).await;
                Ok(WebhookAck::new(WebhookAckStatus::Rejected, event))
            }
            Err(ServiceError::PaymentConflict(_)) => {
                Ok(WebhookAck::new(WebhookAckStatus::Rejected, event))
            }
            Err(err) => Err(err),
        }
    }

    async fn apply_failure(
        &self,
        event: &str,
        payment: &PaymentEntity,
    ) -> Result<WebhookAck, ServiceError> {
        let gateway_order_id = payment.gateway_order_id()?;
        let Some(log) = self.find_log(event, gateway_order_id).await? else {
            return Ok(WebhookAck::new(WebhookAckStatus::Ignored, event));
        };

        let gateway_response: Option<Value> = Some(payment.raw.clone()).filter(|raw| !raw.is_null());
        let outcome = self
            .reconciler
            .mark_failed(
                &log,
                &payment.failure_reason(),
                Some(payment.id.as_str()),
                gateway_response,
            )
            .await?;

        let status = if outcome.log_failed || outcome.order_cancelled {
            WebhookAckStatus::Processed
        } else {
            WebhookAckStatus::AlreadyProcessed
        };
        Ok(WebhookAck::new(status, event))
    }
}
