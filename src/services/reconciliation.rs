//! Terminal transitions for payment attempts.
//!
//! Client verification and the webhook both settle through [`PaymentReconciler`].
//! Every write is conditional on the row still being in the state we read, so
//! whichever caller loses a race sees zero affected rows and re-reads instead
//! of overwriting.

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, SqlErr, TransactionTrait,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::{order, order_item, payment_log, product};
use crate::entities::{OrderStatus, PaymentLogStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::security::{actions, SecurityEvent, SecurityLogger, SecuritySeverity};
use crate::services::cart::CartService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementSource {
    ClientVerification,
    Webhook,
}

impl SettlementSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientVerification => "client_verification",
            Self::Webhook => "webhook",
        }
    }
}

/// Result of a successful `settle_paid`.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// This call moved the attempt and order to paid.
    Settled {
        order: order::Model,
        log: payment_log::Model,
    },
    /// Another caller already settled with the same payment id.
    AlreadySettled {
        order: order::Model,
        log: payment_log::Model,
    },
}

impl Settlement {
    pub fn already_processed(&self) -> bool {
        matches!(self, Self::AlreadySettled { .. })
    }

    pub fn order(&self) -> &order::Model {
        match self {
            Self::Settled { order, .. } | Self::AlreadySettled { order, .. } => order,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    pub log_failed: bool,
    pub order_cancelled: bool,
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[derive(Clone)]
pub struct PaymentReconciler {
    db: Arc<DatabaseConnection>,
    security: SecurityLogger,
    cart: CartService,
}

impl PaymentReconciler {
    pub fn new(db: Arc<DatabaseConnection>, security: SecurityLogger) -> Self {
        Self {
            cart: CartService::new(db.clone()),
            db,
            security,
        }
    }

    /// Latest attempt recorded for a gateway order id.
    pub async fn find_latest_log(
        &self,
        gateway_order_id: &str,
    ) -> Result<Option<payment_log::Model>, ServiceError> {
        let log = payment_log::Entity::find()
            .filter(payment_log::Column::RazorpayOrderId.eq(gateway_order_id))
            .order_by_desc(payment_log::Column::CreatedAt)
            .one(&*self.db)
            .await?;
        Ok(log)
    }

    /// A PAID attempt other than `excluding` that already carries `payment_id`.
    pub async fn find_paid_duplicate(
        &self,
        payment_id: &str,
        excluding: Uuid,
    ) -> Result<Option<payment_log::Model>, ServiceError> {
        let log = payment_log::Entity::find()
            .filter(payment_log::Column::RazorpayPaymentId.eq(payment_id))
            .filter(payment_log::Column::Status.eq(PaymentLogStatus::Paid))
            .filter(payment_log::Column::Id.ne(excluding))
            .one(&*self.db)
            .await?;
        Ok(log)
    }

    pub async fn find_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    async fn reload(
        &self,
        log_id: Uuid,
        order_id: Uuid,
    ) -> Result<(payment_log::Model, order::Model), ServiceError> {
        let log = payment_log::Entity::find_by_id(log_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment attempt {} not found", log_id)))?;
        let order = self.find_order(order_id).await?;
        Ok((log, order))
    }

    /// Called when a conditional write matched nothing. Converges only if the
    /// winning write recorded the same payment id on both rows.
    async fn resolve_lost_race(
        &self,
        log: &payment_log::Model,
        payment_id: &str,
        source: SettlementSource,
    ) -> Result<Settlement, ServiceError> {
        let (current_log, current_order) = self.reload(log.id, log.order_id).await?;

        let log_matches = current_log.status == PaymentLogStatus::Paid
            && current_log.razorpay_payment_id.as_deref() == Some(payment_id);
        let order_matches = current_order.payment_status == PaymentStatus::Paid
            && current_order.payment_intent_id.as_deref() == Some(payment_id);

        if log_matches && order_matches {
            info!(
                log_id = %log.id,
                source = source.as_str(),
                "payment already settled by a concurrent caller"
            );
            return Ok(Settlement::AlreadySettled {
                order: current_order,
                log: current_log,
            });
        }

        if current_order.status == OrderStatus::Cancelled {
            return Err(ServiceError::OrderClosed(format!(
                "order {} is cancelled",
                current_order.order_number
            )));
        }

        self.security
            .record(
                SecurityEvent::new(
                    actions::PAYMENT_SETTLEMENT_CONFLICT,
                    SecuritySeverity::Critical,
                    json!({
                        "payment_log_id": log.id,
                        "order_id": log.order_id,
                        "attempted_payment_id": payment_id,
                        "log_status": current_log.status,
                        "log_payment_id": current_log.razorpay_payment_id,
                        "order_payment_status": current_order.payment_status,
                        "order_payment_intent_id": current_order.payment_intent_id,
                        "source": source.as_str(),
                    }),
                )
                .user(current_order.user_id)
                .blocked(),
            )
            .await;
        metrics::counter!("storefront.payment_conflicts", 1, "source" => source.as_str());

        Err(ServiceError::PaymentConflict(format!(
            "payment log {} did not settle with {}",
            log.id, payment_id
        )))
    }

    /// Moves the attempt to PAID and the order to PAID/CONFIRMED atomically.
    #[instrument(skip(self, log, signature, gateway_response), fields(log_id = %log.id, source = source.as_str()))]
    pub async fn settle_paid(
        &self,
        log: &payment_log::Model,
        payment_id: &str,
        signature: Option<&str>,
        source: SettlementSource,
        gateway_response: Option<Value>,
    ) -> Result<Settlement, ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(log.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", log.order_id)))?;

        if order.payment_status == PaymentStatus::Paid {
            txn.rollback().await?;
            if order.payment_intent_id.as_deref() == Some(payment_id) {
                return self.resolve_lost_race(log, payment_id, source).await;
            }
            return Err(ServiceError::OrderAlreadyPaid);
        }
        if order.status == OrderStatus::Cancelled {
            txn.rollback().await?;
            return Err(ServiceError::OrderClosed(format!(
                "order {} is cancelled",
                order.order_number
            )));
        }

        let mut log_update = payment_log::ActiveModel {
            status: Set(PaymentLogStatus::Paid),
            razorpay_payment_id: Set(Some(payment_id.to_string())),
            updated_at: Set(now),
            ..Default::default()
        };
        if let Some(signature) = signature {
            log_update.razorpay_signature = Set(Some(signature.to_string()));
        }
        if let Some(response) = gateway_response.clone() {
            log_update.gateway_response = Set(Some(response));
        }

        let log_rows = payment_log::Entity::update_many()
            .set(log_update)
            .filter(payment_log::Column::Id.eq(log.id))
            .filter(payment_log::Column::Status.eq(PaymentLogStatus::Pending))
            .exec(&txn)
            .await?
            .rows_affected;

        if log_rows == 0 {
            txn.rollback().await?;
            return self.resolve_lost_race(log, payment_id, source).await;
        }

        let order_update = paid_order_update(payment_id, now);
        let order_result = order::Entity::update_many()
            .set(order_update)
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::PaymentStatus.ne(PaymentStatus::Paid))
            .filter(order::Column::Status.ne(OrderStatus::Cancelled))
            .exec(&txn)
            .await;

        let order_rows = match order_result {
            Ok(result) => result.rows_affected,
            Err(err) if is_unique_violation(&err) => {
                warn!(%payment_id, "payment id already settles another order");
                0
            }
            Err(err) => return Err(err.into()),
        };

        if order_rows == 0 {
            txn.rollback().await?;
            return self.resolve_lost_race(log, payment_id, source).await;
        }

        txn.commit().await?;

        let settled_order = order::Model {
            status: OrderStatus::Confirmed,
            payment_status: PaymentStatus::Paid,
            payment_intent_id: Some(payment_id.to_string()),
            updated_at: now,
            ..order
        };
        let settled_log = payment_log::Model {
            status: PaymentLogStatus::Paid,
            razorpay_payment_id: Some(payment_id.to_string()),
            razorpay_signature: signature
                .map(str::to_string)
                .or_else(|| log.razorpay_signature.clone()),
            gateway_response: gateway_response.or_else(|| log.gateway_response.clone()),
            updated_at: now,
            ..log.clone()
        };

        info!(
            order_id = %settled_order.id,
            %payment_id,
            source = source.as_str(),
            "payment settled"
        );
        metrics::counter!("storefront.payments_settled", 1, "source" => source.as_str());

        self.cart.clear_best_effort(settled_order.user_id).await;

        Ok(Settlement::Settled {
            order: settled_order,
            log: settled_log,
        })
    }

    /// Marks a pending attempt FAILED and cancels its order unless it was paid.
    ///
    /// Cancelling returns the order's items to stock. Both writes are
    /// conditional, so repeated failure reports change nothing.
    #[instrument(skip(self, log, gateway_response), fields(log_id = %log.id))]
    pub async fn mark_failed(
        &self,
        log: &payment_log::Model,
        reason: &str,
        payment_id: Option<&str>,
        gateway_response: Option<Value>,
    ) -> Result<FailureOutcome, ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let mut log_update = payment_log::ActiveModel {
            status: Set(PaymentLogStatus::Failed),
            failure_reason: Set(Some(reason.to_string())),
            updated_at: Set(now),
            ..Default::default()
        };
        if let Some(payment_id) = payment_id {
            log_update.razorpay_payment_id = Set(Some(payment_id.to_string()));
        }
        if let Some(response) = gateway_response {
            log_update.gateway_response = Set(Some(response));
        }

        let log_failed = payment_log::Entity::update_many()
            .set(log_update)
            .filter(payment_log::Column::Id.eq(log.id))
            .filter(payment_log::Column::Status.eq(PaymentLogStatus::Pending))
            .exec(&txn)
            .await?
            .rows_affected
            > 0;

        let order_cancelled = order::Entity::update_many()
            .set(order::ActiveModel {
                status: Set(OrderStatus::Cancelled),
                payment_status: Set(PaymentStatus::Failed),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(log.order_id))
            .filter(order::Column::PaymentStatus.ne(PaymentStatus::Paid))
            .filter(order::Column::Status.ne(OrderStatus::Cancelled))
            .exec(&txn)
            .await?
            .rows_affected
            > 0;

        if order_cancelled {
            let items = order_item::Entity::find()
                .filter(order_item::Column::OrderId.eq(log.order_id))
                .all(&txn)
                .await?;
            for item in items {
                product::Entity::update_many()
                    .col_expr(
                        product::Column::Stock,
                        Expr::col(product::Column::Stock).add(item.quantity),
                    )
                    .col_expr(product::Column::UpdatedAt, Expr::value(now))
                    .filter(product::Column::Id.eq(item.product_id))
                    .exec(&txn)
                    .await?;
            }
        }

        txn.commit().await?;

        let outcome = FailureOutcome {
            log_failed,
            order_cancelled,
        };

        if log_failed || order_cancelled {
            warn!(
                order_id = %log.order_id,
                reason,
                log_failed,
                order_cancelled,
                "payment attempt failed"
            );
            metrics::counter!("storefront.payments_failed", 1);

            if let Some(order) = order::Entity::find_by_id(log.order_id)
                .one(&*self.db)
                .await?
            {
                self.cart.clear_best_effort(order.user_id).await;
            }
        }

        Ok(outcome)
    }
}

fn paid_order_update(payment_id: &str, now: chrono::DateTime<Utc>) -> order::ActiveModel {
    order::ActiveModel {
        status: Set(OrderStatus::Confirmed),
        payment_status: Set(PaymentStatus::Paid),
        payment_intent_id: Set(Some(payment_id.to_string())),
        updated_at: Set(now),
        ..Default::default()
    }
}
