use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::PaymentPolicyConfig;
use crate::entities::{order, payment_log, OrderStatus, PaymentLogStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::gateway::{
    to_minor_units, CreateGatewayOrder, GatewayRetryPolicy, PaymentGateway, GATEWAY_NAME,
};
use crate::middleware_helpers::retry::with_retry;
use crate::security::{actions, SecurityEvent, SecurityLogger, SecuritySeverity};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateSessionInput {
    pub order_id: Uuid,
    /// Amount in major units; must equal the order total
    pub amount: Decimal,
}

/// Everything the browser checkout widget needs to open the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PaymentSession {
    pub key_id: String,
    pub gateway_order_id: String,
    /// Amount in minor units (paise)
    pub amount_minor: i64,
    pub currency: String,
    pub receipt: String,
    pub order_id: Uuid,
    pub order_number: String,
    /// True when an existing pending attempt was returned
    pub reused: bool,
}

/// Opens (or reuses) a gateway payment attempt for an order.
#[derive(Clone)]
pub struct PaymentSessionService {
    db: Arc<DatabaseConnection>,
    gateway: Arc<dyn PaymentGateway>,
    security: SecurityLogger,
    policy: PaymentPolicyConfig,
}

impl PaymentSessionService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        security: SecurityLogger,
        policy: PaymentPolicyConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            security,
            policy,
        }
    }

    fn check_amount(&self, amount: Decimal, order: &order::Model) -> Result<(), ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::InvalidAmount(
                "amount must be positive".to_string(),
            ));
        }
        if amount < self.policy.min_amount || amount > self.policy.max_amount {
            return Err(ServiceError::InvalidAmount(format!(
                "amount must be between {} and {}",
                self.policy.min_amount, self.policy.max_amount
            )));
        }
        if amount.round_dp(2) != order.total_amount.round_dp(2) {
            return Err(ServiceError::InvalidAmount(format!(
                "amount does not match order total {}",
                order.total_amount.round_dp(2)
            )));
        }
        Ok(())
    }

    fn session_from_log(&self, log: &payment_log::Model, order: &order::Model) -> Result<PaymentSession, ServiceError> {
        Ok(PaymentSession {
            key_id: self.gateway.key_id().to_string(),
            gateway_order_id: log.razorpay_order_id.clone(),
            amount_minor: minor_units(log.amount)?,
            currency: log.currency.clone(),
            receipt: order.order_number.clone(),
            order_id: order.id,
            order_number: order.order_number.clone(),
            reused: true,
        })
    }

    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    pub async fn create_session(
        &self,
        user_id: Uuid,
        input: CreateSessionInput,
        ip: Option<&str>,
    ) -> Result<PaymentSession, ServiceError> {
        let order = order::Entity::find_by_id(input.order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", input.order_id)))?;

        if order.user_id != user_id {
            self.security
                .record(
                    SecurityEvent::new(
                        actions::UNAUTHORIZED_ORDER_ACCESS,
                        SecuritySeverity::High,
                        json!({ "order_id": order.id, "operation": "create_payment_session" }),
                    )
                    .user(user_id)
                    .ip(ip)
                    .blocked(),
                )
                .await;
            return Err(ServiceError::Forbidden(
                "order belongs to another user".to_string(),
            ));
        }

        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::Conflict(format!(
                "order {} is already paid",
                order.order_number
            )));
        }
        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::OrderClosed(format!(
                "order {} is cancelled",
                order.order_number
            )));
        }

        self.check_amount(input.amount, &order)?;

        if let Some(log) = latest_open_attempt(&*self.db, order.id).await? {
            info!(gateway_order_id = %log.razorpay_order_id, "reusing pending payment attempt");
            return self.session_from_log(&log, &order);
        }

        let amount = order.total_amount.round_dp(2);
        let amount_minor = minor_units(amount)?;

        let mut notes = BTreeMap::new();
        notes.insert("order_id".to_string(), order.id.to_string());
        notes.insert("order_number".to_string(), order.order_number.clone());
        let request = CreateGatewayOrder {
            amount: amount_minor,
            currency: order.currency.clone(),
            receipt: order.order_number.clone(),
            notes,
        };

        let outcome = with_retry(&self.policy.retry_config(), GatewayRetryPolicy, || {
            self.gateway.create_order(request.clone())
        })
        .await;
        let retries = outcome.retries();
        let gateway_order = outcome.result.map_err(|e| {
            error!(error = %e, order_id = %order.id, "gateway order creation failed");
            metrics::counter!("storefront.gateway_failures", 1);
            ServiceError::from(e)
        })?;

        let now = Utc::now();
        let txn = self.db.begin().await?;

        // Writing the order row first serializes concurrent sessions for it.
        let claimed = order::Entity::update_many()
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::PaymentStatus.ne(PaymentStatus::Paid))
            .filter(order::Column::Status.ne(OrderStatus::Cancelled))
            .exec(&txn)
            .await?
            .rows_affected;
        if claimed == 0 {
            txn.rollback().await?;
            warn!(order_id = %order.id, "order settled or closed while opening a session");
            return Err(ServiceError::Conflict(format!(
                "order {} is no longer payable",
                order.order_number
            )));
        }

        if let Some(log) = latest_open_attempt(&txn, order.id).await? {
            txn.commit().await?;
            warn!(
                discarded_gateway_order_id = %gateway_order.id,
                gateway_order_id = %log.razorpay_order_id,
                "concurrent session already recorded, reusing it"
            );
            return self.session_from_log(&log, &order);
        }

        let previous_attempts = payment_log::Entity::find()
            .filter(payment_log::Column::OrderId.eq(order.id))
            .count(&txn)
            .await?;

        let log = payment_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            razorpay_order_id: Set(gateway_order.id.clone()),
            razorpay_payment_id: Set(None),
            razorpay_signature: Set(None),
            amount: Set(amount),
            currency: Set(order.currency.clone()),
            status: Set(PaymentLogStatus::Pending),
            gateway: Set(GATEWAY_NAME.to_string()),
            gateway_response: Set(Some(gateway_order.raw.clone())),
            failure_reason: Set(None),
            retry_count: Set(retries as i32),
            attempt_number: Set(previous_attempts as i32 + 1),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(
            gateway_order_id = %log.razorpay_order_id,
            attempt = log.attempt_number,
            retries,
            "payment session created"
        );

        Ok(PaymentSession {
            key_id: self.gateway.key_id().to_string(),
            gateway_order_id: log.razorpay_order_id,
            amount_minor,
            currency: log.currency,
            receipt: order.order_number.clone(),
            order_id: order.id,
            order_number: order.order_number,
            reused: false,
        })
    }
}

/// Latest attempt for an order that has not failed.
async fn latest_open_attempt<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Option<payment_log::Model>, ServiceError> {
    let log = payment_log::Entity::find()
        .filter(payment_log::Column::OrderId.eq(order_id))
        .filter(payment_log::Column::Status.ne(PaymentLogStatus::Failed))
        .order_by_desc(payment_log::Column::CreatedAt)
        .one(conn)
        .await?;
    Ok(log)
}

fn minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    to_minor_units(amount.round_dp(2)).ok_or_else(|| {
        ServiceError::InvalidAmount(format!("amount {} cannot be charged", amount))
    })
}
