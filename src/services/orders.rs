use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::config::{AppConfig, ShippingConfig};
use crate::entities::{address, order, order_item, product, OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::gateway::GATEWAY_NAME;
use crate::security::{actions, SecurityEvent, SecurityLogger, SecuritySeverity};
use crate::services::cart::CartService;
use crate::services::tax::{TaxEngine, TaxLine, TaxRequest};

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct OrderLineInput {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ShippingAddressInput {
    #[validate(length(min = 1, max = 120))]
    pub full_name: String,
    #[validate(length(min = 1, max = 255))]
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    /// Tax jurisdiction; a blank value is rejected as `MISSING_SHIPPING_STATE`
    #[serde(default)]
    pub state: String,
    #[validate(length(min = 3, max = 12))]
    pub postal_code: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub phone: Option<String>,
}

fn default_country() -> String {
    "IN".to_string()
}

impl PlaceOrderInput {
    fn validate_fields(&self) -> Result<(), ServiceError> {
        for line in &self.items {
            line.validate()?;
        }
        if let Some(address) = &self.shipping_address {
            address.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PlaceOrderInput {
    #[serde(default)]
    pub items: Vec<OrderLineInput>,
    /// Saved address owned by the caller
    #[serde(default)]
    pub address_id: Option<Uuid>,
    /// Inline address, stored with the order
    #[serde(default)]
    pub shipping_address: Option<ShippingAddressInput>,
}

/// Order with its line items.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

enum ResolvedAddress {
    Saved(address::Model),
    Inline(ShippingAddressInput),
}

impl ResolvedAddress {
    fn state(&self) -> &str {
        match self {
            Self::Saved(address) => &address.state,
            Self::Inline(input) => &input.state,
        }
    }
}

struct PricedLine {
    product: product::Model,
    quantity: i32,
    line_total: Decimal,
}

/// Merges repeated product ids, keeping first-seen order.
fn merge_lines(items: &[OrderLineInput]) -> Vec<(Uuid, i32)> {
    let mut merged: Vec<(Uuid, i32)> = Vec::with_capacity(items.len());
    for item in items {
        match merged.iter_mut().find(|(id, _)| *id == item.product_id) {
            Some((_, qty)) => *qty += item.quantity,
            None => merged.push((item.product_id, item.quantity)),
        }
    }
    merged
}

/// `ORD-YYYYMMDD-XXXXXXXX`
pub fn generate_order_number() -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

/// Converts priced cart lines into a persisted, tax-computed order.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    tax_engine: Arc<dyn TaxEngine>,
    shipping: ShippingConfig,
    currency: String,
    cart: CartService,
    security: SecurityLogger,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        tax_engine: Arc<dyn TaxEngine>,
        security: SecurityLogger,
        config: &AppConfig,
    ) -> Self {
        Self {
            cart: CartService::new(db.clone()),
            db,
            tax_engine,
            security,
            shipping: config.shipping.clone(),
            currency: config.payments.currency.clone(),
        }
    }

    fn shipping_fee_for(&self, subtotal: Decimal) -> Decimal {
        match self.shipping.free_shipping_threshold {
            Some(threshold) if subtotal >= threshold => Decimal::ZERO,
            _ => self.shipping.shipping_fee,
        }
    }

    async fn resolve_address(
        &self,
        user_id: Uuid,
        input: &PlaceOrderInput,
    ) -> Result<ResolvedAddress, ServiceError> {
        if let Some(address_id) = input.address_id {
            let saved = address::Entity::find_by_id(address_id)
                .one(&*self.db)
                .await?
                .filter(|a| a.user_id == user_id)
                .ok_or_else(|| ServiceError::NotFound(format!("Address {} not found", address_id)))?;
            return Ok(ResolvedAddress::Saved(saved));
        }

        input
            .shipping_address
            .clone()
            .map(ResolvedAddress::Inline)
            .ok_or(ServiceError::MissingShippingState)
    }

    /// Loads and prices every line, failing on the first unavailable or short product.
    async fn price_lines(&self, lines: &[(Uuid, i32)]) -> Result<Vec<PricedLine>, ServiceError> {
        let ids: Vec<Uuid> = lines.iter().map(|(id, _)| *id).collect();
        let products = product::Entity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(&*self.db)
            .await?;

        let mut priced = Vec::with_capacity(lines.len());
        for (product_id, quantity) in lines {
            let product = products
                .iter()
                .find(|p| p.id == *product_id && p.is_active)
                .cloned()
                .ok_or_else(|| ServiceError::ProductUnavailable(product_id.to_string()))?;

            if product.stock < *quantity {
                return Err(ServiceError::InsufficientStock(format!(
                    "only {} unit(s) of {} available",
                    product.stock.max(0),
                    product.name
                )));
            }

            priced.push(PricedLine {
                line_total: product.price * Decimal::from(*quantity),
                quantity: *quantity,
                product,
            });
        }
        Ok(priced)
    }

    /// Validates, prices and persists an order in one transaction.
    #[instrument(skip(self, input), fields(lines = input.items.len()))]
    pub async fn place_order(
        &self,
        user_id: Uuid,
        input: PlaceOrderInput,
    ) -> Result<OrderDetails, ServiceError> {
        if input.items.is_empty() {
            return Err(ServiceError::EmptyOrder);
        }
        input.validate_fields()?;

        let address = self.resolve_address(user_id, &input).await?;
        let shipping_state = address.state().trim().to_string();
        if shipping_state.is_empty() {
            return Err(ServiceError::MissingShippingState);
        }

        let lines = merge_lines(&input.items);
        let priced = self.price_lines(&lines).await?;

        let subtotal: Decimal = priced.iter().map(|l| l.line_total).sum();
        let shipping_fee = self.shipping_fee_for(subtotal);
        let tax = self.tax_engine.calculate(&TaxRequest {
            lines: priced
                .iter()
                .map(|l| TaxLine {
                    category: l.product.category.clone(),
                    amount: l.line_total,
                })
                .collect(),
            subtotal,
            shipping_fee,
            shipping_state,
        })?;
        let total_amount = tax.final_total;
        let now = Utc::now();

        let txn = self.db.begin().await?;

        let address_id = match address {
            ResolvedAddress::Saved(saved) => saved.id,
            ResolvedAddress::Inline(input) => {
                address::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    full_name: Set(input.full_name),
                    line1: Set(input.line1),
                    line2: Set(input.line2),
                    city: Set(input.city),
                    state: Set(input.state.trim().to_string()),
                    postal_code: Set(input.postal_code),
                    country: Set(input.country),
                    phone: Set(input.phone),
                    created_at: Set(now),
                }
                .insert(&txn)
                .await?
                .id
            }
        };

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(generate_order_number()),
            user_id: Set(user_id),
            address_id: Set(address_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            payment_method: Set(GATEWAY_NAME.to_string()),
            currency: Set(self.currency.clone()),
            subtotal_amount: Set(subtotal),
            tax_amount: Set(tax.total_tax_amount),
            shipping_fee: Set(shipping_fee),
            total_amount: Set(total_amount),
            tax_breakdown: Set(serde_json::to_value(&tax.tax_breakdown)?),
            payment_intent_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(priced.len());
        for line in &priced {
            let decremented = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(line.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(line.product.id))
                .filter(product::Column::IsActive.eq(true))
                .filter(product::Column::Stock.gte(line.quantity))
                .exec(&txn)
                .await?;

            if decremented.rows_affected == 0 {
                txn.rollback().await?;
                warn!(product_id = %line.product.id, "stock changed under intake, rolling back");
                return Err(ServiceError::InsufficientStock(format!(
                    "{} is no longer available in the requested quantity",
                    line.product.name
                )));
            }

            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(line.product.id),
                name: Set(line.product.name.clone()),
                category: Set(line.product.category.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.product.price),
                line_total: Set(line.line_total),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        txn.commit().await?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total_amount,
            "order placed"
        );
        metrics::counter!("storefront.orders_placed", 1);

        self.cart.clear_best_effort(user_id).await;

        Ok(OrderDetails { order, items })
    }

    /// Places an order from the caller's server-side cart.
    pub async fn place_order_from_cart(
        &self,
        user_id: Uuid,
        mut input: PlaceOrderInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.items = self
            .cart
            .items(user_id)
            .await?
            .into_iter()
            .map(|line| OrderLineInput {
                product_id: line.product_id,
                quantity: line.quantity,
            })
            .collect();
        self.place_order(user_id, input).await
    }

    #[instrument(skip(self, ip))]
    pub async fn get_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        ip: Option<&str>,
    ) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.user_id != user_id {
            self.security
                .record(
                    SecurityEvent::new(
                        actions::UNAUTHORIZED_ORDER_ACCESS,
                        SecuritySeverity::High,
                        json!({ "order_id": order.id, "operation": "get_order" }),
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

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderDetails { order, items })
    }
}
