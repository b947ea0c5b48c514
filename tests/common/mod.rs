#![allow(dead_code)]

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use storefront_payments::{
    build_router,
    config::{AppConfig, RazorpayConfig},
    db,
    entities::{address, order, payment_log, product, security_log, PaymentLogStatus},
    gateway::{
        signature::{payment_signature, webhook_signature},
        CreateGatewayOrder, GatewayError, GatewayOrder, PaymentGateway,
    },
    AppState,
};
use tower::ServiceExt;
use uuid::Uuid;

pub const KEY_ID: &str = "rzp_test_key";
pub const KEY_SECRET: &str = "test_key_secret_value";
pub const WEBHOOK_SECRET: &str = "test_webhook_secret_value";

/// Gateway double that replays scripted results, then succeeds.
#[derive(Default)]
pub struct FakeGateway {
    script: Mutex<VecDeque<Result<GatewayOrder, GatewayError>>>,
    calls: AtomicUsize,
}

impl FakeGateway {
    pub fn push_error(&self, err: GatewayError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(result) = scripted {
            return result;
        }

        let id = format!("order_{}", Uuid::new_v4().simple());
        Ok(GatewayOrder {
            raw: json!({
                "id": id,
                "entity": "order",
                "amount": request.amount,
                "currency": request.currency,
                "receipt": request.receipt,
                "status": "created",
            }),
            id,
            amount: request.amount,
            currency: request.currency,
            receipt: Some(request.receipt),
            status: Some("created".to_string()),
        })
    }

    fn key_id(&self) -> &str {
        KEY_ID
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "test_secret_key_for_testing_purposes_only_and_long_enough_for_hs256_0123456789".to_string(),
        "test".to_string(),
        RazorpayConfig::new(KEY_ID, KEY_SECRET, WEBHOOK_SECRET),
    );
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.payments.gateway_initial_backoff_ms = 1;
    cfg.payments.gateway_max_backoff_ms = 5;
    cfg.rate_limit_requests_per_window = 1_000;
    cfg
}

/// Application backed by a fresh in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(cfg: AppConfig) -> Self {
        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let gateway = Arc::new(FakeGateway::default());
        let state = AppState::new(Arc::new(pool), cfg, gateway.clone());
        let router = build_router(state.clone());

        Self {
            router,
            state,
            gateway,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    /// A fresh user id with a valid bearer token.
    pub fn new_user(&self) -> (Uuid, String) {
        let user_id = Uuid::new_v4();
        let token = self
            .state
            .auth
            .generate_token(user_id, Some("shopper@example.com"))
            .expect("token for tests");
        (user_id, token)
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&json).expect("serialize request body"))
            }
            None => Body::empty(),
        };

        self.router
            .clone()
            .oneshot(builder.body(body).expect("build request"))
            .await
            .expect("router error during test request")
    }

    pub async fn post(&self, uri: &str, body: Value, token: &str) -> Response {
        self.request(Method::POST, uri, Some(body), Some(token)).await
    }

    /// Posts raw webhook bytes with an optional signature header.
    pub async fn post_webhook_raw(&self, raw: Vec<u8>, signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json")
            .header("x-razorpay-event-id", format!("evt_{}", Uuid::new_v4().simple()));
        if let Some(sig) = signature {
            builder = builder.header("x-razorpay-signature", sig);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::from(raw)).expect("build webhook request"))
            .await
            .expect("router error during webhook request")
    }

    /// Posts a correctly signed webhook.
    pub async fn post_webhook(&self, payload: &Value) -> Response {
        let raw = serde_json::to_vec(payload).expect("serialize webhook");
        let signature = webhook_signature(WEBHOOK_SECRET, &raw);
        self.post_webhook_raw(raw, Some(&signature)).await
    }

    pub async fn seed_product(&self, name: &str, category: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
            name: Set(name.to_string()),
            category: Set(category.to_string()),
            price: Set(price),
            stock: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed product")
    }

    pub async fn seed_address(&self, user_id: Uuid, state: &str) -> address::Model {
        address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            full_name: Set("Asha Rao".to_string()),
            line1: Set("12 MG Road".to_string()),
            line2: Set(None),
            city: Set("Pune".to_string()),
            state: Set(state.to_string()),
            postal_code: Set("411001".to_string()),
            country: Set("IN".to_string()),
            phone: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("seed address")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(self.db())
            .await
            .unwrap()
            .expect("product exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(self.db())
            .await
            .unwrap()
            .expect("order exists")
    }

    pub async fn payment_logs(&self, order_id: Uuid) -> Vec<payment_log::Model> {
        payment_log::Entity::find()
            .filter(payment_log::Column::OrderId.eq(order_id))
            .all(self.db())
            .await
            .unwrap()
    }

    pub async fn security_actions(&self) -> Vec<String> {
        security_log::Entity::find()
            .all(self.db())
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.action)
            .collect()
    }

    /// Places a single-line order and returns the response `data`.
    pub async fn place_order(&self, token: &str, product_id: Uuid, quantity: i32, address_id: Uuid) -> Value {
        let response = self
            .post(
                "/api/v1/orders",
                json!({
                    "items": [{ "product_id": product_id, "quantity": quantity }],
                    "address_id": address_id,
                }),
                token,
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        read_json(response).await["data"].clone()
    }

    /// Opens a payment session for the full order total and returns `data`.
    pub async fn open_session(&self, token: &str, order: &Value) -> Value {
        let response = self
            .post(
                "/api/v1/payments/sessions",
                json!({ "order_id": order["id"], "amount": order["total_amount"] }),
                token,
            )
            .await;
        assert!(response.status().is_success(), "session status {}", response.status());
        read_json(response).await["data"].clone()
    }

    pub async fn verify(&self, token: &str, gateway_order_id: &str, payment_id: &str, signature: &str) -> Response {
        self.post(
            "/api/v1/payments/verify",
            json!({
                "razorpay_order_id": gateway_order_id,
                "razorpay_payment_id": payment_id,
                "razorpay_signature": signature,
            }),
            token,
        )
        .await
    }
}

pub async fn read_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn dec_field(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}

pub fn sign_payment(gateway_order_id: &str, payment_id: &str) -> String {
    payment_signature(KEY_SECRET, gateway_order_id, payment_id)
}

pub fn payment_event(event: &str, gateway_order_id: &str, payment_id: &str) -> Value {
    json!({
        "entity": "event",
        "event": event,
        "contains": ["payment"],
        "payload": {
            "payment": {
                "entity": {
                    "id": payment_id,
                    "entity": "payment",
                    "order_id": gateway_order_id,
                    "amount": 123000,
                    "currency": "INR",
                    "status": if event == "payment.failed" { "failed" } else { "captured" },
                    "error_code": if event == "payment.failed" { json!("BAD_REQUEST_ERROR") } else { Value::Null },
                    "error_description": if event == "payment.failed" { json!("Payment declined by bank") } else { Value::Null },
                }
            }
        },
        "created_at": Utc::now().timestamp(),
    })
}

/// A user with a placed order and an open payment session.
pub struct Checkout {
    pub user_id: Uuid,
    pub token: String,
    pub product: product::Model,
    pub order_id: Uuid,
    pub order: Value,
    pub gateway_order_id: String,
}

impl TestApp {
    /// One electronics item at 1000 shipped out of state: 1000 + 180 + 50.
    pub async fn checkout(&self) -> Checkout {
        let (user_id, token) = self.new_user();
        let product = self
            .seed_product("Noise Cancelling Headphones", "electronics", Decimal::from(1000), 5)
            .await;
        let address = self.seed_address(user_id, "Maharashtra").await;
        let order = self.place_order(&token, product.id, 1, address.id).await;
        let session = self.open_session(&token, &order).await;

        Checkout {
            user_id,
            token,
            product,
            order_id: Uuid::parse_str(order["id"].as_str().unwrap()).unwrap(),
            gateway_order_id: session["gateway_order_id"].as_str().unwrap().to_string(),
            order,
        }
    }
}

impl TestApp {
    /// Records an extra PENDING gateway attempt for an order, bypassing the
    /// session service's reuse rule.
    pub async fn seed_pending_attempt(&self, order_id: Uuid) -> String {
        let order = self.order(order_id).await;
        let gateway_order_id = format!("order_{}", Uuid::new_v4().simple());
        let now = Utc::now();
        payment_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            razorpay_order_id: Set(gateway_order_id.clone()),
            razorpay_payment_id: Set(None),
            razorpay_signature: Set(None),
            amount: Set(order.total_amount),
            currency: Set(order.currency),
            status: Set(PaymentLogStatus::Pending),
            gateway: Set("razorpay".to_string()),
            gateway_response: Set(None),
            failure_reason: Set(None),
            retry_count: Set(0),
            attempt_number: Set(2),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("seed payment attempt");
        gateway_order_id
    }

    /// Marks an attempt PAID without touching its order.
    pub async fn force_log_paid(&self, gateway_order_id: &str, payment_id: &str) {
        let log = payment_log::Entity::find()
            .filter(payment_log::Column::RazorpayOrderId.eq(gateway_order_id))
            .one(self.db())
            .await
            .unwrap()
            .expect("payment attempt exists");
        let mut active: payment_log::ActiveModel = log.into();
        active.status = Set(PaymentLogStatus::Paid);
        active.razorpay_payment_id = Set(Some(payment_id.to_string()));
        active.updated_at = Set(Utc::now());
        active.update(self.db()).await.expect("force attempt to PAID");
    }

    pub async fn security_events(&self) -> Vec<security_log::Model> {
        security_log::Entity::find().all(self.db()).await.unwrap()
    }
}
