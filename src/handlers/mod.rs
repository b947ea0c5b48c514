pub mod orders;
pub mod payment_webhooks;
pub mod payments;

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::gateway::PaymentGateway;
use crate::security::SecurityLogger;
use crate::services::{
    cart::CartService,
    orders::OrderService,
    payments::PaymentSessionService,
    reconciliation::PaymentReconciler,
    tax::{GstTaxEngine, TaxEngine},
    verification::PaymentVerificationService,
};
use crate::webhooks::WebhookProcessor;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentSessionService>,
    pub verification: Arc<PaymentVerificationService>,
    pub webhooks: Arc<WebhookProcessor>,
}

impl AppServices {
    pub fn new(db: Arc<DbPool>, gateway: Arc<dyn PaymentGateway>, config: &AppConfig) -> Self {
        let tax_engine: Arc<dyn TaxEngine> = Arc::new(GstTaxEngine::new(&config.tax));
        let security = SecurityLogger::new(db.clone());
        let reconciler = PaymentReconciler::new(db.clone(), security.clone());

        Self {
            cart: Arc::new(CartService::new(db.clone())),
            orders: Arc::new(OrderService::new(
                db.clone(),
                tax_engine,
                security.clone(),
                config,
            )),
            payments: Arc::new(PaymentSessionService::new(
                db,
                gateway,
                security.clone(),
                config.payments.clone(),
            )),
            verification: Arc::new(PaymentVerificationService::new(
                reconciler.clone(),
                security.clone(),
                &config.razorpay,
            )),
            webhooks: Arc::new(WebhookProcessor::new(reconciler, security, &config.razorpay)),
        }
    }
}

/// Best-known client address for audit records.
#[derive(Debug, Clone, Default)]
pub struct ClientIp(pub Option<String>);

impl ClientIp {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        Ok(ClientIp(crate::rate_limiter::extract_client_ip(
            &parts.headers,
            peer,
        )))
    }
}
