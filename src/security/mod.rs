use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::security_log;
pub use crate::entities::SecuritySeverity;

/// Audit event names written to `security_logs`.
pub mod actions {
    pub const UNAUTHENTICATED_REQUEST: &str = "UNAUTHENTICATED_REQUEST";
    pub const UNAUTHORIZED_ORDER_ACCESS: &str = "UNAUTHORIZED_ORDER_ACCESS";
    pub const UNAUTHORIZED_PAYMENT_VERIFICATION: &str = "UNAUTHORIZED_PAYMENT_VERIFICATION";
    pub const DUPLICATE_PAYMENT_ATTEMPT: &str = "DUPLICATE_PAYMENT_ATTEMPT";
    pub const PAYMENT_SIGNATURE_MISMATCH: &str = "PAYMENT_SIGNATURE_MISMATCH";
    pub const INVALID_WEBHOOK_SIGNATURE: &str = "INVALID_WEBHOOK_SIGNATURE";
    pub const PAYMENT_SETTLEMENT_CONFLICT: &str = "PAYMENT_SETTLEMENT_CONFLICT";
    pub const CAPTURE_ON_CLOSED_ORDER: &str = "CAPTURE_ON_CLOSED_ORDER";
}

#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub action: &'static str,
    pub severity: SecuritySeverity,
    pub ip_address: Option<String>,
    pub user_id: Option<Uuid>,
    pub details: Value,
    pub blocked: bool,
}

impl SecurityEvent {
    pub fn new(action: &'static str, severity: SecuritySeverity, details: Value) -> Self {
        Self {
            action,
            severity,
            ip_address: None,
            user_id: None,
            details,
            blocked: false,
        }
    }

    pub fn ip(mut self, ip: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_string);
        self
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn blocked(mut self) -> Self {
        self.blocked = true;
        self
    }
}

/// Best-effort audit sink. Write failures are logged and swallowed.
#[derive(Clone)]
pub struct SecurityLogger {
    db: Arc<DatabaseConnection>,
}

impl SecurityLogger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn record(&self, event: SecurityEvent) {
        match event.severity {
            SecuritySeverity::Low => info!(
                action = event.action,
                ip = ?event.ip_address,
                user_id = ?event.user_id,
                blocked = event.blocked,
                details = %event.details,
                "security event"
            ),
            SecuritySeverity::Medium => warn!(
                action = event.action,
                ip = ?event.ip_address,
                user_id = ?event.user_id,
                blocked = event.blocked,
                details = %event.details,
                "security event"
            ),
            SecuritySeverity::High | SecuritySeverity::Critical => error!(
                action = event.action,
                severity = ?event.severity,
                ip = ?event.ip_address,
                user_id = ?event.user_id,
                blocked = event.blocked,
                details = %event.details,
                "security event"
            ),
        }
        metrics::counter!("storefront.security_events", 1, "action" => event.action);

        let row = security_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            action: Set(event.action.to_string()),
            severity: Set(event.severity),
            ip_address: Set(event.ip_address),
            user_id: Set(event.user_id),
            details: Set(event.details),
            blocked: Set(event.blocked),
            created_at: Set(Utc::now()),
        };

        if let Err(e) = row.insert(&*self.db).await {
            error!(error = %e, "failed to persist security event");
        }
    }
}
