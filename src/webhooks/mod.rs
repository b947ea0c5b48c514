/// Inbound gateway notifications
pub mod events;
pub mod processor;

pub use events::{OrderEntity, PaymentEntity, WebhookEvent};
pub use processor::{WebhookAck, WebhookAckStatus, WebhookProcessor};
