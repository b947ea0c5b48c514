pub mod address;
pub mod cart_item;
pub mod order;
pub mod order_item;
pub mod payment_log;
pub mod product;
pub mod security_log;

pub use order::{OrderStatus, PaymentStatus};
pub use payment_log::PaymentLogStatus;
pub use security_log::SecuritySeverity;
