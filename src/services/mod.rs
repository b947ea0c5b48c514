pub mod cart;
pub mod orders;
pub mod payments;
pub mod reconciliation;
pub mod tax;
pub mod verification;
