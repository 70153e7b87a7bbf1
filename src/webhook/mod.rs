//! Delivery event receiver — webhook endpoint, signature verification,
//! and event classification.

pub mod event;
pub mod routes;
pub mod signature;

pub use routes::{WebhookState, webhook_routes};
