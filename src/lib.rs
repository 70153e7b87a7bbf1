//! Outreach engine — email sequence scheduling and delivery-event reconciliation.

pub mod config;
pub mod dispatch;
pub mod enroll;
pub mod error;
pub mod model;
pub mod render;
pub mod sender;
pub mod store;
pub mod webhook;
