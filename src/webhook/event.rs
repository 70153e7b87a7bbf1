//! Delivery event payloads as posted by the send provider.
//!
//! Deserialization is tolerant: every field is optional and unknown
//! fields are ignored, so provider payload drift degrades to a no-op
//! instead of a rejected delivery.

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Top-level webhook payload.
#[derive(Debug, Deserialize)]
pub struct DeliveryEnvelope {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub created_at: Option<String>,
    #[serde(default)]
    pub data: EventData,
}

/// The `data` object. The provider message id arrives as either
/// `email_id` or `id` depending on the event family.
#[derive(Debug, Default, Deserialize)]
pub struct EventData {
    #[serde(alias = "id")]
    pub email_id: Option<String>,
    pub bounce: Option<EventDetail>,
    pub error: Option<EventDetail>,
}

#[derive(Debug, Deserialize)]
pub struct EventDetail {
    pub message: Option<String>,
}

impl DeliveryEnvelope {
    /// When the event occurred, falling back to `now` if the payload
    /// carries no parseable timestamp.
    pub fn occurred_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.created_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or(now)
    }
}
