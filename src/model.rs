//! Core data model — contacts, templates, sequences, jobs, and delivery events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// A contact captured by the lead pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Set by the dispatcher after a successful send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contacted_at: Option<DateTime<Utc>>,
    /// Set by the planner to the first scheduled step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_follow_up_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Create a new contact with just an email address.
    pub fn new(email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            name: None,
            first_name: None,
            last_name: None,
            company: None,
            phone: None,
            last_contacted_at: None,
            next_follow_up_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builder: set company.
    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }
}

/// An email template. Immutable during a send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    /// Declared variable names (informational; rendering uses the job's map).
    #[serde(default)]
    pub variables: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailTemplate {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        subject: impl Into<String>,
        body_html: impl Into<String>,
        body_text: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            subject: subject.into(),
            body_html: body_html.into(),
            body_text: body_text.into(),
            variables: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One step of a sequence. Step JSON is tolerant: missing or non-numeric
/// `step_number`/`wait_days` coerce to `None` rather than failing the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub step_number: Option<i64>,
    #[serde(default)]
    pub template_id: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub wait_days: Option<i64>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl SequenceStep {
    pub fn new(step_number: i64, template_id: impl Into<String>, wait_days: i64) -> Self {
        Self {
            step_number: Some(step_number),
            template_id: template_id.into(),
            wait_days: Some(wait_days),
            variables: HashMap::new(),
        }
    }

    /// Builder: attach step variables.
    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }
}

/// Accept a number, a numeric string, or anything else (→ None).
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// An ordered multi-step campaign definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSequence {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub steps: Vec<SequenceStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailSequence {
    pub fn new(name: impl Into<String>, steps: Vec<SequenceStep>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            is_active: true,
            steps,
            created_at: now,
            updated_at: now,
        }
    }
}

/// How a job was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Scheduled,
    Immediate,
}

/// Job lifecycle status.
///
/// Advances monotonically: `scheduled → sending` only via the dispatcher's
/// claim, `sending → sent|failed` via the send outcome. `failed` and
/// `cancelled` are terminal and never reverted by delivery events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

/// The unit of work and durable record of one scheduled or sent email.
/// Rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: Uuid,
    pub contact_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_number: Option<i64>,
    pub template_id: String,
    pub schedule_type: ScheduleType,
    pub scheduled_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Step variables captured at enrollment, fed to the renderer.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clicked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailJob {
    /// Create a new job in `scheduled` status.
    pub fn new(
        contact_id: Uuid,
        template_id: impl Into<String>,
        schedule_type: ScheduleType,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contact_id,
            sequence_id: None,
            step_number: None,
            template_id: template_id.into(),
            schedule_type,
            scheduled_at,
            status: JobStatus::Scheduled,
            variables: HashMap::new(),
            provider_message_id: None,
            sent_at: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: link to a sequence step.
    pub fn with_sequence(mut self, sequence_id: Uuid, step_number: i64) -> Self {
        self.sequence_id = Some(sequence_id);
        self.step_number = Some(step_number);
        self
    }

    /// Builder: attach render variables.
    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }
}

/// Internal delivery-event taxonomy. Provider event-type strings map into
/// this closed set; anything else is `Unknown` and ignored upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEventKind {
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Failed,
    Unknown,
}

impl DeliveryEventKind {
    /// Map a provider event-type string (with or without the `email.`
    /// prefix) to the internal taxonomy.
    pub fn classify(event_type: &str) -> Self {
        let name = event_type.strip_prefix("email.").unwrap_or(event_type);
        match name {
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "opened" => Self::Opened,
            "clicked" => Self::Clicked,
            "bounced" => Self::Bounced,
            "complained" => Self::Complained,
            "failed" | "delivery_failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Complained => "complained",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// The reconciliation payload handed to the store when applying one
/// delivery event to one job.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Provider's delivery id (the webhook id header).
    pub provider_event_id: Option<String>,
    /// When the event occurred at the provider.
    pub occurred_at: DateTime<Utc>,
    /// Bounce/complaint/error message, when the payload carries one.
    pub message: Option<String>,
    /// Full raw webhook payload, kept for the audit trail.
    pub raw_payload: serde_json::Value,
}

/// Append-only delivery event log row. Never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailEvent {
    pub id: Uuid,
    pub email_job_id: Uuid,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_event_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub raw_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A per-contact activity log entry, appended after successful sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub kind: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    /// Entry for an outbound email that was handed to the provider.
    pub fn email_sent(contact_id: Uuid, subject: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            contact_id,
            kind: "email_sent".to_string(),
            detail: format!("Sent email: {subject}"),
            created_at: Utc::now(),
        }
    }
}
