//! Error types for the outreach engine, grouped by concern. Each subsystem
//! propagates its own enum; the binary aggregates with `anyhow`.

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Per-job dispatcher errors. One job's failure never aborts the batch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The claim compare-and-set found a non-`scheduled` status.
    #[error("Job {id} already claimed or no longer scheduled")]
    AlreadyClaimed { id: Uuid },

    #[error("Contact {contact_id} not found for job {job_id}")]
    ContactNotFound { job_id: Uuid, contact_id: Uuid },

    #[error("Template {template_id} not found for job {job_id}")]
    TemplateNotFound { job_id: Uuid, template_id: String },

    #[error("Send failed: {0}")]
    Send(#[from] SendError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Outbound send provider errors.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Failed to build message: {0}")]
    BuildFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Provider returned {status}: {reason}")]
    Provider { status: u16, reason: String },
}

/// Webhook authentication and parsing errors. These are the only
/// conditions that surface as HTTP 400 to the provider.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid timestamp header: {0}")]
    InvalidTimestamp(String),

    #[error("Timestamp outside tolerance window ({skew_secs}s skew)")]
    StaleTimestamp { skew_secs: i64 },

    #[error("No signature matched the payload")]
    SignatureMismatch,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}
