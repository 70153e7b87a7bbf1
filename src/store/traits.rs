//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    ActivityEntry, Contact, DeliveryEventKind, EmailEvent, EmailJob, EmailSequence, EmailTemplate,
    EventRecord,
};

/// Backend-agnostic database trait covering contacts, templates, sequences,
/// jobs, delivery events, and the activity log.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Insert a new contact.
    async fn insert_contact(&self, contact: &Contact) -> Result<(), DatabaseError>;

    /// Get a contact by ID.
    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, DatabaseError>;

    /// Set the contact's next follow-up timestamp (planner, on enrollment).
    async fn set_next_follow_up(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Set the contact's last-contacted timestamp (dispatcher, on send).
    async fn set_last_contacted(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    // ── Templates ───────────────────────────────────────────────────

    /// Insert a new template.
    async fn insert_template(&self, template: &EmailTemplate) -> Result<(), DatabaseError>;

    /// Get a template by ID.
    async fn get_template(&self, id: &str) -> Result<Option<EmailTemplate>, DatabaseError>;

    // ── Sequences ───────────────────────────────────────────────────

    /// Insert a new sequence definition.
    async fn insert_sequence(&self, sequence: &EmailSequence) -> Result<(), DatabaseError>;

    /// Get a sequence by ID.
    async fn get_sequence(&self, id: Uuid) -> Result<Option<EmailSequence>, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new email job.
    async fn insert_job(&self, job: &EmailJob) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<EmailJob>, DatabaseError>;

    /// Whether any job exists for this `(contact, sequence)` pair.
    /// The enrollment idempotency check.
    async fn has_sequence_jobs(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
    ) -> Result<bool, DatabaseError>;

    /// Jobs with `status = scheduled` and `scheduled_at <= now`, ascending
    /// by `scheduled_at`, capped at `limit`.
    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EmailJob>, DatabaseError>;

    /// Atomically transition `scheduled → sending`. Returns `false` when
    /// the job is no longer `scheduled` (claimed by a concurrent pass, or
    /// cancelled) — the caller must then skip it without any write.
    async fn claim_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Record a successful send: `status = sent`, provider message id,
    /// `sent_at`.
    async fn mark_job_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Record a failed send or missing dependency: `status = failed`,
    /// `last_error`.
    async fn mark_job_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Flip a contact's `scheduled` jobs to `cancelled`.
    /// Returns the number of jobs cancelled.
    async fn cancel_pending_jobs(&self, contact_id: Uuid) -> Result<usize, DatabaseError>;

    /// All jobs carrying this provider message id, capped at `limit`.
    /// Fan-out is deliberate: the id is not guaranteed unique per job.
    async fn jobs_by_provider_message_id(
        &self,
        provider_message_id: &str,
        limit: usize,
    ) -> Result<Vec<EmailJob>, DatabaseError>;

    // ── Delivery events ─────────────────────────────────────────────

    /// Apply one delivery event to one job and append the event-log row,
    /// atomically. Field updates are idempotent: timestamps are set only
    /// if unset, and a `failed`/`cancelled` status is never reverted.
    async fn apply_delivery_event(
        &self,
        job_id: Uuid,
        kind: DeliveryEventKind,
        record: &EventRecord,
    ) -> Result<(), DatabaseError>;

    /// Event-log rows for a job, oldest first.
    async fn events_for_job(&self, job_id: Uuid) -> Result<Vec<EmailEvent>, DatabaseError>;

    // ── Activity log ────────────────────────────────────────────────

    /// Append an activity entry.
    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError>;

    /// Most recent activity entries for a contact.
    async fn recent_activity(
        &self,
        contact_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, DatabaseError>;
}
