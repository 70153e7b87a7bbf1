//! Sequence enrollment planner — expands a sequence definition into
//! scheduled job rows for one contact.
//!
//! Enrollment is idempotent per `(contact, sequence)` pair and never fatal
//! to the caller: precondition violations are logged no-ops, so a
//! lead-capture request still succeeds when its auto-enrollment skips.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{EmailJob, ScheduleType};
use crate::store::Database;

/// Why an enrollment pass produced no jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ContactNotFound,
    MissingEmail,
    SequenceNotFound,
    SequenceInactive,
    NoValidSteps,
    AlreadyEnrolled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ContactNotFound => "contact not found",
            Self::MissingEmail => "contact has no email address",
            Self::SequenceNotFound => "sequence not found",
            Self::SequenceInactive => "sequence is not active",
            Self::NoValidSteps => "sequence has no steps with a template",
            Self::AlreadyEnrolled => "contact already has jobs for this sequence",
        };
        f.write_str(s)
    }
}

/// Result of one enrollment pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollOutcome {
    /// Jobs were created, in step order.
    Enrolled { job_ids: Vec<Uuid> },
    /// No-op (logged, not an error).
    Skipped(SkipReason),
}

/// Enroll a contact into a sequence, creating one `scheduled` job per
/// valid step.
///
/// Scheduling walks steps ascending by `step_number` (missing numbers
/// coerce to 0, stable sort), accumulating `max(wait_days, 0)` per kept
/// step; each job's `scheduled_at` is `now + cumulative days`. The first
/// computed timestamp becomes the contact's `next_follow_up_at`.
pub async fn enroll(
    db: &Arc<dyn Database>,
    contact_id: Uuid,
    sequence_id: Uuid,
    now: DateTime<Utc>,
) -> Result<EnrollOutcome, DatabaseError> {
    let Some(contact) = db.get_contact(contact_id).await? else {
        warn!(%contact_id, "Enrollment skipped: contact not found");
        return Ok(EnrollOutcome::Skipped(SkipReason::ContactNotFound));
    };
    if contact.email.trim().is_empty() {
        warn!(%contact_id, "Enrollment skipped: contact has no email");
        return Ok(EnrollOutcome::Skipped(SkipReason::MissingEmail));
    }

    let Some(sequence) = db.get_sequence(sequence_id).await? else {
        warn!(%sequence_id, "Enrollment skipped: sequence not found");
        return Ok(EnrollOutcome::Skipped(SkipReason::SequenceNotFound));
    };
    if !sequence.is_active {
        debug!(%sequence_id, "Enrollment skipped: sequence inactive");
        return Ok(EnrollOutcome::Skipped(SkipReason::SequenceInactive));
    }
    if !sequence
        .steps
        .iter()
        .any(|s| !s.template_id.trim().is_empty())
    {
        warn!(%sequence_id, "Enrollment skipped: no steps with a template");
        return Ok(EnrollOutcome::Skipped(SkipReason::NoValidSteps));
    }

    // Idempotency: one enrollment pass per (contact, sequence) pair.
    if db.has_sequence_jobs(contact_id, sequence_id).await? {
        debug!(%contact_id, %sequence_id, "Enrollment skipped: already enrolled");
        return Ok(EnrollOutcome::Skipped(SkipReason::AlreadyEnrolled));
    }

    let mut steps = sequence.steps.clone();
    steps.sort_by_key(|s| s.step_number.unwrap_or(0));

    let mut cumulative_days: i64 = 0;
    let mut job_ids = Vec::new();
    let mut first_at: Option<DateTime<Utc>> = None;

    for step in &steps {
        if step.template_id.trim().is_empty() {
            debug!(
                step_number = step.step_number,
                "Skipping step without a template"
            );
            continue;
        }
        cumulative_days += step.wait_days.unwrap_or(0).max(0);
        let scheduled_at = now + Duration::days(cumulative_days);

        let job = EmailJob::new(
            contact_id,
            &step.template_id,
            ScheduleType::Scheduled,
            scheduled_at,
        )
        .with_sequence(sequence_id, step.step_number.unwrap_or(0))
        .with_variables(step.variables.clone());

        db.insert_job(&job).await?;
        first_at.get_or_insert(scheduled_at);
        job_ids.push(job.id);
    }

    if let Some(at) = first_at {
        db.set_next_follow_up(contact_id, at).await?;
    }

    info!(
        %contact_id,
        %sequence_id,
        jobs = job_ids.len(),
        "Enrolled contact in sequence"
    );
    Ok(EnrollOutcome::Enrolled { job_ids })
}

/// Schedule a one-off immediate send outside any sequence.
///
/// Returns `None` (logged, not an error) when the contact is missing,
/// has no email, or the template id is empty.
pub async fn schedule_immediate(
    db: &Arc<dyn Database>,
    contact_id: Uuid,
    template_id: &str,
    variables: std::collections::HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<Option<Uuid>, DatabaseError> {
    if template_id.trim().is_empty() {
        warn!(%contact_id, "Immediate send skipped: empty template id");
        return Ok(None);
    }
    let Some(contact) = db.get_contact(contact_id).await? else {
        warn!(%contact_id, "Immediate send skipped: contact not found");
        return Ok(None);
    };
    if contact.email.trim().is_empty() {
        warn!(%contact_id, "Immediate send skipped: contact has no email");
        return Ok(None);
    }

    let job = EmailJob::new(contact_id, template_id, ScheduleType::Immediate, now)
        .with_variables(variables);
    db.insert_job(&job).await?;
    debug!(%contact_id, job_id = %job.id, "Scheduled immediate send");
    Ok(Some(job.id))
}
