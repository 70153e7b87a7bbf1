//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. The dispatcher's claim step
//! is a single conditional UPDATE checking rows-affected: the optimistic
//! compare-and-set that gives at-most-once send semantics across
//! overlapping dispatcher passes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    ActivityEntry, Contact, DeliveryEventKind, EmailEvent, EmailJob, EmailSequence, EmailTemplate,
    EventRecord, JobStatus, ScheduleType,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use,
/// but sqlite permits one open transaction per connection, and any write
/// issued while a transaction is open on the same connection joins that
/// transaction. Every writing method therefore holds `write_lock` for the
/// duration of its statement (or, in `apply_delivery_event`, the whole
/// transaction). Reads stay unguarded.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical datetime write format: fixed-width RFC 3339 in UTC, so that
/// TEXT comparison in SQL orders chronologically.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Scheduled => "scheduled",
        JobStatus::Sending => "sending",
        JobStatus::Sent => "sent",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn str_to_status(s: &str) -> JobStatus {
    match s {
        "sending" => JobStatus::Sending,
        "sent" => JobStatus::Sent,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Scheduled,
    }
}

fn schedule_type_to_str(st: ScheduleType) -> &'static str {
    match st {
        ScheduleType::Scheduled => "scheduled",
        ScheduleType::Immediate => "immediate",
    }
}

fn str_to_schedule_type(s: &str) -> ScheduleType {
    match s {
        "immediate" => ScheduleType::Immediate,
        _ => ScheduleType::Scheduled,
    }
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<DateTime<Utc>>` to a libsql Value.
fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(fmt_datetime(dt)),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

// ── Row mappers ─────────────────────────────────────────────────────

const CONTACT_COLUMNS: &str = "id, email, name, first_name, last_name, company, phone, \
     last_contacted_at, next_follow_up_at, created_at, updated_at";

fn row_to_contact(row: &libsql::Row) -> Result<Contact, libsql::Error> {
    let id_str: String = row.get(0)?;
    let last_contacted: Option<String> = row.get(7).ok();
    let next_follow_up: Option<String> = row.get(8).ok();
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok(Contact {
        id: parse_uuid(&id_str),
        email: row.get(1)?,
        name: row.get(2).ok(),
        first_name: row.get(3).ok(),
        last_name: row.get(4).ok(),
        company: row.get(5).ok(),
        phone: row.get(6).ok(),
        last_contacted_at: parse_optional_datetime(&last_contacted),
        next_follow_up_at: parse_optional_datetime(&next_follow_up),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const TEMPLATE_COLUMNS: &str =
    "id, name, subject, body_html, body_text, variables, created_at, updated_at";

fn row_to_template(row: &libsql::Row) -> Result<EmailTemplate, libsql::Error> {
    let variables_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;
    let updated_str: String = row.get(7)?;

    Ok(EmailTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        subject: row.get(2)?,
        body_html: row.get(3)?,
        body_text: row.get(4)?,
        variables: serde_json::from_str(&variables_str).unwrap_or_default(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const SEQUENCE_COLUMNS: &str = "id, name, is_active, steps, created_at, updated_at";

fn row_to_sequence(row: &libsql::Row) -> Result<EmailSequence, libsql::Error> {
    let id_str: String = row.get(0)?;
    let is_active: i64 = row.get(2)?;
    let steps_str: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let updated_str: String = row.get(5)?;

    Ok(EmailSequence {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        is_active: is_active != 0,
        steps: serde_json::from_str(&steps_str).unwrap_or_default(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const JOB_COLUMNS: &str = "id, contact_id, sequence_id, step_number, template_id, schedule_type, \
     scheduled_at, status, variables, provider_message_id, sent_at, opened_at, clicked_at, \
     bounced_at, last_error, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<EmailJob, libsql::Error> {
    let id_str: String = row.get(0)?;
    let contact_str: String = row.get(1)?;
    let sequence_str: Option<String> = row.get(2).ok();
    let schedule_type_str: String = row.get(5)?;
    let scheduled_str: String = row.get(6)?;
    let status_str: String = row.get(7)?;
    let variables_str: String = row.get(8)?;
    let sent_str: Option<String> = row.get(10).ok();
    let opened_str: Option<String> = row.get(11).ok();
    let clicked_str: Option<String> = row.get(12).ok();
    let bounced_str: Option<String> = row.get(13).ok();
    let created_str: String = row.get(15)?;
    let updated_str: String = row.get(16)?;

    let variables: HashMap<String, String> =
        serde_json::from_str(&variables_str).unwrap_or_default();

    Ok(EmailJob {
        id: parse_uuid(&id_str),
        contact_id: parse_uuid(&contact_str),
        sequence_id: sequence_str.as_deref().map(parse_uuid),
        step_number: row.get(3).ok(),
        template_id: row.get(4)?,
        schedule_type: str_to_schedule_type(&schedule_type_str),
        scheduled_at: parse_datetime(&scheduled_str),
        status: str_to_status(&status_str),
        variables,
        provider_message_id: row.get(9).ok(),
        sent_at: parse_optional_datetime(&sent_str),
        opened_at: parse_optional_datetime(&opened_str),
        clicked_at: parse_optional_datetime(&clicked_str),
        bounced_at: parse_optional_datetime(&bounced_str),
        last_error: row.get(14).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const EVENT_COLUMNS: &str =
    "id, email_job_id, event_type, provider_event_id, occurred_at, raw_payload, created_at";

fn row_to_event(row: &libsql::Row) -> Result<EmailEvent, libsql::Error> {
    let id_str: String = row.get(0)?;
    let job_str: String = row.get(1)?;
    let occurred_str: String = row.get(4)?;
    let raw_str: String = row.get(5)?;
    let created_str: String = row.get(6)?;

    Ok(EmailEvent {
        id: parse_uuid(&id_str),
        email_job_id: parse_uuid(&job_str),
        event_type: row.get(2)?,
        provider_event_id: row.get(3).ok(),
        occurred_at: parse_datetime(&occurred_str),
        raw_payload: serde_json::from_str(&raw_str).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created_str),
    })
}

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn insert_contact(&self, contact: &Contact) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO contacts (id, email, name, first_name, last_name, company, phone, \
                 last_contacted_at, next_follow_up_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    contact.id.to_string(),
                    contact.email.clone(),
                    opt_text(contact.name.as_deref()),
                    opt_text(contact.first_name.as_deref()),
                    opt_text(contact.last_name.as_deref()),
                    opt_text(contact.company.as_deref()),
                    opt_text(contact.phone.as_deref()),
                    opt_datetime(contact.last_contacted_at),
                    opt_datetime(contact.next_follow_up_at),
                    fmt_datetime(contact.created_at),
                    fmt_datetime(contact.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_contact(&self, id: Uuid) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_contact(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn set_next_follow_up(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE contacts SET next_follow_up_at = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    fmt_datetime(at),
                    fmt_datetime(Utc::now())
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn set_last_contacted(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE contacts SET last_contacted_at = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    fmt_datetime(at),
                    fmt_datetime(Utc::now())
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Templates ───────────────────────────────────────────────────

    async fn insert_template(&self, template: &EmailTemplate) -> Result<(), DatabaseError> {
        let variables_json = serde_json::to_string(&template.variables)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO email_templates (id, name, subject, body_html, body_text, variables, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    template.id.clone(),
                    template.name.clone(),
                    template.subject.clone(),
                    template.body_html.clone(),
                    template.body_text.clone(),
                    variables_json,
                    fmt_datetime(template.created_at),
                    fmt_datetime(template.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_template(&self, id: &str) -> Result<Option<EmailTemplate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_template(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    // ── Sequences ───────────────────────────────────────────────────

    async fn insert_sequence(&self, sequence: &EmailSequence) -> Result<(), DatabaseError> {
        let steps_json = serde_json::to_string(&sequence.steps)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO email_sequences (id, name, is_active, steps, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sequence.id.to_string(),
                    sequence.name.clone(),
                    sequence.is_active as i64,
                    steps_json,
                    fmt_datetime(sequence.created_at),
                    fmt_datetime(sequence.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_sequence(&self, id: Uuid) -> Result<Option<EmailSequence>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SEQUENCE_COLUMNS} FROM email_sequences WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_sequence(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &EmailJob) -> Result<(), DatabaseError> {
        let variables_json = serde_json::to_string(&job.variables)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let step_number = match job.step_number {
            Some(n) => libsql::Value::Integer(n),
            None => libsql::Value::Null,
        };
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO email_jobs ({JOB_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    job.id.to_string(),
                    job.contact_id.to_string(),
                    opt_text(job.sequence_id.map(|u| u.to_string()).as_deref()),
                    step_number,
                    job.template_id.clone(),
                    schedule_type_to_str(job.schedule_type),
                    fmt_datetime(job.scheduled_at),
                    status_to_str(job.status),
                    variables_json,
                    opt_text(job.provider_message_id.as_deref()),
                    opt_datetime(job.sent_at),
                    opt_datetime(job.opened_at),
                    opt_datetime(job.clicked_at),
                    opt_datetime(job.bounced_at),
                    opt_text(job.last_error.as_deref()),
                    fmt_datetime(job.created_at),
                    fmt_datetime(job.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<EmailJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM email_jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_job(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn has_sequence_jobs(
        &self,
        contact_id: Uuid,
        sequence_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM email_jobs WHERE contact_id = ?1 AND sequence_id = ?2",
                params![contact_id.to_string(), sequence_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let row = rows.next().await.map_err(query_err)?;
        match row {
            Some(row) => {
                let count: i64 = row.get(0).map_err(query_err)?;
                Ok(count > 0)
            }
            None => Ok(false),
        }
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EmailJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM email_jobs \
                     WHERE status = 'scheduled' AND scheduled_at <= ?1 \
                     ORDER BY scheduled_at ASC LIMIT ?2"
                ),
                params![fmt_datetime(now), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row).map_err(query_err)?);
        }
        Ok(jobs)
    }

    async fn claim_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        // The compare-and-set: only a job still in `scheduled` transitions
        // to `sending`. Zero rows affected means the race was lost.
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE email_jobs SET status = 'sending', updated_at = ?2 \
                 WHERE id = ?1 AND status = 'scheduled'",
                params![id.to_string(), fmt_datetime(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn mark_job_sent(
        &self,
        id: Uuid,
        provider_message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE email_jobs SET status = 'sent', provider_message_id = ?2, \
                 sent_at = ?3, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), provider_message_id, fmt_datetime(at)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn mark_job_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE email_jobs SET status = 'failed', last_error = ?2, updated_at = ?3 \
                 WHERE id = ?1",
                params![id.to_string(), error, fmt_datetime(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn cancel_pending_jobs(&self, contact_id: Uuid) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn()
            .execute(
                "UPDATE email_jobs SET status = 'cancelled', updated_at = ?2 \
                 WHERE contact_id = ?1 AND status = 'scheduled'",
                params![contact_id.to_string(), fmt_datetime(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        Ok(affected as usize)
    }

    async fn jobs_by_provider_message_id(
        &self,
        provider_message_id: &str,
        limit: usize,
    ) -> Result<Vec<EmailJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM email_jobs \
                     WHERE provider_message_id = ?1 LIMIT ?2"
                ),
                params![provider_message_id, limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row).map_err(query_err)?);
        }
        Ok(jobs)
    }

    // ── Delivery events ─────────────────────────────────────────────

    async fn apply_delivery_event(
        &self,
        job_id: Uuid,
        kind: DeliveryEventKind,
        record: &EventRecord,
    ) -> Result<(), DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let occurred = fmt_datetime(record.occurred_at);
        let id = job_id.to_string();

        // Held until commit: a second BEGIN on this connection would fail,
        // and an interleaved write would join this transaction.
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to begin transaction: {e}")))?;

        // Timestamps are COALESCEd (set only if unset); a terminal
        // failed/cancelled status is never reverted.
        match kind {
            DeliveryEventKind::Sent | DeliveryEventKind::Delivered => {
                tx.execute(
                    "UPDATE email_jobs SET \
                        status = CASE WHEN status IN ('failed', 'cancelled') \
                                 THEN status ELSE 'sent' END, \
                        sent_at = COALESCE(sent_at, ?2), \
                        updated_at = ?3 \
                     WHERE id = ?1",
                    params![id.clone(), occurred.clone(), now.clone()],
                )
                .await
                .map_err(query_err)?;
            }
            DeliveryEventKind::Opened => {
                tx.execute(
                    "UPDATE email_jobs SET \
                        opened_at = COALESCE(opened_at, ?2), updated_at = ?3 \
                     WHERE id = ?1",
                    params![id.clone(), occurred.clone(), now.clone()],
                )
                .await
                .map_err(query_err)?;
            }
            DeliveryEventKind::Clicked => {
                tx.execute(
                    "UPDATE email_jobs SET \
                        clicked_at = COALESCE(clicked_at, ?2), updated_at = ?3 \
                     WHERE id = ?1",
                    params![id.clone(), occurred.clone(), now.clone()],
                )
                .await
                .map_err(query_err)?;
            }
            DeliveryEventKind::Bounced => {
                tx.execute(
                    "UPDATE email_jobs SET \
                        status = CASE WHEN status = 'cancelled' THEN status ELSE 'failed' END, \
                        bounced_at = COALESCE(bounced_at, ?2), \
                        last_error = COALESCE(?4, last_error), \
                        updated_at = ?3 \
                     WHERE id = ?1",
                    params![
                        id.clone(),
                        occurred.clone(),
                        now.clone(),
                        opt_text(record.message.as_deref())
                    ],
                )
                .await
                .map_err(query_err)?;
            }
            DeliveryEventKind::Complained => {
                tx.execute(
                    "UPDATE email_jobs SET \
                        status = CASE WHEN status = 'cancelled' THEN status ELSE 'failed' END, \
                        last_error = COALESCE(last_error, ?4), \
                        updated_at = ?3 \
                     WHERE id = ?1",
                    params![
                        id.clone(),
                        occurred.clone(),
                        now.clone(),
                        record
                            .message
                            .clone()
                            .unwrap_or_else(|| "Recipient marked the message as spam".to_string())
                    ],
                )
                .await
                .map_err(query_err)?;
            }
            DeliveryEventKind::Failed => {
                tx.execute(
                    "UPDATE email_jobs SET \
                        status = CASE WHEN status = 'cancelled' THEN status ELSE 'failed' END, \
                        last_error = COALESCE(?4, last_error), \
                        updated_at = ?3 \
                     WHERE id = ?1",
                    params![
                        id.clone(),
                        occurred.clone(),
                        now.clone(),
                        opt_text(record.message.as_deref())
                    ],
                )
                .await
                .map_err(query_err)?;
            }
            DeliveryEventKind::Unknown => {}
        }

        let raw = serde_json::to_string(&record.raw_payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        tx.execute(
            "INSERT INTO email_events (id, email_job_id, event_type, provider_event_id, \
             occurred_at, raw_payload, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                id,
                kind.as_str(),
                opt_text(record.provider_event_id.as_deref()),
                occurred,
                raw,
                now,
            ],
        )
        .await
        .map_err(query_err)?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to commit transaction: {e}")))?;
        Ok(())
    }

    async fn events_for_job(&self, job_id: Uuid) -> Result<Vec<EmailEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM email_events \
                     WHERE email_job_id = ?1 ORDER BY created_at ASC, id ASC"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            events.push(row_to_event(&row).map_err(query_err)?);
        }
        Ok(events)
    }

    // ── Activity log ────────────────────────────────────────────────

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO activity_log (id, contact_id, kind, detail, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.id.to_string(),
                    entry.contact_id.to_string(),
                    entry.kind.clone(),
                    entry.detail.clone(),
                    fmt_datetime(entry.created_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn recent_activity(
        &self,
        contact_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, contact_id, kind, detail, created_at FROM activity_log \
                 WHERE contact_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                params![contact_id.to_string(), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id_str: String = row.get(0).map_err(query_err)?;
            let contact_str: String = row.get(1).map_err(query_err)?;
            let created_str: String = row.get(4).map_err(query_err)?;
            entries.push(ActivityEntry {
                id: parse_uuid(&id_str),
                contact_id: parse_uuid(&contact_str),
                kind: row.get(2).map_err(query_err)?,
                detail: row.get(3).map_err(query_err)?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn scheduled_job(contact_id: Uuid, at: DateTime<Utc>) -> EmailJob {
        EmailJob::new(contact_id, "tpl-1", ScheduleType::Scheduled, at)
    }

    fn event_record(message: Option<&str>) -> EventRecord {
        EventRecord {
            provider_event_id: Some("evt_1".to_string()),
            occurred_at: Utc::now(),
            message: message.map(|s| s.to_string()),
            raw_payload: serde_json::json!({"type": "test"}),
        }
    }

    #[tokio::test]
    async fn job_roundtrip() {
        let db = backend().await;
        let contact_id = Uuid::new_v4();
        let sequence_id = Uuid::new_v4();
        let job = scheduled_job(contact_id, Utc::now())
            .with_sequence(sequence_id, 2)
            .with_variables(HashMap::from([("promo".to_string(), "10%".to_string())]));
        db.insert_job(&job).await.unwrap();

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.contact_id, contact_id);
        assert_eq!(loaded.sequence_id, Some(sequence_id));
        assert_eq!(loaded.step_number, Some(2));
        assert_eq!(loaded.status, JobStatus::Scheduled);
        assert_eq!(loaded.variables.get("promo").map(String::as_str), Some("10%"));
        assert!(loaded.provider_message_id.is_none());
    }

    #[tokio::test]
    async fn claim_is_a_compare_and_set() {
        let db = backend().await;
        let job = scheduled_job(Uuid::new_v4(), Utc::now());
        db.insert_job(&job).await.unwrap();

        assert!(db.claim_job(job.id).await.unwrap());
        // Second claim observes `sending` and performs no write.
        assert!(!db.claim_job(job.id).await.unwrap());

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Sending);
    }

    #[tokio::test]
    async fn claim_skips_cancelled_jobs() {
        let db = backend().await;
        let contact_id = Uuid::new_v4();
        let job = scheduled_job(contact_id, Utc::now());
        db.insert_job(&job).await.unwrap();

        assert_eq!(db.cancel_pending_jobs(contact_id).await.unwrap(), 1);
        assert!(!db.claim_job(job.id).await.unwrap());
        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn due_jobs_orders_by_scheduled_at_and_caps() {
        let db = backend().await;
        let now = Utc::now();
        let contact_id = Uuid::new_v4();

        let late = scheduled_job(contact_id, now - Duration::minutes(1));
        let early = scheduled_job(contact_id, now - Duration::hours(2));
        let future = scheduled_job(contact_id, now + Duration::hours(1));
        db.insert_job(&late).await.unwrap();
        db.insert_job(&early).await.unwrap();
        db.insert_job(&future).await.unwrap();

        let due = db.due_jobs(now, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, early.id);
        assert_eq!(due[1].id, late.id);

        let capped = db.due_jobs(now, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, early.id);
    }

    #[tokio::test]
    async fn opened_event_is_idempotent_but_log_is_append_only() {
        let db = backend().await;
        let job = scheduled_job(Uuid::new_v4(), Utc::now());
        db.insert_job(&job).await.unwrap();

        let first = EventRecord {
            occurred_at: Utc::now() - Duration::minutes(5),
            ..event_record(None)
        };
        db.apply_delivery_event(job.id, DeliveryEventKind::Opened, &first)
            .await
            .unwrap();
        let opened_at = db.get_job(job.id).await.unwrap().unwrap().opened_at.unwrap();

        // Redelivery: state unchanged, second log row appended.
        let second = EventRecord {
            occurred_at: Utc::now(),
            ..event_record(None)
        };
        db.apply_delivery_event(job.id, DeliveryEventKind::Opened, &second)
            .await
            .unwrap();

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.opened_at, Some(opened_at));
        assert_eq!(db.events_for_job(job.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bounce_then_open_keeps_failed_status() {
        let db = backend().await;
        let job = scheduled_job(Uuid::new_v4(), Utc::now());
        db.insert_job(&job).await.unwrap();
        db.mark_job_sent(job.id, "msg_1", Utc::now()).await.unwrap();

        db.apply_delivery_event(
            job.id,
            DeliveryEventKind::Bounced,
            &event_record(Some("mailbox full")),
        )
        .await
        .unwrap();

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.last_error.as_deref(), Some("mailbox full"));
        assert!(loaded.bounced_at.is_some());

        db.apply_delivery_event(job.id, DeliveryEventKind::Opened, &event_record(None))
            .await
            .unwrap();
        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.opened_at.is_some());

        // A late `delivered` must not revert the terminal status either.
        db.apply_delivery_event(job.id, DeliveryEventKind::Delivered, &event_record(None))
            .await
            .unwrap();
        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn complaint_keeps_existing_error_message() {
        let db = backend().await;
        let job = scheduled_job(Uuid::new_v4(), Utc::now());
        db.insert_job(&job).await.unwrap();
        db.mark_job_failed(job.id, "smtp timeout").await.unwrap();

        db.apply_delivery_event(job.id, DeliveryEventKind::Complained, &event_record(None))
            .await
            .unwrap();
        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.last_error.as_deref(), Some("smtp timeout"));

        let fresh = scheduled_job(Uuid::new_v4(), Utc::now());
        db.insert_job(&fresh).await.unwrap();
        db.apply_delivery_event(fresh.id, DeliveryEventKind::Complained, &event_record(None))
            .await
            .unwrap();
        let loaded = db.get_job(fresh.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.last_error.as_deref(),
            Some("Recipient marked the message as spam")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_event_applications_all_commit() {
        let db = Arc::new(backend().await);

        let mut job_ids = Vec::new();
        for _ in 0..8 {
            let job = scheduled_job(Uuid::new_v4(), Utc::now());
            db.insert_job(&job).await.unwrap();
            job_ids.push(job.id);
        }

        // Overlapping transactions on the shared connection, interleaved
        // with plain writes racing against open transactions.
        let mut handles = Vec::new();
        for (i, job_id) in job_ids.iter().copied().enumerate() {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                for n in 0..25 {
                    db.apply_delivery_event(job_id, DeliveryEventKind::Opened, &event_record(None))
                        .await
                        .unwrap();
                    if n % 5 == 0 {
                        db.mark_job_sent(job_id, &format!("msg_{i}"), Utc::now())
                            .await
                            .unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for job_id in job_ids {
            assert_eq!(db.events_for_job(job_id).await.unwrap().len(), 25);
            let loaded = db.get_job(job_id).await.unwrap().unwrap();
            assert_eq!(loaded.status, JobStatus::Sent);
            assert!(loaded.opened_at.is_some());
        }
    }

    #[tokio::test]
    async fn provider_message_id_lookup_fans_out() {
        let db = backend().await;
        let a = scheduled_job(Uuid::new_v4(), Utc::now());
        let b = scheduled_job(Uuid::new_v4(), Utc::now());
        let c = scheduled_job(Uuid::new_v4(), Utc::now());
        for job in [&a, &b, &c] {
            db.insert_job(job).await.unwrap();
        }
        db.mark_job_sent(a.id, "msg_shared", Utc::now()).await.unwrap();
        db.mark_job_sent(b.id, "msg_shared", Utc::now()).await.unwrap();
        db.mark_job_sent(c.id, "msg_other", Utc::now()).await.unwrap();

        let matched = db.jobs_by_provider_message_id("msg_shared", 20).await.unwrap();
        assert_eq!(matched.len(), 2);

        let none = db.jobs_by_provider_message_id("msg_unknown", 20).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn contact_timestamps_update() {
        let db = backend().await;
        let contact = Contact::new("ada@example.com").with_name("Ada");
        db.insert_contact(&contact).await.unwrap();

        let follow_up = Utc::now() + Duration::days(3);
        db.set_next_follow_up(contact.id, follow_up).await.unwrap();
        let contacted = Utc::now();
        db.set_last_contacted(contact.id, contacted).await.unwrap();

        let loaded = db.get_contact(contact.id).await.unwrap().unwrap();
        assert!(loaded.next_follow_up_at.is_some());
        assert!(loaded.last_contacted_at.is_some());
    }

    #[tokio::test]
    async fn sequence_steps_roundtrip_via_json() {
        let db = backend().await;
        let steps = vec![
            crate::model::SequenceStep::new(1, "tpl-a", 0),
            crate::model::SequenceStep::new(2, "tpl-b", 3),
        ];
        let sequence = EmailSequence::new("Onboarding", steps);
        db.insert_sequence(&sequence).await.unwrap();

        let loaded = db.get_sequence(sequence.id).await.unwrap().unwrap();
        assert!(loaded.is_active);
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[1].template_id, "tpl-b");
        assert_eq!(loaded.steps[1].wait_days, Some(3));
    }

    #[tokio::test]
    async fn local_database_persists_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outreach.db");

        let job = scheduled_job(Uuid::new_v4(), Utc::now());
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_job(&job).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.template_id, "tpl-1");
    }

    #[tokio::test]
    async fn activity_log_appends() {
        let db = backend().await;
        let contact_id = Uuid::new_v4();
        db.append_activity(&ActivityEntry::email_sent(contact_id, "Welcome"))
            .await
            .unwrap();
        db.append_activity(&ActivityEntry::email_sent(contact_id, "Follow-up"))
            .await
            .unwrap();

        let entries = db.recent_activity(contact_id, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "email_sent");
    }
}
