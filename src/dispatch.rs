//! Job dispatcher — periodic loop that claims due jobs and sends them.
//!
//! Multiple overlapping invocations are tolerated: correctness rests
//! entirely on the per-job claim compare-and-set in the store, not on
//! single-writer execution. One job's failure never aborts the batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::model::{ActivityEntry, EmailJob};
use crate::render::render;
use crate::sender::{EmailSender, OutboundEmail};
use crate::store::Database;

/// Per-tick dispatch summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Jobs claimed and driven to a terminal outcome this tick.
    pub processed: usize,
    /// Subset of `processed` that ended `failed`.
    pub errors: usize,
}

/// Claims and sends due email jobs.
pub struct Dispatcher {
    db: Arc<dyn Database>,
    sender: Arc<dyn EmailSender>,
    batch_size: usize,
}

impl Dispatcher {
    pub fn new(db: Arc<dyn Database>, sender: Arc<dyn EmailSender>, batch_size: usize) -> Self {
        Self {
            db,
            sender,
            batch_size,
        }
    }

    /// One dispatch pass over jobs due now.
    pub async fn dispatch(&self) -> DispatchOutcome {
        self.dispatch_at(Utc::now()).await
    }

    /// One dispatch pass over jobs due at `now`.
    pub async fn dispatch_at(&self, now: DateTime<Utc>) -> DispatchOutcome {
        let due = match self.db.due_jobs(now, self.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to query due jobs");
                return DispatchOutcome::default();
            }
        };

        if due.is_empty() {
            debug!("No due jobs");
            return DispatchOutcome::default();
        }

        let mut outcome = DispatchOutcome::default();
        for job in due {
            match self.process_job(&job, now).await {
                Ok(()) => outcome.processed += 1,
                Err(DispatchError::AlreadyClaimed { id }) => {
                    debug!(job_id = %id, "Job no longer scheduled, skipping");
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Job dispatch failed");
                    outcome.processed += 1;
                    outcome.errors += 1;
                }
            }
        }

        info!(
            processed = outcome.processed,
            errors = outcome.errors,
            "Dispatch pass complete"
        );
        outcome
    }

    /// Claim, render, and send a single job.
    async fn process_job(&self, job: &EmailJob, now: DateTime<Utc>) -> Result<(), DispatchError> {
        if !self.db.claim_job(job.id).await? {
            return Err(DispatchError::AlreadyClaimed { id: job.id });
        }

        let contact = match self.db.get_contact(job.contact_id).await? {
            Some(contact) => contact,
            None => {
                self.db
                    .mark_job_failed(job.id, "contact not found")
                    .await?;
                return Err(DispatchError::ContactNotFound {
                    job_id: job.id,
                    contact_id: job.contact_id,
                });
            }
        };

        let template = match self.db.get_template(&job.template_id).await? {
            Some(template) => template,
            None => {
                self.db
                    .mark_job_failed(job.id, "template not found")
                    .await?;
                return Err(DispatchError::TemplateNotFound {
                    job_id: job.id,
                    template_id: job.template_id.clone(),
                });
            }
        };

        let subject = render(&template.subject, &contact, &job.variables);
        let html = render(&template.body_html, &contact, &job.variables);
        let text = render(&template.body_text, &contact, &job.variables);

        let mut tags = vec![("email_job_id".to_string(), job.id.to_string())];
        if let Some(sequence_id) = job.sequence_id {
            tags.push(("sequence_id".to_string(), sequence_id.to_string()));
        }

        let outbound = OutboundEmail {
            to: contact.email.clone(),
            subject: subject.clone(),
            html,
            text,
            tags,
        };

        match self.sender.send(&outbound).await {
            Ok(sent) => {
                self.db
                    .mark_job_sent(job.id, &sent.provider_message_id, now)
                    .await?;
                info!(
                    job_id = %job.id,
                    contact_id = %contact.id,
                    provider_message_id = %sent.provider_message_id,
                    "Email sent"
                );

                // Post-processing never rolls back the persisted outcome.
                if let Err(e) = self
                    .db
                    .append_activity(&ActivityEntry::email_sent(contact.id, &subject))
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "Failed to append activity entry");
                }
                if let Err(e) = self.db.set_last_contacted(contact.id, now).await {
                    warn!(contact_id = %contact.id, error = %e, "Failed to update last_contacted_at");
                }
                Ok(())
            }
            Err(e) => {
                self.db.mark_job_failed(job.id, &e.to_string()).await?;
                Err(DispatchError::Send(e))
            }
        }
    }
}

/// Spawn the recurring dispatch loop. First tick fires immediately.
pub fn spawn_dispatch_loop(dispatcher: Arc<Dispatcher>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_secs = period.as_secs(), "Dispatch loop started");

        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            dispatcher.dispatch().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    use crate::error::SendError;
    use crate::model::{Contact, EmailTemplate, JobStatus, ScheduleType};
    use crate::sender::SentEmail;
    use crate::store::LibSqlBackend;

    use super::*;

    /// Records sends; optionally fails every attempt.
    struct MockSender {
        sends: AtomicUsize,
        sent_to: Mutex<Vec<String>>,
        fail_with: Option<String>,
    }

    impl MockSender {
        fn new() -> Self {
            Self {
                sends: AtomicUsize::new(0),
                sent_to: Mutex::new(Vec::new()),
                fail_with: None,
            }
        }

        fn failing(reason: &str) -> Self {
            Self {
                fail_with: Some(reason.to_string()),
                ..Self::new()
            }
        }

        fn count(&self) -> usize {
            self.sends.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmailSender for MockSender {
        async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, SendError> {
            if let Some(reason) = &self.fail_with {
                return Err(SendError::Transport(reason.clone()));
            }
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            self.sent_to.lock().unwrap().push(email.to.clone());
            Ok(SentEmail {
                provider_message_id: format!("msg_{n}"),
            })
        }
    }

    async fn db() -> Arc<dyn Database> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    async fn seed(db: &Arc<dyn Database>) -> (Uuid, String) {
        let contact = Contact::new("ada@example.com").with_name("Ada");
        db.insert_contact(&contact).await.unwrap();
        let template = EmailTemplate::new(
            "tpl-1",
            "Welcome",
            "Hi {{contact.name}}",
            "<p>Hi {{contact.name}}, {{promo}}</p>",
            "Hi {{contact.name}}, {{promo}}",
        );
        db.insert_template(&template).await.unwrap();
        (contact.id, template.id)
    }

    fn due_job(contact_id: Uuid, template_id: &str) -> EmailJob {
        EmailJob::new(
            contact_id,
            template_id,
            ScheduleType::Scheduled,
            Utc::now() - ChronoDuration::minutes(1),
        )
    }

    #[tokio::test]
    async fn successful_dispatch_records_outcome() {
        let db = db().await;
        let (contact_id, template_id) = seed(&db).await;
        let job = due_job(contact_id, &template_id);
        db.insert_job(&job).await.unwrap();

        let sender = Arc::new(MockSender::new());
        let dispatcher = Dispatcher::new(db.clone(), sender.clone(), 10);

        let outcome = dispatcher.dispatch().await;
        assert_eq!(outcome, DispatchOutcome { processed: 1, errors: 0 });
        assert_eq!(sender.count(), 1);
        assert_eq!(sender.sent_to.lock().unwrap()[0], "ada@example.com");

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Sent);
        assert_eq!(loaded.provider_message_id.as_deref(), Some("msg_0"));
        assert!(loaded.sent_at.is_some());

        let contact = db.get_contact(contact_id).await.unwrap().unwrap();
        assert!(contact.last_contacted_at.is_some());
        let activity = db.recent_activity(contact_id, 10).await.unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].detail, "Sent email: Hi Ada");
    }

    #[tokio::test]
    async fn send_failure_marks_job_failed() {
        let db = db().await;
        let (contact_id, template_id) = seed(&db).await;
        let job = due_job(contact_id, &template_id);
        db.insert_job(&job).await.unwrap();

        let sender = Arc::new(MockSender::failing("connection refused"));
        let dispatcher = Dispatcher::new(db.clone(), sender, 10);

        let outcome = dispatcher.dispatch().await;
        assert_eq!(outcome, DispatchOutcome { processed: 1, errors: 1 });

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert!(loaded.last_error.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn bad_job_does_not_abort_the_batch() {
        let db = db().await;
        let (contact_id, template_id) = seed(&db).await;

        let broken = due_job(contact_id, "no-such-template");
        let orphan = due_job(Uuid::new_v4(), &template_id);
        let good = due_job(contact_id, &template_id);
        for job in [&broken, &orphan, &good] {
            db.insert_job(job).await.unwrap();
        }

        let sender = Arc::new(MockSender::new());
        let dispatcher = Dispatcher::new(db.clone(), sender.clone(), 10);

        let outcome = dispatcher.dispatch().await;
        assert_eq!(outcome, DispatchOutcome { processed: 3, errors: 2 });
        assert_eq!(sender.count(), 1);

        let broken = db.get_job(broken.id).await.unwrap().unwrap();
        assert_eq!(broken.status, JobStatus::Failed);
        assert_eq!(broken.last_error.as_deref(), Some("template not found"));

        let orphan = db.get_job(orphan.id).await.unwrap().unwrap();
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.last_error.as_deref(), Some("contact not found"));

        let good = db.get_job(good.id).await.unwrap().unwrap();
        assert_eq!(good.status, JobStatus::Sent);
    }

    #[tokio::test]
    async fn concurrent_passes_send_each_job_exactly_once() {
        let db = db().await;
        let (contact_id, template_id) = seed(&db).await;
        for _ in 0..5 {
            db.insert_job(&due_job(contact_id, &template_id))
                .await
                .unwrap();
        }

        let sender = Arc::new(MockSender::new());
        let a = Arc::new(Dispatcher::new(db.clone(), sender.clone(), 10));
        let b = Arc::new(Dispatcher::new(db.clone(), sender.clone(), 10));

        // Two overlapping passes race to claim the same due jobs; the
        // claim CAS must let exactly one side send each job.
        let (ra, rb) = tokio::join!(
            { let a = a.clone(); async move { a.dispatch().await } },
            { let b = b.clone(); async move { b.dispatch().await } },
        );

        assert_eq!(sender.count(), 5);
        assert_eq!(ra.processed + rb.processed, 5);
        assert_eq!(ra.errors + rb.errors, 0);

        let due = db.due_jobs(Utc::now(), 100).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn cancelled_jobs_are_never_sent() {
        let db = db().await;
        let (contact_id, template_id) = seed(&db).await;
        db.insert_job(&due_job(contact_id, &template_id))
            .await
            .unwrap();
        assert_eq!(db.cancel_pending_jobs(contact_id).await.unwrap(), 1);

        let sender = Arc::new(MockSender::new());
        let dispatcher = Dispatcher::new(db.clone(), sender.clone(), 10);

        let outcome = dispatcher.dispatch().await;
        assert_eq!(outcome, DispatchOutcome::default());
        assert_eq!(sender.count(), 0);
    }

    #[tokio::test]
    async fn batch_size_caps_a_pass() {
        let db = db().await;
        let (contact_id, template_id) = seed(&db).await;
        for _ in 0..4 {
            db.insert_job(&due_job(contact_id, &template_id))
                .await
                .unwrap();
        }

        let sender = Arc::new(MockSender::new());
        let dispatcher = Dispatcher::new(db.clone(), sender.clone(), 3);

        let outcome = dispatcher.dispatch().await;
        assert_eq!(outcome.processed, 3);
        assert_eq!(sender.count(), 3);

        let outcome = dispatcher.dispatch().await;
        assert_eq!(outcome.processed, 1);
        assert_eq!(sender.count(), 4);
    }
}
