//! Outbound email senders — the collaborator invoked by the dispatcher.
//!
//! Two implementations: an HTTP send-provider API (returns the provider's
//! message id, which delivery webhooks later correlate on) and an SMTP
//! relay via lettre (the message id is synthesized locally and stamped
//! into the Message-ID header).

use async_trait::async_trait;
use lettre::message::MultiPart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::SendError;

/// One rendered outbound email.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    /// Provider-side tags (job id, sequence id) for event correlation.
    pub tags: Vec<(String, String)>,
}

/// Outcome of a successful send.
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub provider_message_id: String,
}

/// The outbound send seam. May fail; the dispatcher records failures on
/// the job and moves on.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, SendError>;
}

// ── HTTP provider API ───────────────────────────────────────────────

/// Send-provider HTTP client (Resend-compatible `POST /emails`).
pub struct HttpApiSender {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    from_address: String,
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

impl HttpApiSender {
    pub fn new(base_url: String, api_key: SecretString, from_address: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            from_address,
        }
    }
}

#[async_trait]
impl EmailSender for HttpApiSender {
    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, SendError> {
        let tags: Vec<serde_json::Value> = email
            .tags
            .iter()
            .map(|(name, value)| serde_json::json!({"name": name, "value": value}))
            .collect();

        let response = self
            .client
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({
                "from": self.from_address,
                "to": [email.to],
                "subject": email.subject,
                "html": email.html,
                "text": email.text,
                "tags": tags,
            }))
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(SendError::Provider {
                status: status.as_u16(),
                reason,
            });
        }

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transport(format!("Invalid provider response: {e}")))?;

        debug!(to = %email.to, provider_message_id = %body.id, "Provider accepted email");
        Ok(SentEmail {
            provider_message_id: body.id,
        })
    }
}

// ── SMTP relay ──────────────────────────────────────────────────────

/// SMTP sender via lettre. Tags are dropped (no SMTP equivalent).
pub struct SmtpSender {
    config: SmtpConfig,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, SendError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.clone(),
        );

        let transport = SmtpTransport::relay(&self.config.host)
            .map_err(|e| SendError::Transport(format!("SMTP relay error: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .build();

        let message_id = format!("{}@{}", Uuid::new_v4(), self.config.message_id_domain);

        let message = Message::builder()
            .from(
                self.config
                    .from_address
                    .parse()
                    .map_err(|e| SendError::InvalidAddress(format!("from: {e}")))?,
            )
            .to(email
                .to
                .parse()
                .map_err(|e| SendError::InvalidAddress(format!("to: {e}")))?)
            .subject(&email.subject)
            .message_id(Some(format!("<{message_id}>")))
            .multipart(MultiPart::alternative_plain_html(
                email.text.clone(),
                email.html.clone(),
            ))
            .map_err(|e| SendError::BuildFailed(e.to_string()))?;

        transport
            .send(&message)
            .map_err(|e| SendError::Transport(e.to_string()))?;

        debug!(to = %email.to, %message_id, "Relayed email via SMTP");
        Ok(SentEmail {
            provider_message_id: message_id,
        })
    }
}
