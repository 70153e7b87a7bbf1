//! Configuration, built from environment variables.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default dispatcher period: 5 minutes.
pub const DEFAULT_DISPATCH_INTERVAL_SECS: u64 = 300;

/// Default dispatcher batch cap per tick.
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 50;

/// Webhook receiver configuration.
#[derive(Clone)]
pub struct WebhookConfig {
    /// Shared signing secret. `None` means delivery events are accepted
    /// without verification — an explicit permissive fallback for
    /// environments without a configured secret, logged loudly.
    pub signing_secret: Option<SecretString>,
    /// Maximum allowed clock skew for the timestamp header, seconds.
    pub tolerance_secs: i64,
}

impl WebhookConfig {
    pub fn from_env() -> Self {
        let signing_secret = std::env::var("OUTREACH_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(SecretString::from);

        let tolerance_secs: i64 = std::env::var("OUTREACH_WEBHOOK_TOLERANCE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300);

        Self {
            signing_secret,
            tolerance_secs,
        }
    }
}

/// Outbound sender selection.
pub enum SenderConfig {
    /// HTTP send-provider API (returns a provider message id).
    Api {
        base_url: String,
        api_key: SecretString,
        from_address: String,
    },
    /// SMTP relay via lettre (message id is synthesized locally).
    Smtp(SmtpConfig),
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    /// Domain part of synthesized Message-ID headers.
    pub message_id_domain: String,
}

/// Top-level engine configuration.
pub struct EngineConfig {
    pub db_path: String,
    pub http_port: u16,
    pub dispatch_interval_secs: u64,
    pub dispatch_batch_size: usize,
    pub webhook: WebhookConfig,
    pub sender: SenderConfig,
}

impl EngineConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path =
            std::env::var("OUTREACH_DB_PATH").unwrap_or_else(|_| "./data/outreach.db".to_string());

        let http_port: u16 = std::env::var("OUTREACH_HTTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let dispatch_interval_secs: u64 = std::env::var("OUTREACH_DISPATCH_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DISPATCH_INTERVAL_SECS);

        let dispatch_batch_size: usize = std::env::var("OUTREACH_DISPATCH_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DISPATCH_BATCH_SIZE);

        let from_address = std::env::var("OUTREACH_FROM_ADDRESS").map_err(|_| {
            ConfigError::MissingEnvVar("OUTREACH_FROM_ADDRESS".to_string())
        })?;

        let send_mode =
            std::env::var("OUTREACH_SEND_MODE").unwrap_or_else(|_| "api".to_string());

        let sender = match send_mode.as_str() {
            "api" => {
                let api_key = std::env::var("OUTREACH_API_KEY").map_err(|_| {
                    ConfigError::MissingRequired {
                        key: "OUTREACH_API_KEY".to_string(),
                        hint: "required when OUTREACH_SEND_MODE=api".to_string(),
                    }
                })?;
                let base_url = std::env::var("OUTREACH_API_BASE_URL")
                    .unwrap_or_else(|_| "https://api.resend.com".to_string());
                SenderConfig::Api {
                    base_url,
                    api_key: SecretString::from(api_key),
                    from_address,
                }
            }
            "smtp" => {
                let host = std::env::var("OUTREACH_SMTP_HOST").map_err(|_| {
                    ConfigError::MissingRequired {
                        key: "OUTREACH_SMTP_HOST".to_string(),
                        hint: "required when OUTREACH_SEND_MODE=smtp".to_string(),
                    }
                })?;
                let port: u16 = std::env::var("OUTREACH_SMTP_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(587);
                let username = std::env::var("OUTREACH_SMTP_USERNAME").unwrap_or_default();
                let password = std::env::var("OUTREACH_SMTP_PASSWORD").unwrap_or_default();
                let message_id_domain = from_address
                    .split_once('@')
                    .map(|(_, domain)| domain.to_string())
                    .unwrap_or_else(|| host.clone());
                SenderConfig::Smtp(SmtpConfig {
                    host,
                    port,
                    username,
                    password,
                    from_address,
                    message_id_domain,
                })
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "OUTREACH_SEND_MODE".to_string(),
                    message: format!("expected 'api' or 'smtp', got '{other}'"),
                });
            }
        };

        Ok(Self {
            db_path,
            http_port,
            dispatch_interval_secs,
            dispatch_batch_size,
            webhook: WebhookConfig::from_env(),
            sender,
        })
    }
}
