use std::sync::Arc;
use std::time::Duration;

use outreach_engine::config::{EngineConfig, SenderConfig};
use outreach_engine::dispatch::{Dispatcher, spawn_dispatch_loop};
use outreach_engine::sender::{EmailSender, HttpApiSender, SmtpSender};
use outreach_engine::store::{Database, LibSqlBackend};
use outreach_engine::webhook::{WebhookState, webhook_routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📬 Outreach Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhooks/email", config.http_port);
    eprintln!(
        "   Dispatch: every {}s, up to {} jobs per pass",
        config.dispatch_interval_secs, config.dispatch_batch_size
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path_ref = std::path::Path::new(&config.db_path);
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path_ref)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );
    db.run_migrations().await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to run migrations: {e}");
        std::process::exit(1);
    });
    eprintln!("   Database: {}", config.db_path);

    // ── Sender ───────────────────────────────────────────────────────────
    let sender: Arc<dyn EmailSender> = match config.sender {
        SenderConfig::Api {
            base_url,
            api_key,
            from_address,
        } => {
            eprintln!("   Sender: HTTP API ({base_url}), from {from_address}");
            Arc::new(HttpApiSender::new(base_url, api_key, from_address))
        }
        SenderConfig::Smtp(smtp) => {
            eprintln!("   Sender: SMTP ({}:{}), from {}", smtp.host, smtp.port, smtp.from_address);
            Arc::new(SmtpSender::new(smtp))
        }
    };

    if config.webhook.signing_secret.is_none() {
        tracing::warn!(
            "OUTREACH_WEBHOOK_SECRET not set; delivery events will be accepted unverified"
        );
    }

    // ── Dispatch loop ────────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        sender,
        config.dispatch_batch_size,
    ));
    let _dispatch_handle = spawn_dispatch_loop(
        dispatcher,
        Duration::from_secs(config.dispatch_interval_secs),
    );

    // ── Webhook server ───────────────────────────────────────────────────
    let state = WebhookState {
        db,
        config: Arc::new(config.webhook),
    };
    let app = webhook_routes(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "Webhook server started");
    axum::serve(listener, app).await?;

    Ok(())
}
