//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT,
                first_name TEXT,
                last_name TEXT,
                company TEXT,
                phone TEXT,
                last_contacted_at TEXT,
                next_follow_up_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);

            CREATE TABLE IF NOT EXISTS email_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                subject TEXT NOT NULL,
                body_html TEXT NOT NULL,
                body_text TEXT NOT NULL,
                variables TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS email_sequences (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                steps TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS email_jobs (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                sequence_id TEXT,
                step_number INTEGER,
                template_id TEXT NOT NULL,
                schedule_type TEXT NOT NULL DEFAULT 'scheduled',
                scheduled_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                variables TEXT NOT NULL DEFAULT '{}',
                provider_message_id TEXT,
                sent_at TEXT,
                opened_at TEXT,
                clicked_at TEXT,
                bounced_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_email_jobs_due
                ON email_jobs(status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_email_jobs_contact_sequence
                ON email_jobs(contact_id, sequence_id);
            CREATE INDEX IF NOT EXISTS idx_email_jobs_provider_message_id
                ON email_jobs(provider_message_id);

            CREATE TABLE IF NOT EXISTS email_events (
                id TEXT PRIMARY KEY,
                email_job_id TEXT NOT NULL REFERENCES email_jobs(id),
                event_type TEXT NOT NULL,
                provider_event_id TEXT,
                occurred_at TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_email_events_job ON email_events(email_job_id);
        "#,
    },
    Migration {
        version: 2,
        name: "activity_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_activity_log_contact ON activity_log(contact_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!("Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "contacts",
            "email_templates",
            "email_sequences",
            "email_jobs",
            "email_events",
            "activity_log",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        let v2: i64 = row2.get(0).unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(n2, "activity_log");
    }
}
