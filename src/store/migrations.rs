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
            CREATE TABLE IF NOT EXISTS tenants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_user_id INTEGER NOT NULL UNIQUE,
                bot_token TEXT NOT NULL UNIQUE,
                bot_username TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                gate_channel_id INTEGER,
                gate_channel_url TEXT,
                ref_link TEXT,
                deposit_link TEXT,
                support_url TEXT,
                miniapp_url TEXT,
                platinum_miniapp_url TEXT,
                webhook_secret TEXT,
                subscription_required INTEGER NOT NULL DEFAULT 1,
                deposit_required INTEGER NOT NULL DEFAULT 1,
                min_deposit TEXT NOT NULL DEFAULT '10',
                platinum_threshold TEXT NOT NULL DEFAULT '500',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tenants_active ON tenants(active);

            CREATE TABLE IF NOT EXISTS funnel_state (
                tenant_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                registered INTEGER NOT NULL DEFAULT 0,
                deposit_confirmed INTEGER NOT NULL DEFAULT 0,
                unlocked_shown INTEGER NOT NULL DEFAULT 0,
                platinum_tier INTEGER NOT NULL DEFAULT 0,
                platinum_shown INTEGER NOT NULL DEFAULT 0,
                correlation_id TEXT NOT NULL UNIQUE,
                trader_ref TEXT,
                username TEXT,
                lang TEXT NOT NULL DEFAULT 'en',
                last_message_id INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_funnel_state_correlation
                ON funnel_state(correlation_id);

            CREATE TABLE IF NOT EXISTS conversion_events (
                id TEXT PRIMARY KEY,
                tenant_id INTEGER NOT NULL,
                correlation_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount TEXT,
                raw_query TEXT,
                received_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_tenant_correlation
                ON conversion_events(tenant_id, correlation_id);

            CREATE TABLE IF NOT EXISTS content_overrides (
                tenant_id INTEGER NOT NULL,
                lang TEXT NOT NULL,
                screen TEXT NOT NULL,
                title TEXT,
                button_text TEXT,
                photo_file_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, lang, screen)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "content_override_body",
        sql: r#"
            ALTER TABLE content_overrides ADD COLUMN body TEXT;
        "#,
    },
    Migration {
        version: 3,
        name: "event_acceptance",
        sql: r#"
            ALTER TABLE conversion_events ADD COLUMN accepted INTEGER NOT NULL DEFAULT 1;
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

    tracing::info!(
        version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "Database migrations complete"
    );
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

/// Record a migration as applied.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
