//! Version-tracked schema migrations for the triage ledger.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! A state DB written before versioning (tables present, no `_migrations`)
//! is upgraded in place. Sender lists keyed by `email`/`added_at` are
//! rebuilt under the current column names and the run log's
//! `details_json` becomes `details`. Everything runs in one transaction,
//! so a failed upgrade leaves the file as it was.

use std::collections::HashSet;

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "triage_ledger",
    sql: r#"
        CREATE TABLE IF NOT EXISTS triage_state (
            email_id TEXT PRIMARY KEY,
            subject TEXT,
            sender TEXT,
            sender_email TEXT,
            received_at TEXT,
            priority TEXT,
            actionable INTEGER NOT NULL DEFAULT 0,
            reason TEXT,
            summary TEXT,
            reply_text TEXT,
            drafted INTEGER NOT NULL DEFAULT 0,
            draft_id TEXT,
            status TEXT NOT NULL DEFAULT 'triaged',
            error TEXT,
            raw_email TEXT,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_triage_state_sender
            ON triage_state(sender_email, priority);
        CREATE INDEX IF NOT EXISTS idx_triage_state_status ON triage_state(status);

        CREATE TABLE IF NOT EXISTS triage_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_at TEXT NOT NULL,
            mode TEXT NOT NULL,
            emails_seen INTEGER NOT NULL DEFAULT 0,
            triaged_count INTEGER NOT NULL DEFAULT 0,
            drafted_count INTEGER NOT NULL DEFAULT 0,
            skipped_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            details TEXT
        );

        CREATE TABLE IF NOT EXISTS vip_senders (
            address TEXT PRIMARY KEY,
            source TEXT NOT NULL DEFAULT 'manual',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS draft_blocked_senders (
            address TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        );
    "#,
}];

/// Run all pending migrations in one transaction.
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
    if MIGRATIONS.iter().all(|m| m.version <= current_version) {
        tracing::debug!(version = current_version, "Database schema up to date");
        return Ok(());
    }

    let tx = conn
        .transaction()
        .await
        .map_err(|e| DatabaseError::Transaction(format!("begin migrations: {e}")))?;

    match apply_pending(&tx, current_version).await {
        Ok(()) => tx
            .commit()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("commit migrations: {e}")))?,
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "Migration rollback failed");
            }
            return Err(e);
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

async fn apply_pending(conn: &Connection, current_version: i64) -> Result<(), DatabaseError> {
    let stashed = if current_version == 0 {
        stash_legacy_layout(conn).await?
    } else {
        Vec::new()
    };

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

    for table in &stashed {
        conn.execute_batch(&table.restore).await.map_err(|e| {
            DatabaseError::Migration(format!("Failed to carry over {}: {e}", table.name))
        })?;
        tracing::info!(table = table.name, "Legacy rows carried over");
    }
    Ok(())
}

/// Where a current column reads from in an unversioned table:
/// `(column, older names in preference order, value when none is present)`.
type ColumnSource = (&'static str, &'static [&'static str], &'static str);

/// Sender lists whose layout changed. The address always comes first.
static LIST_TABLES: &[(&str, &[ColumnSource])] = &[
    (
        "vip_senders",
        &[
            ("address", &["address", "email"], "NULL"),
            ("source", &["source"], "'manual'"),
            ("created_at", &["created_at", "added_at"], "datetime('now')"),
        ],
    ),
    (
        "draft_blocked_senders",
        &[
            ("address", &["address", "email"], "NULL"),
            ("created_at", &["created_at", "added_at"], "datetime('now')"),
        ],
    ),
];

/// A table renamed out of the way, and the SQL that copies its rows into
/// the V1 replacement and drops it.
struct StashedTable {
    name: &'static str,
    restore: String,
}

/// Bring an unversioned state DB to a shape V1 can finish.
///
/// Sender lists with any other column set are renamed to `<table>_legacy`
/// so V1 recreates them. The run log keeps its rows and only has
/// `details_json` renamed.
async fn stash_legacy_layout(conn: &Connection) -> Result<Vec<StashedTable>, DatabaseError> {
    let mut stashed = Vec::new();

    for &(name, sources) in LIST_TABLES {
        let present = table_columns(conn, name).await?;
        if present.is_empty()
            || (present.len() == sources.len()
                && sources.iter().all(|(column, ..)| present.contains(*column)))
        {
            continue;
        }

        let legacy = format!("{name}_legacy");
        conn.execute(&format!("ALTER TABLE {name} RENAME TO {legacy}"), ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to stash {name}: {e}")))?;

        let targets: Vec<&str> = sources.iter().map(|(column, ..)| *column).collect();
        let mut values: Vec<String> = sources
            .iter()
            .map(|(_, older, fallback)| {
                older
                    .iter()
                    .find(|column| present.contains(**column))
                    .map_or_else(|| (*fallback).to_string(), |column| (*column).to_string())
            })
            .collect();
        let address = format!("lower(trim({}))", values[0]);
        values[0] = address;

        tracing::info!(table = name, columns = ?present, "Rebuilding sender list from older layout");
        stashed.push(StashedTable {
            name,
            restore: format!(
                "INSERT OR IGNORE INTO {name} ({}) SELECT {} FROM {legacy} WHERE {} LIKE '%@%';
                 DROP TABLE {legacy};",
                targets.join(", "),
                values.join(", "),
                values[0],
            ),
        });
    }

    let runs = table_columns(conn, "triage_runs").await?;
    if runs.contains("details_json") && !runs.contains("details") {
        conn.execute("ALTER TABLE triage_runs RENAME COLUMN details_json TO details", ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to rename details_json: {e}")))?;
        tracing::info!("Run log details column renamed");
    }

    Ok(stashed)
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

/// Column names of `table`, empty when the table does not exist.
async fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT name FROM pragma_table_info(?1)",
            libsql::params![table],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to inspect table {table}: {e}")))?;

    let mut columns = HashSet::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read columns of {table}: {e}")))?
    {
        let name: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("Bad column name in {table}: {e}")))?;
        columns.insert(name);
    }
    Ok(columns)
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
