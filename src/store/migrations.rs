//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `init_schema()` checks
//! the current version and applies only the new ones sequentially.
//! Answer columns depend on the loaded catalog and are added separately by
//! `ensure_answer_columns()`.

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
            CREATE TABLE IF NOT EXISTS participants (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL UNIQUE,
                chat_id TEXT NOT NULL,
                username TEXT,
                display_name TEXT,
                team TEXT,
                current_block INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 0,
                session_state TEXT NOT NULL DEFAULT '{"phase":"awaiting_name"}',
                confirmed_at TEXT,
                last_activity TEXT NOT NULL DEFAULT (datetime('now')),
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_participants_team ON participants(team);
            CREATE INDEX IF NOT EXISTS idx_participants_active ON participants(is_active);
        "#,
    },
    Migration {
        version: 2,
        name: "team_poems",
        sql: r#"
            CREATE TABLE IF NOT EXISTS team_poems (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                poem_id TEXT NOT NULL,
                team TEXT NOT NULL,
                status TEXT NOT NULL,
                poem_data TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_team_poems_team ON team_poems(team);

            CREATE TABLE IF NOT EXISTS poem_contributions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                team TEXT NOT NULL,
                identity TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                line_number INTEGER NOT NULL,
                contribution TEXT NOT NULL,
                skipped INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_poem_contributions_team ON poem_contributions(team);
        "#,
    },
    Migration {
        version: 3,
        name: "one_row_per_poem_line",
        sql: r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_poem_contributions_line
                ON poem_contributions(team, line_number);
        "#,
    },
];

/// Name of the answer column for a 0-based flattened prompt index.
pub fn answer_column(index: usize) -> String {
    format!("answer_{}", index + 1)
}

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
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

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Add any missing `answer_N` columns to `participants`.
pub async fn ensure_answer_columns(conn: &Connection, count: usize) -> Result<(), DatabaseError> {
    let existing = participant_columns(conn).await?;
    let mut added = 0;
    for index in 0..count {
        let column = answer_column(index);
        if existing.iter().any(|c| c == &column) {
            continue;
        }
        conn.execute(&format!("ALTER TABLE participants ADD COLUMN {column} TEXT"), ())
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to add {column}: {e}")))?;
        added += 1;
    }
    if added > 0 {
        tracing::info!(added, total = count, "Answer columns added");
    }
    Ok(())
}

async fn participant_columns(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut rows = conn
        .query("PRAGMA table_info(participants)", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read table info: {e}")))?;

    let mut columns = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        // table_info: cid, name, type, notnull, dflt_value, pk
        if let Ok(name) = row.get::<String>(1) {
            columns.push(name);
        }
    }
    Ok(columns)
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
