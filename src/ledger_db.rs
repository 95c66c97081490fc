use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

const BUSY_TIMEOUT_MS: u64 = 5_000;

pub const DATA_TABLES: &[&str] = &[
    "reference_entries",
    "muzakki",
    "mustahiq",
    "penerimaan",
    "distribusi",
    "audit_records",
    "migration_logs",
    "migration_log_errors",
];

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_init.sql",
        include_str!("../db/migrations/0001_init.sql"),
    ),
    (
        "0002_statistics_indexes.sql",
        include_str!("../db/migrations/0002_statistics_indexes.sql"),
    ),
];

#[derive(Debug, Serialize)]
pub struct LedgerDbStatus {
    pub db_path: String,
    pub exists: bool,
    pub migration_files: Vec<String>,
    pub applied_versions: Vec<String>,
    pub pending_versions: Vec<String>,
    pub ready: bool,
}

#[derive(Debug, Serialize)]
pub struct LedgerDbMigrateResult {
    pub db_path: String,
    pub created: bool,
    pub applied_now: Vec<String>,
    pub skipped: Vec<String>,
    pub applied_total: usize,
    pub pending_total: usize,
}

#[derive(Debug, Serialize)]
pub struct LedgerDbTableCount {
    pub table: String,
    pub row_count: i64,
}

/// Opens the database with the pragmas every core operation relies on:
/// foreign keys enforced, and a bounded busy timeout so no storage call
/// blocks indefinitely.
pub fn open_connection(db_path: &Path) -> CoreResult<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CoreError::Storage(format!("gagal membuat direktori database: {e}")))?;
    }
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

fn ensure_schema_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )
}

fn has_schema_migrations_table(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_migrations')",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|v| v != 0)
}

fn load_applied_versions(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut versions = Vec::new();
    for row in rows {
        versions.push(row?);
    }
    Ok(versions)
}

pub fn inspect_status_at_path(db_path: &Path) -> CoreResult<LedgerDbStatus> {
    let migration_files = MIGRATIONS
        .iter()
        .map(|(v, _)| (*v).to_string())
        .collect::<Vec<_>>();
    if !db_path.exists() {
        return Ok(LedgerDbStatus {
            db_path: db_path.to_string_lossy().to_string(),
            exists: false,
            migration_files: migration_files.clone(),
            applied_versions: Vec::new(),
            pending_versions: migration_files,
            ready: false,
        });
    }

    let conn = open_connection(db_path)?;
    let applied_versions = if has_schema_migrations_table(&conn)? {
        load_applied_versions(&conn)?
    } else {
        Vec::new()
    };
    let applied_set = applied_versions.iter().cloned().collect::<HashSet<_>>();
    let pending_versions = migration_files
        .iter()
        .filter(|v| !applied_set.contains(*v))
        .cloned()
        .collect::<Vec<_>>();

    Ok(LedgerDbStatus {
        db_path: db_path.to_string_lossy().to_string(),
        exists: true,
        migration_files,
        applied_versions,
        pending_versions: pending_versions.clone(),
        ready: pending_versions.is_empty(),
    })
}

/// Applies the embedded migrations that have not been applied yet. Each
/// migration runs in its own transaction together with its
/// `schema_migrations` bookkeeping row.
pub fn apply_embedded_migrations(db_path: &Path) -> CoreResult<LedgerDbMigrateResult> {
    let created = !db_path.exists();
    let mut conn = open_connection(db_path)?;
    ensure_schema_migrations_table(&conn)?;

    let already = load_applied_versions(&conn)?
        .into_iter()
        .collect::<HashSet<_>>();

    let mut applied_now = Vec::new();
    let mut skipped = Vec::new();

    for (version, sql) in MIGRATIONS {
        if already.contains(*version) {
            skipped.push((*version).to_string());
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| CoreError::Storage(format!("gagal menjalankan migrasi {version}: {e}")))?;
        tx.execute(
            "INSERT INTO schema_migrations(version) VALUES (?1)",
            [*version],
        )?;
        tx.commit()?;
        applied_now.push((*version).to_string());
    }

    let applied_total = load_applied_versions(&conn)?.len();
    let pending_total = MIGRATIONS.len().saturating_sub(applied_total);

    Ok(LedgerDbMigrateResult {
        db_path: db_path.to_string_lossy().to_string(),
        created,
        applied_now,
        skipped,
        applied_total,
        pending_total,
    })
}

pub fn table_counts_at_path(db_path: &Path) -> CoreResult<Vec<LedgerDbTableCount>> {
    let conn = open_connection(db_path)?;
    let mut rows = Vec::new();
    for table in DATA_TABLES {
        let sql = format!("SELECT COUNT(*) FROM \"{table}\"");
        let row_count = conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?;
        rows.push(LedgerDbTableCount {
            table: (*table).to_string(),
            row_count,
        });
    }
    Ok(rows)
}
