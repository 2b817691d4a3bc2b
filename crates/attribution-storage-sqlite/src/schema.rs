use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

/// Version written by this build.
pub const CURRENT_VERSION: i64 = 1;
/// Oldest version this build can still read.
pub const COMPATIBLE_VERSION: i64 = 1;

/// Tables holding attribution data, in the order recovery copies them.
pub(crate) const DATA_TABLES: [&str; 5] = [
    "sources",
    "source_destinations",
    "reports",
    "rate_limits",
    "dedup_keys",
];

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS sources (
  source_id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_event_id INTEGER NOT NULL,
  source_origin TEXT NOT NULL,
  reporting_origin TEXT NOT NULL,
  source_time INTEGER NOT NULL,
  expiry_time INTEGER NOT NULL,
  aggregatable_report_window_time INTEGER NOT NULL,
  source_type TEXT NOT NULL CHECK (source_type IN ('navigation', 'event')),
  attribution_logic TEXT NOT NULL CHECK (
    attribution_logic IN ('never', 'truthfully', 'falsely')
  ),
  priority INTEGER NOT NULL,
  debug_key INTEGER,
  num_attributions INTEGER NOT NULL DEFAULT 0,
  active_state TEXT NOT NULL CHECK (
    active_state IN ('active', 'reached_event_level_attribution_limit', 'inactive')
  ),
  num_aggregatable_reports INTEGER NOT NULL DEFAULT 0,
  aggregatable_budget_consumed INTEGER NOT NULL DEFAULT 0,
  filter_data TEXT NOT NULL DEFAULT '{}',
  aggregatable_source TEXT NOT NULL DEFAULT '{}',
  read_only_source_data TEXT NOT NULL DEFAULT '{}',
  debug_reporting INTEGER NOT NULL DEFAULT 0 CHECK (debug_reporting IN (0, 1)),
  is_within_fenced_frame INTEGER NOT NULL DEFAULT 0 CHECK (is_within_fenced_frame IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_sources_expiry_time ON sources(expiry_time);
CREATE INDEX IF NOT EXISTS idx_sources_source_origin ON sources(source_origin);
CREATE INDEX IF NOT EXISTS idx_sources_source_time ON sources(source_time);
CREATE INDEX IF NOT EXISTS idx_sources_reporting_origin ON sources(reporting_origin);

CREATE TABLE IF NOT EXISTS source_destinations (
  source_id INTEGER NOT NULL,
  destination_site TEXT NOT NULL,
  PRIMARY KEY (source_id, destination_site)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_source_destinations_site
  ON source_destinations(destination_site);

CREATE TABLE IF NOT EXISTS reports (
  report_id INTEGER PRIMARY KEY,
  source_id INTEGER,
  trigger_time INTEGER NOT NULL,
  report_time INTEGER NOT NULL,
  initial_report_time INTEGER NOT NULL,
  failed_send_attempts INTEGER NOT NULL DEFAULT 0,
  external_report_id TEXT NOT NULL,
  debug_key INTEGER,
  context_origin TEXT NOT NULL,
  reporting_origin TEXT NOT NULL,
  report_type INTEGER NOT NULL CHECK (report_type IN (0, 1, 2)),
  metadata TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reports_report_time ON reports(report_time);
CREATE INDEX IF NOT EXISTS idx_reports_source_type ON reports(source_id, report_type);
CREATE INDEX IF NOT EXISTS idx_reports_trigger_time ON reports(trigger_time);
CREATE INDEX IF NOT EXISTS idx_reports_reporting_origin ON reports(reporting_origin);

CREATE TABLE IF NOT EXISTS rate_limits (
  id INTEGER PRIMARY KEY,
  scope TEXT NOT NULL CHECK (scope IN ('source', 'attribution')),
  source_id INTEGER NOT NULL,
  source_site TEXT NOT NULL,
  destination_site TEXT NOT NULL,
  context_origin TEXT NOT NULL,
  reporting_origin TEXT NOT NULL,
  reporting_site TEXT NOT NULL,
  time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rate_limits_scope_sites
  ON rate_limits(scope, source_site, destination_site);
CREATE INDEX IF NOT EXISTS idx_rate_limits_time ON rate_limits(time);
CREATE INDEX IF NOT EXISTS idx_rate_limits_source_id ON rate_limits(source_id);

CREATE TABLE IF NOT EXISTS dedup_keys (
  source_id INTEGER NOT NULL,
  report_type INTEGER NOT NULL CHECK (report_type IN (0, 1)),
  dedup_key INTEGER NOT NULL,
  PRIMARY KEY (source_id, report_type, dedup_key)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS meta (
  key LONGVARCHAR NOT NULL PRIMARY KEY,
  value LONGVARCHAR
);
";

/// Raised when an integrity check reports damage that SQLite itself did not
/// surface as an error code.
#[derive(Debug, thiserror::Error)]
#[error("database corruption detected: {0}")]
pub struct CorruptionDetected(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchemaOutcome {
    Created,
    Current,
    Razed,
}

/// Opens `path` and verifies it is a readable database.
pub(crate) fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    check_integrity(&conn)?;
    Ok(conn)
}

fn check_integrity(conn: &Connection) -> Result<()> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("failed to run quick_check")?;
    if verdict != "ok" {
        return Err(anyhow!(CorruptionDetected(verdict)));
    }
    Ok(())
}

/// Brings the schema to [`CURRENT_VERSION`], razing databases this build
/// cannot read.
pub(crate) fn ensure(conn: &mut Connection) -> Result<SchemaOutcome> {
    match read_versions(conn)? {
        None => {
            if user_tables(conn)?.is_empty() {
                initialize(conn)?;
                Ok(SchemaOutcome::Created)
            } else {
                warn!("event=schema_raze reason=missing_meta");
                raze(conn)?;
                Ok(SchemaOutcome::Razed)
            }
        }
        Some((version, compatible)) if needs_raze(version, compatible) => {
            warn!(
                "event=schema_raze version={} compatible_version={} current_version={}",
                version, compatible, CURRENT_VERSION
            );
            raze(conn)?;
            Ok(SchemaOutcome::Razed)
        }
        Some(_) => {
            conn.execute_batch(SCHEMA_V1)
                .context("failed to apply attribution schema")?;
            Ok(SchemaOutcome::Current)
        }
    }
}

fn needs_raze(version: i64, compatible: i64) -> bool {
    version <= 0
        || version < COMPATIBLE_VERSION
        || version > CURRENT_VERSION
        || compatible > CURRENT_VERSION
}

pub(crate) fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_V1)
        .context("failed to apply attribution schema")?;
    conn.execute(
        "INSERT OR REPLACE INTO meta(key, value) VALUES ('version', ?1)",
        params![CURRENT_VERSION],
    )
    .context("failed to record schema version")?;
    conn.execute(
        "INSERT OR REPLACE INTO meta(key, value) VALUES ('last_compatible_version', ?1)",
        params![COMPATIBLE_VERSION],
    )
    .context("failed to record compatible schema version")?;
    Ok(())
}

fn read_versions(conn: &Connection) -> Result<Option<(i64, i64)>> {
    if !table_exists(conn, "meta")? {
        return Ok(None);
    }
    let version = meta_value(conn, "version")?.unwrap_or(0);
    let compatible = meta_value(conn, "last_compatible_version")?.unwrap_or(0);
    Ok(Some((version, compatible)))
}

fn meta_value(conn: &Connection, key: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT CAST(value AS INTEGER) FROM meta WHERE key = ?1",
        params![key],
        |row| row.get::<_, Option<i64>>(0),
    )
    .optional()
    .with_context(|| format!("failed to read meta key {key}"))
    .map(Option::flatten)
}

/// Drops every table and recreates an empty schema in one transaction.
pub(crate) fn raze(conn: &mut Connection) -> Result<()> {
    let tables = user_tables(conn)?;
    let tx = conn.transaction().context("failed to begin raze transaction")?;
    for table in &tables {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))
            .with_context(|| format!("failed to drop table {table}"))?;
    }
    if table_exists(&tx, "sqlite_sequence")? {
        tx.execute("DELETE FROM sqlite_sequence", [])
            .context("failed to reset sqlite_sequence")?;
    }
    initialize(&tx)?;
    tx.commit().context("failed to commit raze")?;
    Ok(())
}

fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC",
        )
        .context("failed to list tables")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for name in rows {
        names.push(name?);
    }
    Ok(names)
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

/// Whether `err` (or anything it wraps) reports a damaged database file.
pub(crate) fn is_corruption(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<CorruptionDetected>().is_some() {
            return true;
        }
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(failure.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
        )
    })
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Removes the database file and its journal companions. Missing files are
/// not an error.
pub(crate) fn delete_database_files(path: &Path) -> Result<()> {
    for candidate in [
        path.to_path_buf(),
        sibling(path, "-wal"),
        sibling(path, "-shm"),
        sibling(path, "-journal"),
    ] {
        match fs::remove_file(&candidate) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to delete {}", candidate.display()));
            }
        }
    }
    Ok(())
}

/// Copies every readable data table of the damaged database at `path` into a
/// fresh file, then swaps the fresh file into place. Returns the number of
/// tables copied.
pub(crate) fn recover(path: &Path) -> Result<usize> {
    let recovery_path = sibling(path, "-recovery");
    delete_database_files(&recovery_path)?;

    let copied = {
        let conn = Connection::open(&recovery_path).with_context(|| {
            format!(
                "failed to open recovery database at {}",
                recovery_path.display()
            )
        })?;
        // Lets SQLite read past a page count that disagrees with the file size.
        conn.execute_batch("PRAGMA writable_schema = ON;")
            .context("failed to relax schema checks for recovery")?;
        initialize(&conn)?;
        conn.execute(
            "ATTACH DATABASE ?1 AS corrupt",
            params![path.to_string_lossy().into_owned()],
        )
        .context("failed to attach corrupt database")?;

        let mut copied = 0;
        for table in DATA_TABLES {
            let sql = format!("INSERT OR IGNORE INTO main.{table} SELECT * FROM corrupt.{table}");
            match conn.execute(&sql, []) {
                Ok(rows) => {
                    debug!("event=recovery_table_copied table={} rows={}", table, rows);
                    copied += 1;
                }
                Err(err) => warn!("event=recovery_table_lost table={} error={}", table, err),
            }
        }

        if let Err(err) = conn.execute_batch("DETACH DATABASE corrupt;") {
            warn!("event=recovery_detach_failed error={}", err);
        }
        conn.execute_batch("PRAGMA writable_schema = OFF;")
            .context("failed to restore schema checks after recovery")?;
        copied
    };

    if copied == 0 {
        delete_database_files(&recovery_path)?;
        return Err(anyhow!("no table could be recovered from {}", path.display()));
    }

    delete_database_files(path)?;
    fs::rename(&recovery_path, path).with_context(|| {
        format!(
            "failed to move recovered database into place at {}",
            path.display()
        )
    })?;
    Ok(copied)
}
