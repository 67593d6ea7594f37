// Row store for scan results. The engine is SQLite through sqlx; callers only
// see the ResultStore trait.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use thiserror::Error;

use crate::aggregate::{ScanResult, Vuln};
use crate::work_version::WorkVersion;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Work version and error category of the newest row for a target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkState {
    pub work_version: Option<WorkVersion>,
    pub error_category: String,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Writes a row and its vulns atomically; returns the row id.
    async fn insert(&self, result: &ScanResult) -> Result<i64, StoreError>;

    /// Work state of the most recently created row for exactly
    /// `module_path` at `version`.
    async fn read_work_state(&self, module_path: &str, version: &str) -> Result<Option<WorkState>, StoreError>;

    /// The most recently created row for exactly `module_path` at `version`.
    async fn latest(&self, module_path: &str, version: &str) -> Result<Option<ScanResult>, StoreError>;
}

/// A column of a stored table.
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub nullable: bool,
}

const fn col(name: &'static str, sql_type: &'static str) -> Column {
    Column {
        name,
        sql_type,
        nullable: false,
    }
}

const fn nullable(name: &'static str, sql_type: &'static str) -> Column {
    Column {
        name,
        sql_type,
        nullable: true,
    }
}

/// Columns of `scan_results`, in order. Changing this list changes the
/// schema version and therefore invalidates every stored work version.
pub const RESULT_COLUMNS: &[Column] = &[
    col("created_at", "TEXT"),
    col("module_path", "TEXT"),
    col("version", "TEXT"),
    col("suffix", "TEXT"),
    col("sort_version", "TEXT"),
    col("imported_by", "INTEGER"),
    col("error", "TEXT"),
    col("error_category", "TEXT"),
    nullable("commit_time", "TEXT"),
    col("scan_seconds", "REAL"),
    nullable("build_seconds", "REAL"),
    col("scan_memory", "INTEGER"),
    col("scan_mode", "TEXT"),
    nullable("toolchain_version", "TEXT"),
    nullable("worker_version", "TEXT"),
    nullable("schema_version", "TEXT"),
    nullable("vulndb_last_modified", "TEXT"),
];

/// Columns of `scan_vulns`, the nested vuln list. `called` is not stored.
pub const VULN_COLUMNS: &[Column] = &[
    col("id", "TEXT"),
    col("package_path", "TEXT"),
    col("module_path", "TEXT"),
    col("version", "TEXT"),
];

fn column_defs(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| {
            if c.nullable {
                format!("{} {}", c.name, c.sql_type)
            } else {
                format!("{} {} NOT NULL", c.name, c.sql_type)
            }
        })
        .collect::<Vec<_>>()
        .join(",\n    ")
}

fn create_tables_sql() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS scan_results (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            {}
        );

        CREATE INDEX IF NOT EXISTS scan_results_target
            ON scan_results (module_path, version, created_at);

        CREATE TABLE IF NOT EXISTS scan_vulns (
            result_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            {},
            FOREIGN KEY(result_id) REFERENCES scan_results(row_id)
        );

        CREATE INDEX IF NOT EXISTS scan_vulns_result ON scan_vulns (result_id);
        "#,
        column_defs(RESULT_COLUMNS),
        column_defs(VULN_COLUMNS)
    )
}

/// Canonical text of the row schema, the input of the schema version.
pub fn schema_description() -> String {
    let render = |columns: &[Column]| {
        columns
            .iter()
            .map(|c| format!("{}:{}:{}", c.name, c.sql_type, if c.nullable { "NULLABLE" } else { "REQUIRED" }))
            .collect::<Vec<_>>()
            .join(",")
    };
    format!("scan_results({});vulns({})", render(RESULT_COLUMNS), render(VULN_COLUMNS))
}

fn format_time(t: &DateTime<Utc>) -> String {
    // Fixed width, so string order is time order.
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(id: i64, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("bad timestamp {:?}: {}", s, e),
        })
}

fn work_version_from_columns(
    id: i64,
    toolchain_version: Option<String>,
    worker_version: Option<String>,
    schema_version: Option<String>,
    vulndb_last_modified: Option<String>,
) -> Result<Option<WorkVersion>, StoreError> {
    match (toolchain_version, worker_version, schema_version, vulndb_last_modified) {
        (Some(toolchain_version), Some(worker_version), Some(schema_version), Some(modified)) => {
            Ok(Some(WorkVersion {
                toolchain_version,
                worker_version,
                schema_version,
                vulndb_last_modified: parse_time(id, &modified)?,
            }))
        }
        _ => Ok(None),
    }
}

#[derive(FromRow)]
struct ResultRow {
    row_id: i64,
    created_at: String,
    module_path: String,
    version: String,
    suffix: String,
    sort_version: String,
    imported_by: i64,
    error: String,
    error_category: String,
    commit_time: Option<String>,
    scan_seconds: f64,
    build_seconds: Option<f64>,
    scan_memory: i64,
    scan_mode: String,
    toolchain_version: Option<String>,
    worker_version: Option<String>,
    schema_version: Option<String>,
    vulndb_last_modified: Option<String>,
}

#[derive(Clone)]
pub struct SqliteResultStore {
    pool: Pool<Sqlite>,
}

impl SqliteResultStore {
    /// Opens (creating if missing) the database at `url`, e.g.
    /// `sqlite://vulnscan.db`, and creates the tables.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    /// A private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection would get its own memory database; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.create_tables().await?;
        Ok(store)
    }

    async fn create_tables(&self) -> Result<(), StoreError> {
        sqlx::query(&create_tables_sql()).execute(&self.pool).await?;
        Ok(())
    }

    async fn vulns_for(&self, row_id: i64) -> Result<Vec<Vuln>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT id, package_path, module_path, version
             FROM scan_vulns
             WHERE result_id = ?
             ORDER BY position",
        )
        .bind(row_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, package_path, module_path, version)| Vuln {
                id,
                package_path,
                module_path,
                version,
                called: false,
            })
            .collect())
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn insert(&self, result: &ScanResult) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let wv = result.work_version.as_ref();
        let row_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO scan_results (
                created_at, module_path, version, suffix, sort_version, imported_by,
                error, error_category, commit_time, scan_seconds, build_seconds,
                scan_memory, scan_mode, toolchain_version, worker_version,
                schema_version, vulndb_last_modified)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING row_id",
        )
        .bind(format_time(&result.created_at))
        .bind(&result.module_path)
        .bind(&result.version)
        .bind(&result.suffix)
        .bind(&result.sort_version)
        .bind(result.imported_by)
        .bind(&result.error)
        .bind(&result.error_category)
        .bind(result.commit_time.as_ref().map(format_time))
        .bind(result.scan_seconds)
        .bind(result.build_seconds)
        .bind(result.scan_memory)
        .bind(&result.scan_mode)
        .bind(wv.map(|w| w.toolchain_version.clone()))
        .bind(wv.map(|w| w.worker_version.clone()))
        .bind(wv.map(|w| w.schema_version.clone()))
        .bind(wv.map(|w| format_time(&w.vulndb_last_modified)))
        .fetch_one(&mut *tx)
        .await?;

        for (position, vuln) in result.vulns.iter().enumerate() {
            sqlx::query(
                "INSERT INTO scan_vulns (result_id, position, id, package_path, module_path, version)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(row_id)
            .bind(position as i64)
            .bind(&vuln.id)
            .bind(&vuln.package_path)
            .bind(&vuln.module_path)
            .bind(&vuln.version)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            row_id,
            module = %result.module_path,
            version = %result.version,
            vulns = result.vulns.len(),
            "stored scan result"
        );
        Ok(row_id)
    }

    async fn read_work_state(&self, module_path: &str, version: &str) -> Result<Option<WorkState>, StoreError> {
        let row = sqlx::query_as::<_, (i64, Option<String>, Option<String>, Option<String>, Option<String>, String)>(
            "SELECT row_id, toolchain_version, worker_version, schema_version, vulndb_last_modified, error_category
             FROM scan_results
             WHERE module_path = ? AND version = ?
             ORDER BY created_at DESC, row_id DESC
             LIMIT 1",
        )
        .bind(module_path)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, toolchain, worker, schema, modified, error_category)) = row else {
            return Ok(None);
        };
        Ok(Some(WorkState {
            work_version: work_version_from_columns(id, toolchain, worker, schema, modified)?,
            error_category,
        }))
    }

    async fn latest(&self, module_path: &str, version: &str) -> Result<Option<ScanResult>, StoreError> {
        let row = sqlx::query_as::<_, ResultRow>(
            "SELECT row_id, created_at, module_path, version, suffix, sort_version, imported_by,
                    error, error_category, commit_time, scan_seconds, build_seconds,
                    scan_memory, scan_mode, toolchain_version, worker_version,
                    schema_version, vulndb_last_modified
             FROM scan_results
             WHERE module_path = ? AND version = ?
             ORDER BY created_at DESC, row_id DESC
             LIMIT 1",
        )
        .bind(module_path)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id = row.row_id;
        let commit_time = match &row.commit_time {
            Some(t) => Some(parse_time(id, t)?),
            None => None,
        };
        Ok(Some(ScanResult {
            created_at: parse_time(id, &row.created_at)?,
            module_path: row.module_path,
            version: row.version,
            suffix: row.suffix,
            sort_version: row.sort_version,
            imported_by: row.imported_by,
            error: row.error,
            error_category: row.error_category,
            commit_time,
            scan_seconds: row.scan_seconds,
            build_seconds: row.build_seconds,
            scan_memory: row.scan_memory,
            scan_mode: row.scan_mode,
            work_version: work_version_from_columns(
                id,
                row.toolchain_version,
                row.worker_version,
                row.schema_version,
                row.vulndb_last_modified,
            )?,
            vulns: self.vulns_for(id).await?,
        }))
    }
}
