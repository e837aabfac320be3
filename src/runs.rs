//! Ingest run audit log.
//!
//! A run is created as `running` and finalized exactly once as `success` or
//! `failed`. Finalization is guarded on `status = 'running'`, so a finalized
//! run is never mutated again.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use crate::error::{truncate_message, HarvestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(HarvestError::Database(sqlx::Error::Decode(
                format!("unknown run status '{}'", other).into(),
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestRun {
    pub id: i64,
    pub source: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: RunStatus,
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub error: Option<String>,
    pub cursor_field: Option<String>,
    pub window_start: Option<i64>,
    pub window_end: Option<i64>,
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<IngestRun> {
    let status: String = row.get("status");
    Ok(IngestRun {
        id: row.get("id"),
        source: row.get("source"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        status: RunStatus::parse(&status)?,
        rows_inserted: row.get("rows_inserted"),
        rows_updated: row.get("rows_updated"),
        error: row.get("error"),
        cursor_field: row.get("cursor_field"),
        window_start: row.get("window_start"),
        window_end: row.get("window_end"),
    })
}

const SELECT_RUN: &str = r#"
    SELECT id, source, started_at, finished_at, status, rows_inserted, rows_updated,
           error, cursor_field, window_start, window_end
    FROM ingest_runs
"#;

/// Record a new `running` run and return its id.
pub async fn start(conn: &mut SqliteConnection, source: &str, now: DateTime<Utc>) -> Result<i64> {
    let result = sqlx::query("INSERT INTO ingest_runs (source, started_at, status) VALUES (?, ?, 'running')")
        .bind(source)
        .bind(now.timestamp())
        .execute(&mut *conn)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Attach the resolved cursor field and window to a running run.
pub async fn describe(
    conn: &mut SqliteConnection,
    run_id: i64,
    cursor_field: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ingest_runs SET cursor_field = ?, window_start = ?, window_end = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(cursor_field)
    .bind(window_start.timestamp())
    .bind(window_end.timestamp())
    .bind(run_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Finalize as `success`. Returns `false` if the run was already finalized.
pub async fn finish_success(
    conn: &mut SqliteConnection,
    run_id: i64,
    rows_inserted: u64,
    rows_updated: u64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE ingest_runs
        SET status = 'success', finished_at = ?, rows_inserted = ?, rows_updated = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(now.timestamp())
    .bind(rows_inserted as i64)
    .bind(rows_updated as i64)
    .bind(run_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Finalize as `failed` with the error truncated to `max_chars` characters.
pub async fn finish_failed(
    conn: &mut SqliteConnection,
    run_id: i64,
    error: &str,
    max_chars: usize,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE ingest_runs
        SET status = 'failed', finished_at = ?, error = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(now.timestamp())
    .bind(truncate_message(error, max_chars))
    .bind(run_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get(conn: &mut SqliteConnection, run_id: i64) -> Result<Option<IngestRun>> {
    let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_RUN))
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// Most recent runs, newest first, optionally for one source.
pub async fn recent(
    conn: &mut SqliteConnection,
    source: Option<&str>,
    limit: i64,
) -> Result<Vec<IngestRun>> {
    let rows = match source {
        Some(source) => {
            sqlx::query(&format!(
                "{} WHERE source = ? ORDER BY id DESC LIMIT ?",
                SELECT_RUN
            ))
            .bind(source)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query(&format!("{} ORDER BY id DESC LIMIT ?", SELECT_RUN))
                .bind(limit)
                .fetch_all(&mut *conn)
                .await?
        }
    };
    rows.iter().map(from_row).collect()
}
