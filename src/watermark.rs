//! Durable ingestion progress per `(source, window_start)`.
//!
//! ```text
//! absent ──first page──▶ in_progress(offset += page_size) ──short/empty page──▶ complete(offset = 0)
//! ```
//!
//! A crash mid-window leaves the last committed offset behind; the next run
//! resumes from it. Functions take a `&mut SqliteConnection` so the caller
//! can commit the watermark advance in the same transaction as the page's
//! staging writes.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkStatus {
    InProgress,
    Complete,
}

impl WatermarkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WatermarkStatus::InProgress => "in_progress",
            WatermarkStatus::Complete => "complete",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "in_progress" => Ok(WatermarkStatus::InProgress),
            "complete" => Ok(WatermarkStatus::Complete),
            other => Err(HarvestError::InvalidWatermark(format!(
                "unknown status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub source: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub cursor_offset: i64,
    pub status: WatermarkStatus,
    /// Field the offset refers to. An offset is meaningless under a
    /// different ordering.
    pub cursor_field: Option<String>,
    pub last_run: DateTime<Utc>,
}

impl Watermark {
    pub fn in_progress(
        source: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        cursor_offset: i64,
        cursor_field: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.to_string(),
            window_start,
            window_end,
            cursor_offset,
            status: WatermarkStatus::InProgress,
            cursor_field: Some(cursor_field.to_string()),
            last_run: now,
        }
    }

    pub fn complete(
        source: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        cursor_field: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.to_string(),
            window_start,
            window_end,
            cursor_offset: 0,
            status: WatermarkStatus::Complete,
            cursor_field: Some(cursor_field.to_string()),
            last_run: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_start > self.window_end {
            return Err(HarvestError::InvalidWatermark(format!(
                "window_start {} is after window_end {}",
                self.window_start, self.window_end
            )));
        }
        if self.cursor_offset < 0 {
            return Err(HarvestError::InvalidWatermark(format!(
                "negative cursor_offset {}",
                self.cursor_offset
            )));
        }
        Ok(())
    }

    /// Offset to resume from, if this watermark describes an unfinished pass
    /// over the same window end and cursor field.
    pub fn resume_offset(&self, window_end: DateTime<Utc>, cursor_field: &str) -> Option<i64> {
        let same_field = self
            .cursor_field
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case(cursor_field));
        (self.status == WatermarkStatus::InProgress && self.window_end == window_end && same_field)
            .then_some(self.cursor_offset)
    }
}

fn ts(secs: i64, column: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| HarvestError::InvalidWatermark(format!("{} out of range: {}", column, secs)))
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Watermark> {
    let status: String = row.get("status");
    Ok(Watermark {
        source: row.get("source"),
        window_start: ts(row.get("window_start"), "window_start")?,
        window_end: ts(row.get("window_end"), "window_end")?,
        cursor_offset: row.get("cursor_offset"),
        status: WatermarkStatus::parse(&status)?,
        cursor_field: row.get("cursor_field"),
        last_run: ts(row.get("last_run"), "last_run")?,
    })
}

/// Fetch the watermark for `(source, window_start)`. `None` on first run.
pub async fn get(
    conn: &mut SqliteConnection,
    source: &str,
    window_start: DateTime<Utc>,
) -> Result<Option<Watermark>> {
    let row = sqlx::query(
        r#"
        SELECT source, window_start, window_end, cursor_offset, status, cursor_field, last_run
        FROM watermarks
        WHERE source = ? AND window_start = ?
        "#,
    )
    .bind(source)
    .bind(window_start.timestamp())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(from_row).transpose()
}

/// Insert or update in a single statement on the composite key.
pub async fn upsert(conn: &mut SqliteConnection, watermark: &Watermark) -> Result<()> {
    watermark.validate()?;

    sqlx::query(
        r#"
        INSERT INTO watermarks (source, window_start, window_end, cursor_offset, status, cursor_field, last_run)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, window_start) DO UPDATE SET
            window_end = excluded.window_end,
            cursor_offset = excluded.cursor_offset,
            status = excluded.status,
            cursor_field = excluded.cursor_field,
            last_run = excluded.last_run
        "#,
    )
    .bind(&watermark.source)
    .bind(watermark.window_start.timestamp())
    .bind(watermark.window_end.timestamp())
    .bind(watermark.cursor_offset)
    .bind(watermark.status.as_str())
    .bind(&watermark.cursor_field)
    .bind(watermark.last_run.timestamp())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Greatest `window_end` among completed windows of a source.
pub async fn high_water_mark(
    conn: &mut SqliteConnection,
    source: &str,
) -> Result<Option<DateTime<Utc>>> {
    let max_end: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(window_end) FROM watermarks WHERE source = ? AND status = 'complete'",
    )
    .bind(source)
    .fetch_one(&mut *conn)
    .await?;

    max_end.map(|secs| ts(secs, "window_end")).transpose()
}

/// Unfinished windows of a source, oldest first.
pub async fn in_progress(conn: &mut SqliteConnection, source: &str) -> Result<Vec<Watermark>> {
    let rows = sqlx::query(
        r#"
        SELECT source, window_start, window_end, cursor_offset, status, cursor_field, last_run
        FROM watermarks
        WHERE source = ? AND status = 'in_progress'
        ORDER BY window_start ASC
        "#,
    )
    .bind(source)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(from_row).collect()
}

/// Drop every watermark of a source. Used by full re-harvests.
pub async fn reset(conn: &mut SqliteConnection, source: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM watermarks WHERE source = ?")
        .bind(source)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::create_core_tables;
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
    }

    async fn pool() -> sqlx::SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_core_tables(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn absent_then_in_progress_then_complete() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();

        assert!(get(&mut conn, "permits", day(1)).await.unwrap().is_none());

        let wm = Watermark::in_progress("permits", day(1), day(8), 2000, "issuance_date", day(8));
        upsert(&mut conn, &wm).await.unwrap();
        let stored = get(&mut conn, "permits", day(1)).await.unwrap().unwrap();
        assert_eq!(stored, wm);
        assert_eq!(stored.resume_offset(day(8), "ISSUANCE_DATE"), Some(2000));
        assert_eq!(stored.resume_offset(day(9), "issuance_date"), None);
        assert_eq!(stored.resume_offset(day(8), "filing_date"), None);

        let done = Watermark::complete("permits", day(1), day(8), "issuance_date", day(9));
        upsert(&mut conn, &done).await.unwrap();
        let stored = get(&mut conn, "permits", day(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, WatermarkStatus::Complete);
        assert_eq!(stored.cursor_offset, 0);
        assert_eq!(stored.resume_offset(day(8), "issuance_date"), None);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM watermarks")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rejects_invalid_watermarks() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let backwards = Watermark::complete("permits", day(9), day(1), "f", day(9));
        assert!(matches!(
            upsert(&mut conn, &backwards).await,
            Err(HarvestError::InvalidWatermark(_))
        ));

        let negative = Watermark::in_progress("permits", day(1), day(2), -5, "f", day(2));
        assert!(matches!(
            upsert(&mut conn, &negative).await,
            Err(HarvestError::InvalidWatermark(_))
        ));
    }

    #[tokio::test]
    async fn high_water_mark_ignores_unfinished_windows() {
        let pool = pool().await;
        let mut conn = pool.acquire().await.unwrap();

        assert_eq!(high_water_mark(&mut conn, "permits").await.unwrap(), None);

        upsert(&mut conn, &Watermark::complete("permits", day(1), day(5), "f", day(5)))
            .await
            .unwrap();
        upsert(&mut conn, &Watermark::in_progress("permits", day(5), day(12), 100, "f", day(12)))
            .await
            .unwrap();
        upsert(&mut conn, &Watermark::complete("complaints", day(1), day(20), "f", day(20)))
            .await
            .unwrap();

        assert_eq!(high_water_mark(&mut conn, "permits").await.unwrap(), Some(day(5)));
        let open = in_progress(&mut conn, "permits").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].cursor_offset, 100);

        assert_eq!(reset(&mut conn, "permits").await.unwrap(), 2);
        assert_eq!(high_water_mark(&mut conn, "complaints").await.unwrap(), Some(day(20)));
    }
}
