use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::staging::DatasetTables;

/// Create the core tables and the staging/canonical pair of every
/// configured source.
pub async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;

    create_core_tables(&pool).await?;

    for (name, source) in &config.sources {
        let tables =
            DatasetTables::new(&source.staging_table(name), &source.canonical_table(name))?;
        ensure_dataset_tables(&pool, &tables).await?;
    }

    pool.close().await;
    Ok(())
}

/// Watermark store and ingest run log.
pub async fn create_core_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS watermarks (
            source TEXT NOT NULL,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            cursor_offset INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'in_progress',
            cursor_field TEXT,
            last_run INTEGER NOT NULL,
            PRIMARY KEY (source, window_start),
            CHECK (window_start <= window_end),
            CHECK (cursor_offset >= 0),
            CHECK (status IN ('in_progress', 'complete'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL DEFAULT 'running',
            rows_inserted INTEGER NOT NULL DEFAULT 0,
            rows_updated INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            cursor_field TEXT,
            window_start INTEGER,
            window_end INTEGER,
            CHECK (status IN ('running', 'success', 'failed'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ingest_runs_source ON ingest_runs(source, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Staging and canonical tables for one dataset. Names are validated by
/// [`DatasetTables::new`] before they reach this point.
pub async fn ensure_dataset_tables(pool: &SqlitePool, tables: &DatasetTables) -> Result<()> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            natural_key TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            parcel_key TEXT,
            fields_json TEXT NOT NULL,
            raw_json TEXT NOT NULL,
            cursor_value TEXT,
            loaded_at INTEGER NOT NULL
        )
        "#,
        tables.staging()
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            natural_key TEXT PRIMARY KEY,
            parcel_key TEXT,
            content_hash TEXT NOT NULL,
            fields_json TEXT NOT NULL,
            raw_json TEXT NOT NULL,
            cursor_value TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        tables.canonical()
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{0}_parcel_key ON {0}(parcel_key)",
        tables.canonical()
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{0}_updated_at ON {0}(updated_at DESC)",
        tables.canonical()
    ))
    .execute(pool)
    .await?;

    Ok(())
}
