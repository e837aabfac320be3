//! `harvest sources` and `harvest runs`.

use anyhow::Result;
use chrono::DateTime;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::normalize::NormalizerRegistry;
use crate::runs;
use crate::watermark;

fn format_ts(secs: Option<i64>) -> String {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// List configured sources with their tables and watermark state.
pub async fn list_sources(config: &Config) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    migrate::create_core_tables(&pool).await?;
    let mut conn = pool.acquire().await?;
    let registry = NormalizerRegistry::builtin();

    println!(
        "{:<20} {:<16} {:<12} {:<24} {:<20} PENDING",
        "SOURCE", "KIND", "DATASET", "TABLES", "HIGH WATER"
    );
    for (name, source) in &config.sources {
        let high_water = watermark::high_water_mark(&mut conn, name).await?;
        let pending = watermark::in_progress(&mut conn, name).await?;
        let kind = if registry.resolve(&source.kind).is_ok() {
            source.kind.clone()
        } else {
            format!("{}?", source.kind)
        };
        println!(
            "{:<20} {:<16} {:<12} {:<24} {:<20} {}",
            name,
            kind,
            source.dataset_id,
            format!("{} -> {}", source.staging_table(name), source.canonical_table(name)),
            format_ts(high_water.map(|ts| ts.timestamp())),
            pending.len()
        );
    }

    drop(conn);
    pool.close().await;
    Ok(())
}

/// Print recent ingest runs, newest first.
pub async fn list_runs(config: &Config, source: Option<&str>, limit: i64) -> Result<()> {
    if let Some(name) = source {
        config.source(name)?;
    }

    let pool = db::connect(config).await?;
    migrate::create_core_tables(&pool).await?;
    let mut conn = pool.acquire().await?;
    let history = runs::recent(&mut conn, source, limit).await?;

    if history.is_empty() {
        println!("No runs recorded.");
    } else {
        println!(
            "{:>6} {:<20} {:<8} {:<20} {:<20} {:>9} {:>9} CURSOR",
            "ID", "SOURCE", "STATUS", "STARTED", "FINISHED", "INSERTED", "UPDATED"
        );
        for run in &history {
            println!(
                "{:>6} {:<20} {:<8} {:<20} {:<20} {:>9} {:>9} {}",
                run.id,
                run.source,
                run.status.as_str(),
                format_ts(Some(run.started_at)),
                format_ts(run.finished_at),
                run.rows_inserted,
                run.rows_updated,
                run.cursor_field.as_deref().unwrap_or("-")
            );
            if let Some(error) = &run.error {
                println!("       error: {}", error);
            }
        }
    }

    drop(conn);
    pool.close().await;
    Ok(())
}
