//! `harvest sync` and `harvest diagnose`.
//!
//! Thin CLI layer over [`crate::harvest::Harvester`]: parses operator
//! arguments, runs one or all sources, and prints summaries to stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;

use crate::client::{DatasetSource, SocrataClient};
use crate::config::{Config, MAX_DAYS_BACK};
use crate::db;
use crate::error::HarvestError;
use crate::harvest::{HarvestReport, HarvestRequest, Harvester};
use crate::normalize::NormalizerRegistry;
use crate::selector;
use crate::window::parse_bound;

/// Raw `sync` flags as typed on the command line.
#[derive(Debug, Clone, Default)]
pub struct SyncArgs {
    pub since: Option<String>,
    pub until: Option<String>,
    pub days: Option<u32>,
    pub date_field: Option<String>,
    pub page_size: Option<u32>,
    pub dry_run: bool,
    pub full: bool,
}

impl SyncArgs {
    /// Validate flags into a request. A bare `--until` date is inclusive.
    pub fn to_request(&self) -> Result<HarvestRequest> {
        let since = self
            .since
            .as_deref()
            .map(|text| {
                parse_bound(text, false)
                    .ok_or_else(|| anyhow!("Invalid --since '{}': expected YYYY-MM-DD or RFC 3339", text))
            })
            .transpose()?;
        let until = self
            .until
            .as_deref()
            .map(|text| {
                parse_bound(text, true)
                    .ok_or_else(|| anyhow!("Invalid --until '{}': expected YYYY-MM-DD or RFC 3339", text))
            })
            .transpose()?;
        if let (Some(since), Some(until)) = (since, until) {
            if since > until {
                bail!("--since must not be after --until");
            }
        }
        if let Some(days) = self.days {
            if days == 0 || days > MAX_DAYS_BACK {
                bail!("--days must be in [1, {}]", MAX_DAYS_BACK);
            }
        }
        if self.page_size == Some(0) {
            bail!("--page-size must be > 0");
        }

        Ok(HarvestRequest {
            since,
            until,
            days_back: self.days,
            date_field: self.date_field.clone(),
            page_size: self.page_size,
            dry_run: self.dry_run,
            full: self.full,
        })
    }
}

/// Sync `target`, a source name or `all`.
///
/// With `all`, a failing source is reported and the rest still run; the
/// command fails at the end if any source failed. An interrupt stops the
/// loop.
pub async fn run_sync(
    config: &Config,
    target: &str,
    args: &SyncArgs,
    interrupt: Arc<AtomicBool>,
) -> Result<()> {
    let request = args.to_request()?;

    let names: Vec<String> = if target == "all" {
        config.sources.keys().cloned().collect()
    } else {
        config.source(target)?;
        vec![target.to_string()]
    };
    if names.is_empty() {
        bail!("No sources configured. Add a [sources.<name>] section to the config file.");
    }

    let pool = db::connect(config).await?;
    let registry = NormalizerRegistry::builtin();
    let mut failed: Vec<String> = Vec::new();

    for name in &names {
        if interrupt.load(Ordering::SeqCst) {
            break;
        }
        let harvester = Harvester::from_config(config, name, pool.clone(), &registry)?
            .with_interrupt(interrupt.clone());

        match harvester.run(&request).await {
            Ok(report) => print_report(&report),
            Err(err) if names.len() == 1 => {
                pool.close().await;
                return Err(anyhow::Error::new(err).context(format!("sync {} failed", name)));
            }
            Err(err) => {
                eprintln!("sync {} failed: {}", name, err);
                failed.push(name.clone());
                if matches!(err, HarvestError::Interrupted) {
                    break;
                }
            }
        }
    }

    pool.close().await;

    if !failed.is_empty() {
        bail!("{} source(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn print_report(report: &HarvestReport) {
    if report.dry_run {
        println!("sync {} (dry-run)", report.source);
    } else {
        println!("sync {}", report.source);
    }
    println!("  window: {}{}", report.window, if report.explicit_window { " (explicit)" } else { "" });
    match (&report.cursor_field, report.syntax) {
        (Some(field), Some(syntax)) => println!(
            "  cursor field: {} ({}){}",
            field,
            syntax.as_str(),
            if report.degraded { " [degraded]" } else { "" }
        ),
        _ => println!("  cursor field: - (empty window)"),
    }
    if let Some(count) = report.window_count {
        println!("  rows in window: {}", count);
    }
    if report.sub_windows > 1 {
        println!("  sub-windows: {}", report.sub_windows);
    }
    println!("  pages: {}", report.pages);
    println!("  fetched: {} rows", report.rows_fetched);
    println!("  staged: {}", report.rows_staged);
    if report.duplicates > 0 || report.superseded > 0 {
        println!("  duplicates: {}  superseded: {}", report.duplicates, report.superseded);
    }

    if report.dry_run {
        for row in &report.sample {
            println!(
                "  sample: key={} parcel={} {}",
                row.natural_key.as_deref().unwrap_or("-"),
                row.parcel_key.as_deref().unwrap_or("-"),
                row.fields
            );
        }
        println!("  (dry-run: nothing written)");
        return;
    }

    println!("  inserted: {}", report.inserted);
    println!("  updated: {}", report.updated);
    if let Some(run_id) = report.run_id {
        println!("  run: {}", run_id);
    }
    println!("ok");
}

/// Print recency metrics for every candidate date field of a source.
pub async fn run_diagnose(config: &Config, name: &str) -> Result<()> {
    let source_config = config.source(name)?;
    let client = SocrataClient::new(&source_config.base_url, source_config.app_token(), &config.http)?;
    let dataset = &source_config.dataset_id;

    let columns = client
        .schema(dataset)
        .await
        .with_context(|| format!("Failed to load schema for '{}'", name))?;
    let report = selector::diagnose(
        &client,
        dataset,
        &columns,
        config.preferred_fields_for(source_config),
        Utc::now(),
    )
    .await;

    println!("diagnose {} ({} @ {})", name, dataset, client.base_url());
    if report.is_empty() {
        println!("  no date-like columns among {} columns", columns.len());
        return Ok(());
    }

    println!(
        "{:<32} {:<16} {:<26} {:>8} {:>8}",
        "FIELD", "TYPE", "MAX", "7D", "30D"
    );
    for diag in &report {
        let count = |value: Option<u64>| value.map_or_else(|| "-".to_string(), |c| c.to_string());
        println!(
            "{:<32} {:<16} {:<26} {:>8} {:>8}",
            diag.field,
            diag.data_type,
            diag.max_value.as_deref().unwrap_or("-"),
            count(diag.last_7_days),
            count(diag.last_30_days)
        );
        if let Some(error) = &diag.error {
            println!("  ! {}", error);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn until_date_is_inclusive() {
        let args = SyncArgs {
            since: Some("2024-01-01".into()),
            until: Some("2024-01-31".into()),
            ..SyncArgs::default()
        };
        let request = args.to_request().unwrap();
        assert_eq!(request.since, Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        assert_eq!(request.until, Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn rejects_bad_flags() {
        let bad_date = SyncArgs {
            since: Some("last tuesday".into()),
            ..SyncArgs::default()
        };
        assert!(bad_date.to_request().is_err());

        let reversed = SyncArgs {
            since: Some("2024-02-01".into()),
            until: Some("2024-01-01".into()),
            ..SyncArgs::default()
        };
        assert!(reversed.to_request().is_err());

        let zero_page = SyncArgs {
            page_size: Some(0),
            ..SyncArgs::default()
        };
        assert!(zero_page.to_request().is_err());

        for days in [0, MAX_DAYS_BACK + 1, u32::MAX] {
            let args = SyncArgs {
                days: Some(days),
                ..SyncArgs::default()
            };
            let err = args.to_request().unwrap_err().to_string();
            assert!(err.contains("--days"), "{err}");
        }
    }
}
