//! Windowed, checkpointed harvesting of one source.
//!
//! A run resolves its time window, picks a cursor field, then pages through
//! each sub-window in a stable order:
//!
//! ```text
//! resolve window ─▶ schema + field selection ─▶ for each sub-window:
//!                                                 query page @ offset
//!                                                 normalize rows
//!                                                 ┌ stage rows          ┐ one
//!                                                 └ advance watermark   ┘ tx
//!                                               ─▶ ┌ merge staging      ┐ one
//!                                                  └ finish run         ┘ tx
//! ```
//!
//! A crash or interrupt between pages leaves the last committed offset in
//! the watermark store, and the next run resumes from it. Rows staged by a
//! failed run stay in staging until the next successful merge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, error, info, warn};

use crate::client::{DatasetSource, QuerySpec, RawRow, SocrataClient};
use crate::config::{Config, MAX_PAGE_SIZE};
use crate::error::{HarvestError, Result};
use crate::identity::value_text;
use crate::migrate;
use crate::normalize::{NormalizerRegistry, RowNormalizer};
use crate::runs;
use crate::selector::{self, FieldSelection, FilterSyntax};
use crate::staging::{self, DatasetTables, StageRow};
use crate::watermark::{self, Watermark, WatermarkStatus};
use crate::window::{self, normalize_cursor_value, parse_timestamp, ResolvedWindow, TimeWindow};

/// Upper bound on rows fetched by a dry run.
pub const DRY_RUN_SAMPLE: u32 = 25;

/// Per-invocation overrides. `None` falls back to the source configuration.
#[derive(Debug, Clone, Default)]
pub struct HarvestRequest {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub days_back: Option<u32>,
    pub date_field: Option<String>,
    pub page_size: Option<u32>,
    pub dry_run: bool,
    /// Clear staging and watermarks first, then harvest from offset 0.
    pub full: bool,
}

/// Effective settings for one configured source.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub name: String,
    pub dataset_id: String,
    pub tables: DatasetTables,
    pub date_field: Option<String>,
    pub partition_by_month: bool,
    pub select: Vec<String>,
    pub preferred_date_fields: Vec<String>,
    pub page_size: u32,
    pub days_back: u32,
    pub client_filter_row_cap: usize,
    pub polite_min: Duration,
    pub polite_max: Duration,
    pub error_max_chars: usize,
}

impl SourceSettings {
    pub fn from_config(config: &Config, name: &str) -> anyhow::Result<Self> {
        let source = config.source(name)?;
        let tables = DatasetTables::new(&source.staging_table(name), &source.canonical_table(name))?;
        Ok(Self {
            name: name.to_string(),
            dataset_id: source.dataset_id.clone(),
            tables,
            date_field: source.date_field.clone(),
            partition_by_month: source.partition_by_month,
            select: source.select.clone(),
            preferred_date_fields: config.preferred_fields_for(source).to_vec(),
            page_size: config.page_size_for(source),
            days_back: config.days_back_for(source),
            client_filter_row_cap: source.client_filter_row_cap,
            polite_min: Duration::from_millis(config.harvest.polite_min_ms),
            polite_max: Duration::from_millis(config.harvest.polite_max_ms),
            error_max_chars: config.harvest.error_max_chars,
        })
    }
}

/// Outcome of one run or dry run.
#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub source: String,
    /// `None` for dry runs, which record nothing.
    pub run_id: Option<i64>,
    pub dry_run: bool,
    pub window: TimeWindow,
    pub explicit_window: bool,
    pub cursor_field: Option<String>,
    pub syntax: Option<FilterSyntax>,
    pub degraded: bool,
    pub window_count: Option<u64>,
    pub sub_windows: usize,
    pub pages: u64,
    pub rows_fetched: u64,
    pub rows_staged: u64,
    pub duplicates: u64,
    pub superseded: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Normalized sample rows (dry run only).
    pub sample: Vec<StageRow>,
}

impl HarvestReport {
    fn from_plan(source: &str, plan: &Plan, dry_run: bool) -> Self {
        Self {
            source: source.to_string(),
            run_id: None,
            dry_run,
            window: plan.window.window,
            explicit_window: plan.window.explicit,
            cursor_field: plan.selection.as_ref().map(|s| s.field.clone()),
            syntax: plan.selection.as_ref().map(|s| s.syntax),
            degraded: plan.selection.as_ref().is_some_and(|s| s.degraded),
            window_count: plan.selection.as_ref().and_then(|s| s.window_count),
            sub_windows: plan.sub_windows.len(),
            pages: 0,
            rows_fetched: 0,
            rows_staged: 0,
            duplicates: 0,
            superseded: 0,
            inserted: 0,
            updated: 0,
            sample: Vec::new(),
        }
    }
}

struct Plan {
    window: ResolvedWindow,
    /// `None` when the window is empty and nothing will be fetched.
    selection: Option<FieldSelection>,
    projection: Option<String>,
    sub_windows: Vec<SubWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubWindow {
    window: TimeWindow,
    offset: u64,
}

/// Drives runs for one source.
pub struct Harvester {
    pool: SqlitePool,
    settings: SourceSettings,
    source: Arc<dyn DatasetSource>,
    normalizer: Arc<dyn RowNormalizer>,
    interrupt: Arc<AtomicBool>,
}

impl Harvester {
    pub fn new(
        pool: SqlitePool,
        settings: SourceSettings,
        source: Arc<dyn DatasetSource>,
        normalizer: Arc<dyn RowNormalizer>,
    ) -> Self {
        Self {
            pool,
            settings,
            source,
            normalizer,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build a harvester backed by the SODA client for source `name`.
    pub fn from_config(
        config: &Config,
        name: &str,
        pool: SqlitePool,
        registry: &NormalizerRegistry,
    ) -> anyhow::Result<Self> {
        let source_config = config.source(name)?;
        let settings = SourceSettings::from_config(config, name)?;
        let client = SocrataClient::new(
            &source_config.base_url,
            source_config.app_token(),
            &config.http,
        )?;
        let normalizer = registry.resolve(&source_config.kind)?;
        Ok(Self::new(pool, settings, Arc::new(client), normalizer))
    }

    /// Share a shutdown flag. It is honored only between pages.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    pub async fn run(&self, request: &HarvestRequest) -> Result<HarvestReport> {
        self.run_at(request, Utc::now()).await
    }

    /// Run with an explicit clock.
    pub async fn run_at(&self, request: &HarvestRequest, now: DateTime<Utc>) -> Result<HarvestReport> {
        migrate::create_core_tables(&self.pool).await?;
        migrate::ensure_dataset_tables(&self.pool, &self.settings.tables).await?;

        if request.dry_run {
            return self.dry_run(request, now).await;
        }

        let run_id = {
            let mut conn = self.pool.acquire().await?;
            runs::start(&mut conn, &self.settings.name, now).await?
        };
        info!(source = %self.settings.name, run_id, "run started");

        match self.execute(run_id, request, now).await {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(source = %self.settings.name, run_id, error = %err, "run failed");
                if let Err(record_err) = self.record_failure(run_id, &err).await {
                    error!(run_id, "could not record run failure: {}", record_err);
                }
                Err(err)
            }
        }
    }

    async fn record_failure(&self, run_id: i64, err: &HarvestError) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        runs::finish_failed(
            &mut conn,
            run_id,
            &err.to_string(),
            self.settings.error_max_chars,
            Utc::now(),
        )
        .await
    }

    async fn execute(&self, run_id: i64, request: &HarvestRequest, now: DateTime<Utc>) -> Result<HarvestReport> {
        let page_size = self.page_size(request);

        if request.full {
            let mut tx = self.pool.begin().await?;
            staging::truncate(&mut *tx, &self.settings.tables).await?;
            let cleared = watermark::reset(&mut *tx, &self.settings.name).await?;
            tx.commit().await?;
            info!(source = %self.settings.name, watermarks = cleared, "full refresh: staging and watermarks cleared");
        }

        let plan = {
            let mut conn = self.pool.acquire().await?;
            let plan = self.plan(&mut conn, request, now, true).await?;
            if let Some(selection) = &plan.selection {
                runs::describe(
                    &mut conn,
                    run_id,
                    &selection.field,
                    plan.window.window.start,
                    plan.window.window.end,
                )
                .await?;
            }
            plan
        };

        let mut report = HarvestReport::from_plan(&self.settings.name, &plan, false);
        report.run_id = Some(run_id);

        if let Some(selection) = &plan.selection {
            for sub in &plan.sub_windows {
                self.harvest_window(*sub, selection, plan.projection.as_deref(), page_size, now, &mut report)
                    .await?;
            }
        }

        let mut tx = self.pool.begin().await?;
        let merged = staging::merge(&mut *tx, &self.settings.tables, now.timestamp()).await?;
        runs::finish_success(&mut *tx, run_id, merged.inserted, merged.updated, Utc::now()).await?;
        tx.commit().await?;

        report.inserted = merged.inserted;
        report.updated = merged.updated;
        info!(
            source = %self.settings.name,
            run_id,
            pages = report.pages,
            fetched = report.rows_fetched,
            inserted = report.inserted,
            updated = report.updated,
            "run succeeded"
        );
        Ok(report)
    }

    fn page_size(&self, request: &HarvestRequest) -> u32 {
        let requested = request.page_size.unwrap_or(self.settings.page_size);
        let page_size = requested.clamp(1, MAX_PAGE_SIZE);
        if page_size != requested {
            warn!(requested, page_size, "page size out of range, clamped");
        }
        page_size
    }

    /// Resolve window, cursor field, projection, and sub-windows. With
    /// `resume` set, each sub-window also picks up its stored offset.
    async fn plan(
        &self,
        conn: &mut SqliteConnection,
        request: &HarvestRequest,
        now: DateTime<Utc>,
        resume: bool,
    ) -> Result<Plan> {
        let name = &self.settings.name;
        let explicit = request.since.is_some() || request.until.is_some();

        let (high_water, pending) = if request.full || explicit {
            (None, None)
        } else {
            let high_water = watermark::high_water_mark(conn, name).await?;
            let pending = watermark::in_progress(conn, name)
                .await?
                .iter()
                .map(|mark| mark.window_start)
                .min();
            (high_water, pending)
        };

        let days_back = request.days_back.unwrap_or(self.settings.days_back);
        let resolved = window::resolve(request.since, request.until, days_back, now, high_water, pending)?;
        info!(source = %name, window = %resolved.window, explicit = resolved.explicit, "resolved window");
        if let Some(mark) = resolved.clamped_to {
            debug!(source = %name, high_water = %mark, "window start clamped to high-water mark");
        }

        if resolved.window.is_empty() {
            info!(source = %name, "window is empty, nothing to fetch");
            return Ok(Plan {
                window: resolved,
                selection: None,
                projection: None,
                sub_windows: Vec::new(),
            });
        }

        let columns = self.source.schema(&self.settings.dataset_id).await?;
        let explicit_field = request
            .date_field
            .as_deref()
            .or(self.settings.date_field.as_deref());
        let selection = selector::select_date_field(
            self.source.as_ref(),
            &self.settings.dataset_id,
            &columns,
            &resolved.window,
            explicit_field,
            &self.settings.preferred_date_fields,
        )
        .await?;
        let projection = selector::resolve_projection(&columns, &self.settings.select, &selection.field);

        let parts = if self.settings.partition_by_month {
            resolved.window.split_by_month()
        } else {
            vec![resolved.window]
        };

        let mut sub_windows = Vec::with_capacity(parts.len());
        for part in parts {
            let sub = if resume && !request.full {
                self.resume_point(conn, part, &selection.field, resolved.explicit)
                    .await?
            } else {
                SubWindow { window: part, offset: 0 }
            };
            sub_windows.push(sub);
        }

        Ok(Plan {
            window: resolved,
            selection: Some(selection),
            projection,
            sub_windows,
        })
    }

    /// Starting offset for one sub-window.
    ///
    /// An unfinished pass over the same window and cursor field resumes at
    /// its stored offset. A computed window whose stored pass ended earlier
    /// adopts that end, so the offset keeps its meaning.
    async fn resume_point(
        &self,
        conn: &mut SqliteConnection,
        part: TimeWindow,
        cursor_field: &str,
        explicit: bool,
    ) -> Result<SubWindow> {
        let stored = watermark::get(conn, &self.settings.name, part.start).await?;
        let Some(mark) = stored.filter(|mark| mark.status == WatermarkStatus::InProgress) else {
            return Ok(SubWindow { window: part, offset: 0 });
        };

        if let Some(offset) = mark.resume_offset(part.end, cursor_field) {
            info!(window = %part, offset, "resuming interrupted window");
            return Ok(SubWindow {
                window: part,
                offset: offset as u64,
            });
        }

        let same_field = mark
            .cursor_field
            .as_deref()
            .is_some_and(|field| field.eq_ignore_ascii_case(cursor_field));
        if same_field && !explicit && mark.window_end < part.end {
            let window = TimeWindow::new(part.start, mark.window_end)?;
            info!(
                window = %window,
                offset = mark.cursor_offset,
                "resuming interrupted window with its original end"
            );
            return Ok(SubWindow {
                window,
                offset: mark.cursor_offset as u64,
            });
        }

        warn!(
            window = %part,
            stored_end = %mark.window_end,
            stored_field = ?mark.cursor_field,
            "stored offset belongs to a different window or cursor field, starting at 0"
        );
        Ok(SubWindow { window: part, offset: 0 })
    }

    async fn harvest_window(
        &self,
        sub: SubWindow,
        selection: &FieldSelection,
        projection: Option<&str>,
        page_size: u32,
        now: DateTime<Utc>,
        report: &mut HarvestReport,
    ) -> Result<()> {
        let name = &self.settings.name;
        let field = &selection.field;
        let client_side = selection.syntax == FilterSyntax::ClientSide;
        let spec_template = QuerySpec {
            select: projection.map(str::to_string),
            where_clause: selection.syntax.predicate(field, &sub.window),
            order_by: order_by(field, selection.syntax),
            limit: page_size,
            offset: sub.offset,
        };

        info!(source = %name, window = %sub.window, offset = sub.offset, "harvesting window");

        let mut offset = sub.offset;
        let mut scanned: usize = 0;
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                warn!(source = %name, window = %sub.window, offset, "interrupt requested, stopping");
                return Err(HarvestError::Interrupted);
            }

            let spec = QuerySpec {
                offset,
                ..spec_template.clone()
            };
            let rows = self.source.query(&self.settings.dataset_id, &spec).await?;
            let fetched = rows.len();
            scanned += fetched;

            let filter = client_side.then_some(&sub.window);
            let page = prepare_page(self.normalizer.as_ref(), &rows, field, filter);

            let mut done = fetched < page_size as usize;
            if client_side && !done {
                if page.reached_older {
                    debug!(source = %name, "client-side scan reached rows older than the window");
                    done = true;
                } else if scanned >= self.settings.client_filter_row_cap {
                    warn!(
                        source = %name,
                        scanned,
                        cap = self.settings.client_filter_row_cap,
                        "client-side scan cap reached, window marked complete"
                    );
                    done = true;
                }
            }

            let next_offset = offset + u64::from(page_size);
            let checkpoint = if done {
                Watermark::complete(name, sub.window.start, sub.window.end, field, now)
            } else {
                Watermark::in_progress(name, sub.window.start, sub.window.end, next_offset as i64, field, now)
            };

            let mut tx = self.pool.begin().await?;
            let outcome = staging::stage(&mut *tx, &self.settings.tables, &page.rows, now.timestamp()).await?;
            watermark::upsert(&mut *tx, &checkpoint).await?;
            tx.commit().await?;

            report.pages += 1;
            report.rows_fetched += fetched as u64;
            report.rows_staged += outcome.staged;
            report.duplicates += outcome.duplicates;
            report.superseded += outcome.superseded;
            debug!(
                source = %name,
                offset,
                fetched,
                staged = outcome.staged,
                dropped = page.dropped,
                "page committed"
            );

            if done {
                info!(source = %name, window = %sub.window, "window complete");
                return Ok(());
            }
            offset = next_offset;
            self.polite_pause().await;
        }
    }

    async fn dry_run(&self, request: &HarvestRequest, now: DateTime<Utc>) -> Result<HarvestReport> {
        let plan = {
            let mut conn = self.pool.acquire().await?;
            self.plan(&mut conn, request, now, false).await?
        };
        let mut report = HarvestReport::from_plan(&self.settings.name, &plan, true);

        let (Some(selection), Some(first)) = (plan.selection.as_ref(), plan.sub_windows.first()) else {
            return Ok(report);
        };

        let limit = self.page_size(request).min(DRY_RUN_SAMPLE);
        let spec = QuerySpec {
            select: plan.projection.clone(),
            where_clause: selection.syntax.predicate(&selection.field, &first.window),
            order_by: order_by(&selection.field, selection.syntax),
            limit,
            offset: 0,
        };
        let rows = self.source.query(&self.settings.dataset_id, &spec).await?;
        let filter = (selection.syntax == FilterSyntax::ClientSide).then_some(&first.window);
        let page = prepare_page(self.normalizer.as_ref(), &rows, &selection.field, filter);

        let mut tx = self.pool.begin().await?;
        let outcome = staging::stage(&mut *tx, &self.settings.tables, &page.rows, now.timestamp()).await?;
        tx.rollback().await?;

        report.pages = 1;
        report.rows_fetched = rows.len() as u64;
        report.rows_staged = outcome.staged;
        report.duplicates = outcome.duplicates;
        report.superseded = outcome.superseded;
        report.sample = page.rows;
        info!(source = %self.settings.name, fetched = report.rows_fetched, "dry run complete, nothing written");
        Ok(report)
    }

    async fn polite_pause(&self) {
        let min = self.settings.polite_min.as_millis() as u64;
        let max = self.settings.polite_max.as_millis() as u64;
        if max == 0 {
            return;
        }
        let millis = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

/// `$order` for a paged scan. Client-side filtering walks newest first so
/// the scan can stop once it passes the window start.
fn order_by(field: &str, syntax: FilterSyntax) -> String {
    match syntax {
        FilterSyntax::ClientSide => format!("{} DESC, :id", field),
        FilterSyntax::Range | FilterSyntax::Between => format!("{} ASC, :id", field),
    }
}

#[derive(Debug, Default)]
struct PreparedPage {
    rows: Vec<StageRow>,
    /// A row older than the window was seen (client-side mode).
    reached_older: bool,
    dropped: usize,
}

fn cursor_text(row: &RawRow, field: &str) -> Option<String> {
    row.get(field)
        .or_else(|| {
            row.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(field))
                .map(|(_, value)| value)
        })
        .and_then(value_text)
}

/// Normalize one page. With `filter` set, rows whose cursor does not parse
/// into the window are dropped.
fn prepare_page(
    normalizer: &dyn RowNormalizer,
    rows: &[RawRow],
    field: &str,
    filter: Option<&TimeWindow>,
) -> PreparedPage {
    let mut page = PreparedPage {
        rows: Vec::with_capacity(rows.len()),
        ..PreparedPage::default()
    };

    for raw in rows {
        let cursor = cursor_text(raw, field);
        if let Some(window) = filter {
            match cursor.as_deref().and_then(parse_timestamp) {
                Some(ts) if window.contains(ts) => {}
                Some(ts) => {
                    if ts < window.start {
                        page.reached_older = true;
                    }
                    page.dropped += 1;
                    continue;
                }
                None => {
                    page.dropped += 1;
                    continue;
                }
            }
        }

        let normalized = normalizer.normalize(raw);
        page.rows.push(StageRow {
            natural_key: normalized.natural_key,
            parcel_key: normalized.parcel_key,
            fields: Value::Object(normalized.fields),
            raw: Value::Object(raw.clone()),
            cursor_value: cursor.as_deref().map(normalize_cursor_value),
        });
    }

    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Generic;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(value: Value) -> RawRow {
        value.as_object().cloned().unwrap()
    }

    fn march() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn order_uses_stable_tiebreaker() {
        assert_eq!(order_by("issuance_date", FilterSyntax::Range), "issuance_date ASC, :id");
        assert_eq!(order_by("issuance_date", FilterSyntax::Between), "issuance_date ASC, :id");
        assert_eq!(order_by("issuance_date", FilterSyntax::ClientSide), "issuance_date DESC, :id");
    }

    #[test]
    fn page_rows_carry_normalized_cursor() {
        let rows = vec![row(json!({
            "Issuance_Date": "03/02/2024",
            "Borough": "BROOKLYN",
            "Block": "1",
            "Lot": "1"
        }))];
        let page = prepare_page(&Generic, &rows, "issuance_date", None);
        assert_eq!(page.rows.len(), 1);
        let staged = &page.rows[0];
        assert_eq!(staged.cursor_value.as_deref(), Some("2024-03-02T00:00:00"));
        assert_eq!(staged.parcel_key.as_deref(), Some("3000010001"));
        assert_eq!(staged.raw["Block"], "1");
    }

    #[test]
    fn client_side_filter_drops_rows_outside_window() {
        let rows = vec![
            row(json!({"filed": "2024-03-09T00:00:00.000", ":id": "a"})),
            row(json!({"filed": "2024-03-05T12:00:00.000", ":id": "b"})),
            row(json!({"filed": "not a date", ":id": "c"})),
            row(json!({"filed": "2024-02-28T00:00:00.000", ":id": "d"})),
        ];
        let window = march();
        let page = prepare_page(&Generic, &rows, "filed", Some(&window));
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].raw[":id"], "b");
        assert_eq!(page.dropped, 3);
        assert!(page.reached_older);
    }

    #[test]
    fn missing_cursor_is_kept_without_filter() {
        let rows = vec![row(json!({"name": "x"}))];
        let page = prepare_page(&Generic, &rows, "filed", None);
        assert_eq!(page.rows.len(), 1);
        assert!(page.rows[0].cursor_value.is_none());
        assert!(!page.reached_older);
    }
}
