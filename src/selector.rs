//! Incremental cursor discovery.
//!
//! Picks which column of an unfamiliar dataset bounds and orders incremental
//! queries. The heuristic prefers a field with rows inside the requested
//! window over one that merely has data somewhere:
//!
//! 1. An explicit field is validated against the schema and trusted even at
//!    zero rows.
//! 2. Date-like columns are ordered by the preference list, then schema order.
//! 3. The first candidate with a non-zero window count wins.
//! 4. If every count is zero, the column with the freshest `max()` wins
//!    (degraded selection).
//! 5. If every count fails, discovery fails.
//!
//! Counting falls back from range comparison to `BETWEEN` when the source
//! rejects the predicate. An explicit field whose predicate is rejected in
//! both forms is harvested with client-side filtering.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::client::{ColumnInfo, CountOutcome, DatasetSource};
use crate::error::{HarvestError, Result};
use crate::window::{parse_timestamp, soql_timestamp, TimeWindow};

/// Declared types that can serve as a time cursor.
pub const DATE_TYPES: &[&str] = &[
    "calendar_date",
    "floating_timestamp",
    "fixed_timestamp",
    "date",
];

/// How the window predicate is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSyntax {
    /// `f >= 'a' AND f < 'b'`
    Range,
    /// `f BETWEEN 'a' AND 'b'`
    Between,
    /// No server-side predicate; rows are filtered after download.
    ClientSide,
}

impl FilterSyntax {
    pub fn predicate(self, field: &str, window: &TimeWindow) -> Option<String> {
        let start = soql_timestamp(window.start);
        let end = soql_timestamp(window.end);
        match self {
            FilterSyntax::Range => Some(format!("{0} >= '{1}' AND {0} < '{2}'", field, start, end)),
            FilterSyntax::Between => Some(format!("{} BETWEEN '{}' AND '{}'", field, start, end)),
            FilterSyntax::ClientSide => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FilterSyntax::Range => "range",
            FilterSyntax::Between => "between",
            FilterSyntax::ClientSide => "client-side",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelection {
    pub field: String,
    pub data_type: String,
    /// Rows in the window; `None` under client-side filtering.
    pub window_count: Option<u64>,
    pub syntax: FilterSyntax,
    /// Chosen by fallback rather than by a non-zero window count.
    pub degraded: bool,
}

/// Outcome of counting one field inside a window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowCount {
    Counted { count: u64, syntax: FilterSyntax },
    /// Both predicate forms were rejected.
    Rejected(String),
}

/// Count `field` in `window`, falling back from range to `BETWEEN` syntax.
pub async fn count_in_window(
    source: &dyn DatasetSource,
    dataset_id: &str,
    field: &str,
    window: &TimeWindow,
) -> Result<WindowCount> {
    let mut last_rejection = String::new();
    for syntax in [FilterSyntax::Range, FilterSyntax::Between] {
        let Some(predicate) = syntax.predicate(field, window) else {
            continue;
        };
        match source.count(dataset_id, &predicate).await? {
            CountOutcome::Counted(count) => return Ok(WindowCount::Counted { count, syntax }),
            CountOutcome::UnsupportedSyntax(message) => {
                debug!(field, syntax = syntax.as_str(), "predicate rejected: {}", message);
                last_rejection = message;
            }
        }
    }
    Ok(WindowCount::Rejected(last_rejection))
}

fn is_date_type(data_type: &str) -> bool {
    DATE_TYPES.iter().any(|t| t.eq_ignore_ascii_case(data_type))
}

/// Date-like columns ordered by `preferred` names, then schema order.
pub fn ordered_candidates(columns: &[ColumnInfo], preferred: &[String]) -> Vec<ColumnInfo> {
    let candidates: Vec<&ColumnInfo> = columns.iter().filter(|c| is_date_type(&c.data_type)).collect();
    let mut ordered: Vec<ColumnInfo> = Vec::with_capacity(candidates.len());

    for name in preferred {
        if let Some(column) = candidates
            .iter()
            .find(|c| c.field_name.eq_ignore_ascii_case(name))
        {
            if !ordered.iter().any(|o| o.field_name == column.field_name) {
                ordered.push((*column).clone());
            }
        }
    }
    for column in candidates {
        if !ordered.iter().any(|o| o.field_name == column.field_name) {
            ordered.push(column.clone());
        }
    }
    ordered
}

fn column_names(columns: &[ColumnInfo]) -> Vec<String> {
    columns.iter().map(|c| c.field_name.clone()).collect()
}

/// Choose the cursor field for `window`.
pub async fn select_date_field(
    source: &dyn DatasetSource,
    dataset_id: &str,
    columns: &[ColumnInfo],
    window: &TimeWindow,
    explicit: Option<&str>,
    preferred: &[String],
) -> Result<FieldSelection> {
    if let Some(requested) = explicit {
        let column = columns
            .iter()
            .find(|c| c.field_name.eq_ignore_ascii_case(requested))
            .ok_or_else(|| HarvestError::UnknownField {
                field: requested.to_string(),
                available: column_names(columns),
            })?;

        let selection = match count_in_window(source, dataset_id, &column.field_name, window).await? {
            WindowCount::Counted { count, syntax } => FieldSelection {
                field: column.field_name.clone(),
                data_type: column.data_type.clone(),
                window_count: Some(count),
                syntax,
                degraded: false,
            },
            WindowCount::Rejected(message) => {
                warn!(
                    field = %column.field_name,
                    "source rejects window predicates ({}); falling back to client-side filtering",
                    message
                );
                FieldSelection {
                    field: column.field_name.clone(),
                    data_type: column.data_type.clone(),
                    window_count: None,
                    syntax: FilterSyntax::ClientSide,
                    degraded: true,
                }
            }
        };
        info!(field = %selection.field, count = ?selection.window_count, "using explicit cursor field");
        return Ok(selection);
    }

    let candidates = ordered_candidates(columns, preferred);
    if candidates.is_empty() {
        return Err(HarvestError::NoDateField {
            available: column_names(columns),
        });
    }

    let mut zero: Vec<(ColumnInfo, FilterSyntax)> = Vec::new();
    let mut failed: Vec<String> = Vec::new();

    for column in &candidates {
        match count_in_window(source, dataset_id, &column.field_name, window).await {
            Ok(WindowCount::Counted { count, syntax }) if count > 0 => {
                info!(field = %column.field_name, count, "selected cursor field");
                return Ok(FieldSelection {
                    field: column.field_name.clone(),
                    data_type: column.data_type.clone(),
                    window_count: Some(count),
                    syntax,
                    degraded: false,
                });
            }
            Ok(WindowCount::Counted { syntax, .. }) => {
                debug!(field = %column.field_name, "no rows in window");
                zero.push((column.clone(), syntax));
            }
            Ok(WindowCount::Rejected(message)) => {
                warn!(field = %column.field_name, "count rejected: {}", message);
                failed.push(column.field_name.clone());
            }
            Err(e) => {
                warn!(field = %column.field_name, "count failed: {}", e);
                failed.push(column.field_name.clone());
            }
        }
    }

    if zero.is_empty() {
        return Err(HarvestError::NoUsableDateField { tried: failed });
    }

    let mut freshest: Option<(usize, DateTime<Utc>)> = None;
    for (idx, (column, _)) in zero.iter().enumerate() {
        let max = match source.max_value(dataset_id, &column.field_name).await {
            Ok(value) => value.as_deref().and_then(parse_timestamp),
            Err(e) => {
                warn!(field = %column.field_name, "max() failed: {}", e);
                None
            }
        };
        match (max, freshest) {
            (Some(max), Some((_, best))) if max <= best => {}
            (Some(max), _) => freshest = Some((idx, max)),
            (None, _) => {}
        }
    }

    let idx = freshest.map(|(idx, _)| idx).unwrap_or(0);
    let (column, syntax) = &zero[idx];
    warn!(
        field = %column.field_name,
        freshest = ?freshest.map(|(_, ts)| ts),
        "every candidate has zero rows in window; degraded selection by freshest max()"
    );
    Ok(FieldSelection {
        field: column.field_name.clone(),
        data_type: column.data_type.clone(),
        window_count: Some(0),
        syntax: *syntax,
        degraded: true,
    })
}

/// Recency metrics for one candidate field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiagnostic {
    pub field: String,
    pub data_type: String,
    pub max_value: Option<String>,
    pub last_7_days: Option<u64>,
    pub last_30_days: Option<u64>,
    pub error: Option<String>,
}

/// Probe every candidate date field. Probe failures are reported per field.
pub async fn diagnose(
    source: &dyn DatasetSource,
    dataset_id: &str,
    columns: &[ColumnInfo],
    preferred: &[String],
    now: DateTime<Utc>,
) -> Vec<FieldDiagnostic> {
    let mut report = Vec::new();
    for column in ordered_candidates(columns, preferred) {
        let mut diag = FieldDiagnostic {
            field: column.field_name.clone(),
            data_type: column.data_type.clone(),
            max_value: None,
            last_7_days: None,
            last_30_days: None,
            error: None,
        };

        match source.max_value(dataset_id, &column.field_name).await {
            Ok(value) => diag.max_value = value,
            Err(e) => diag.error = Some(e.to_string()),
        }

        for (days, slot) in [(7, &mut diag.last_7_days), (30, &mut diag.last_30_days)] {
            let window = TimeWindow {
                start: now - Duration::days(days),
                end: now,
            };
            match count_in_window(source, dataset_id, &column.field_name, &window).await {
                Ok(WindowCount::Counted { count, .. }) => *slot = Some(count),
                Ok(WindowCount::Rejected(message)) => {
                    diag.error.get_or_insert(format!("predicate rejected: {}", message));
                }
                Err(e) => {
                    diag.error.get_or_insert(e.to_string());
                }
            }
        }
        report.push(diag);
    }
    report
}

/// Build the `$select` projection from configured columns present in the
/// schema. The cursor field is always included. `None` selects everything.
pub fn resolve_projection(columns: &[ColumnInfo], wanted: &[String], cursor_field: &str) -> Option<String> {
    if wanted.is_empty() {
        return None;
    }
    let mut fields: Vec<&str> = Vec::new();
    for name in wanted {
        match columns.iter().find(|c| c.field_name.eq_ignore_ascii_case(name)) {
            Some(column) => {
                if !fields.contains(&column.field_name.as_str()) {
                    fields.push(&column.field_name);
                }
            }
            None => debug!(field = %name, "projection column not in schema, skipping"),
        }
    }
    if !fields.iter().any(|f| f.eq_ignore_ascii_case(cursor_field)) {
        fields.push(cursor_field);
    }
    Some(fields.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{QuerySpec, RawRow};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Counts keyed by field name; fields listed in `reject` refuse one or
    /// both predicate forms.
    #[derive(Default)]
    struct ScriptedSource {
        counts: HashMap<String, u64>,
        maxes: HashMap<String, String>,
        reject_range: Vec<String>,
        reject_between: Vec<String>,
        fail: Vec<String>,
        count_calls: Mutex<Vec<String>>,
    }

    fn field_of(predicate: &str) -> String {
        predicate.split_whitespace().next().unwrap_or_default().to_string()
    }

    #[async_trait]
    impl DatasetSource for ScriptedSource {
        async fn schema(&self, _dataset_id: &str) -> Result<Vec<ColumnInfo>> {
            Ok(Vec::new())
        }

        async fn count(&self, _dataset_id: &str, where_clause: &str) -> Result<CountOutcome> {
            let field = field_of(where_clause);
            self.count_calls.lock().unwrap().push(where_clause.to_string());
            if self.fail.contains(&field) {
                return Err(HarvestError::SourceUnavailable {
                    dataset: "test".into(),
                    attempts: 6,
                    message: "HTTP 503".into(),
                });
            }
            let between = where_clause.contains("BETWEEN");
            if (!between && self.reject_range.contains(&field))
                || (between && self.reject_between.contains(&field))
            {
                return Ok(CountOutcome::UnsupportedSyntax("type mismatch".into()));
            }
            Ok(CountOutcome::Counted(*self.counts.get(&field).unwrap_or(&0)))
        }

        async fn max_value(&self, _dataset_id: &str, field: &str) -> Result<Option<String>> {
            Ok(self.maxes.get(field).cloned())
        }

        async fn query(&self, _dataset_id: &str, _spec: &QuerySpec) -> Result<Vec<RawRow>> {
            Ok(Vec::new())
        }
    }

    fn columns() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new("job__", "text"),
            ColumnInfo::new("dobrundate", "floating_timestamp"),
            ColumnInfo::new("filing_date", "calendar_date"),
            ColumnInfo::new("issuance_date", "calendar_date"),
        ]
    }

    fn preferred() -> Vec<String> {
        vec!["issuance_date".into(), "filing_date".into()]
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn candidates_follow_preference_then_schema_order() {
        let ordered = ordered_candidates(&columns(), &preferred());
        let names: Vec<&str> = ordered.iter().map(|c| c.field_name.as_str()).collect();
        assert_eq!(names, ["issuance_date", "filing_date", "dobrundate"]);
    }

    #[test]
    fn predicates() {
        let w = window();
        assert_eq!(
            FilterSyntax::Range.predicate("filing_date", &w).unwrap(),
            "filing_date >= '2024-03-01T00:00:00' AND filing_date < '2024-03-08T00:00:00'"
        );
        assert_eq!(
            FilterSyntax::Between.predicate("filing_date", &w).unwrap(),
            "filing_date BETWEEN '2024-03-01T00:00:00' AND '2024-03-08T00:00:00'"
        );
        assert_eq!(FilterSyntax::ClientSide.predicate("filing_date", &w), None);
    }

    #[tokio::test]
    async fn first_non_zero_wins_over_preference() {
        let source = ScriptedSource {
            counts: HashMap::from([("filing_date".into(), 5)]),
            ..Default::default()
        };
        let selection = select_date_field(&source, "ds", &columns(), &window(), None, &preferred())
            .await
            .unwrap();
        assert_eq!(selection.field, "filing_date");
        assert_eq!(selection.window_count, Some(5));
        assert_eq!(selection.syntax, FilterSyntax::Range);
        assert!(!selection.degraded);
    }

    #[tokio::test]
    async fn all_zero_falls_back_to_freshest_max() {
        let source = ScriptedSource {
            maxes: HashMap::from([
                ("issuance_date".into(), "2023-01-05T00:00:00.000".into()),
                ("dobrundate".into(), "2024-02-28T00:00:00.000".into()),
                ("filing_date".into(), "not a date".into()),
            ]),
            ..Default::default()
        };
        let selection = select_date_field(&source, "ds", &columns(), &window(), None, &preferred())
            .await
            .unwrap();
        assert_eq!(selection.field, "dobrundate");
        assert_eq!(selection.window_count, Some(0));
        assert!(selection.degraded);
    }

    #[tokio::test]
    async fn range_rejection_falls_back_to_between() {
        let source = ScriptedSource {
            counts: HashMap::from([("issuance_date".into(), 3)]),
            reject_range: vec!["issuance_date".into()],
            ..Default::default()
        };
        let selection = select_date_field(&source, "ds", &columns(), &window(), None, &preferred())
            .await
            .unwrap();
        assert_eq!(selection.field, "issuance_date");
        assert_eq!(selection.syntax, FilterSyntax::Between);
        assert_eq!(source.count_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn explicit_field_is_trusted_at_zero() {
        let source = ScriptedSource::default();
        let selection = select_date_field(
            &source,
            "ds",
            &columns(),
            &window(),
            Some("FILING_DATE"),
            &preferred(),
        )
        .await
        .unwrap();
        assert_eq!(selection.field, "filing_date");
        assert_eq!(selection.window_count, Some(0));
        assert!(!selection.degraded);
    }

    #[tokio::test]
    async fn explicit_field_rejected_everywhere_goes_client_side() {
        let source = ScriptedSource {
            reject_range: vec!["dobrundate".into()],
            reject_between: vec!["dobrundate".into()],
            ..Default::default()
        };
        let selection =
            select_date_field(&source, "ds", &columns(), &window(), Some("dobrundate"), &[])
                .await
                .unwrap();
        assert_eq!(selection.syntax, FilterSyntax::ClientSide);
        assert_eq!(selection.window_count, None);
    }

    #[tokio::test]
    async fn unknown_explicit_field_lists_columns() {
        let source = ScriptedSource::default();
        let err = select_date_field(&source, "ds", &columns(), &window(), Some("filed"), &[])
            .await
            .unwrap_err();
        match err {
            HarvestError::UnknownField { field, available } => {
                assert_eq!(field, "filed");
                assert_eq!(available.len(), 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn schema_without_dates_fails() {
        let source = ScriptedSource::default();
        let err = select_date_field(
            &source,
            "ds",
            &[ColumnInfo::new("job__", "text")],
            &window(),
            None,
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarvestError::NoDateField { .. }));
    }

    #[tokio::test]
    async fn every_count_failing_is_fatal() {
        let source = ScriptedSource {
            fail: vec!["issuance_date".into(), "filing_date".into(), "dobrundate".into()],
            ..Default::default()
        };
        let err = select_date_field(&source, "ds", &columns(), &window(), None, &preferred())
            .await
            .unwrap_err();
        match err {
            HarvestError::NoUsableDateField { tried } => assert_eq!(tried.len(), 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn diagnose_reports_each_candidate() {
        let source = ScriptedSource {
            counts: HashMap::from([("filing_date".into(), 12)]),
            maxes: HashMap::from([("filing_date".into(), "2024-03-07T00:00:00.000".into())]),
            fail: vec!["dobrundate".into()],
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap();
        let report = diagnose(&source, "ds", &columns(), &preferred(), now).await;
        assert_eq!(report.len(), 3);
        let filing = report.iter().find(|d| d.field == "filing_date").unwrap();
        assert_eq!(filing.last_7_days, Some(12));
        assert_eq!(filing.last_30_days, Some(12));
        assert_eq!(filing.max_value.as_deref(), Some("2024-03-07T00:00:00.000"));
        let broken = report.iter().find(|d| d.field == "dobrundate").unwrap();
        assert!(broken.error.is_some());
    }

    #[test]
    fn projection_keeps_known_columns_and_cursor() {
        let wanted = vec!["JOB__".to_string(), "bbl".to_string()];
        assert_eq!(
            resolve_projection(&columns(), &wanted, "filing_date").as_deref(),
            Some("job__,filing_date")
        );
        assert_eq!(resolve_projection(&columns(), &[], "filing_date"), None);
    }
}
