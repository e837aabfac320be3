//! Time windows: resolution, month partitioning, and timestamp formats.

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::{HarvestError, Result};

/// Half-open interval `[start, end)` over the cursor field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(HarvestError::InvalidWindow(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Split at calendar-month starts. A window inside one month, or an
    /// empty window, comes back unchanged.
    pub fn split_by_month(&self) -> Vec<TimeWindow> {
        let mut parts = Vec::new();
        let mut cursor = self.start;
        while let Some(boundary) = next_month_start(cursor).filter(|b| *b < self.end) {
            parts.push(TimeWindow {
                start: cursor,
                end: boundary,
            });
            cursor = boundary;
        }
        parts.push(TimeWindow {
            start: cursor,
            end: self.end,
        });
        parts
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", soql_timestamp(self.start), soql_timestamp(self.end))
    }
}

fn next_month_start(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if ts.month() == 12 {
        (ts.year() + 1, 1)
    } else {
        (ts.year(), ts.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

/// Truncate to midnight UTC.
pub fn floor_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(ts)
}

fn truncate_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Resolved window plus how it was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub window: TimeWindow,
    /// Operator-supplied bounds; never clamped by the watermark.
    pub explicit: bool,
    /// Set when the start was moved forward to the high-water mark.
    pub clamped_to: Option<DateTime<Utc>>,
}

/// Resolve the harvest window.
///
/// Explicit bounds win over the watermark, but neither bound moves past
/// `now`. Otherwise the window is `[floor(now) - days, now]`, its start
/// clamped forward to the day of `high_water` and never past `now`.
/// `resume_from`, the start of the oldest unfinished window, pulls the start
/// back so an interrupted window is always revisited.
pub fn resolve(
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    days_back: u32,
    now: DateTime<Utc>,
    high_water: Option<DateTime<Utc>>,
    resume_from: Option<DateTime<Utc>>,
) -> Result<ResolvedWindow> {
    let now = truncate_seconds(now);

    if since.is_some() || until.is_some() {
        let requested = until.unwrap_or(now);
        let start = match since {
            Some(since) => floor_to_day(since),
            None => days_before(floor_to_day(requested), days_back)?,
        };
        // Reject reversed bounds before clamping hides them.
        if until.is_some() {
            TimeWindow::new(start, requested)?;
        }
        let end = requested.min(now);
        return Ok(ResolvedWindow {
            window: TimeWindow::new(start.min(end), end)?,
            explicit: true,
            clamped_to: None,
        });
    }

    let mut start = days_before(floor_to_day(now), days_back)?;
    let mut clamped_to = None;
    if let Some(mark) = high_water.map(floor_to_day) {
        if mark > start {
            start = mark;
            clamped_to = Some(mark);
        }
    }
    if let Some(pending) = resume_from {
        if pending < start {
            start = pending;
            clamped_to = None;
        }
    }
    let start = start.min(now);

    Ok(ResolvedWindow {
        window: TimeWindow::new(start, now)?,
        explicit: false,
        clamped_to,
    })
}

fn days_before(ts: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>> {
    ts.checked_sub_days(Days::new(u64::from(days)))
        .ok_or_else(|| HarvestError::InvalidWindow(format!("{} days before {} is out of range", days, ts)))
}

/// Parse a `--since`/`--until` argument.
///
/// Accepts `YYYY-MM-DD` or RFC 3339. A bare `--until` date is inclusive, so
/// it resolves to the following midnight.
pub fn parse_bound(text: &str, inclusive_end: bool) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0)?.and_utc();
        return Some(if inclusive_end {
            midnight + Duration::days(1)
        } else {
            midnight
        });
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Floating timestamp literal understood by SoQL predicates.
pub fn soql_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

/// Parse a cursor value as served by the source. Naive values are UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    let bare = text.trim_end_matches('Z');
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(bare, format) {
            return Some(naive.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(bare, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Sortable text form of a cursor value; unparseable values pass through
/// trimmed.
pub fn normalize_cursor_value(text: &str) -> String {
    match parse_timestamp(text) {
        Some(ts) => soql_timestamp(ts),
        None => text.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn computed_window_is_day_floored() {
        let now = at(2024, 3, 10, 15);
        let resolved = resolve(None, None, 7, now, None, None).unwrap();
        assert_eq!(resolved.window.start, at(2024, 3, 3, 0));
        assert_eq!(resolved.window.end, now);
        assert!(!resolved.explicit);
        assert_eq!(resolved.clamped_to, None);
    }

    #[test]
    fn computed_window_never_starts_before_watermark() {
        let now = at(2024, 3, 10, 15);
        let resolved = resolve(None, None, 7, now, Some(at(2024, 3, 8, 9)), None).unwrap();
        assert_eq!(resolved.window.start, at(2024, 3, 8, 0));
        assert_eq!(resolved.clamped_to, Some(at(2024, 3, 8, 0)));

        // An old watermark does not widen the window.
        let resolved = resolve(None, None, 7, now, Some(at(2023, 1, 1, 0)), None).unwrap();
        assert_eq!(resolved.window.start, at(2024, 3, 3, 0));
    }

    #[test]
    fn watermark_in_future_collapses_to_empty_window() {
        let now = at(2024, 3, 10, 15);
        let resolved = resolve(None, None, 7, now, Some(at(2024, 4, 1, 0)), None).unwrap();
        assert!(resolved.window.is_empty());
        assert_eq!(resolved.window.start, now);
    }

    #[test]
    fn unfinished_window_pulls_start_back() {
        let now = at(2024, 3, 20, 15);
        let resolved = resolve(
            None,
            None,
            7,
            now,
            Some(at(2024, 3, 1, 0)),
            Some(at(2024, 3, 1, 0)),
        )
        .unwrap();
        assert_eq!(resolved.window.start, at(2024, 3, 1, 0));
        assert_eq!(resolved.clamped_to, None);
    }

    #[test]
    fn explicit_bounds_ignore_watermark() {
        let since = parse_bound("2024-01-01", false).unwrap();
        let until = parse_bound("2024-01-31", true).unwrap();
        let resolved = resolve(Some(since), Some(until), 7, at(2024, 3, 10, 0), None, None).unwrap();
        assert!(resolved.explicit);
        assert_eq!(resolved.window.start, at(2024, 1, 1, 0));
        assert_eq!(resolved.window.end, at(2024, 2, 1, 0));

        let backwards = resolve(Some(until), Some(since), 7, at(2024, 3, 10, 0), None, None);
        assert!(matches!(backwards, Err(HarvestError::InvalidWindow(_))));
    }

    #[test]
    fn explicit_end_never_passes_now() {
        let now = at(2024, 3, 10, 15);
        let resolved = resolve(Some(at(2024, 3, 3, 0)), Some(at(2030, 1, 1, 0)), 7, now, None, None).unwrap();
        assert_eq!(resolved.window.start, at(2024, 3, 3, 0));
        assert_eq!(resolved.window.end, now);

        let future = resolve(Some(at(2024, 6, 1, 0)), None, 7, now, None, None).unwrap();
        assert!(future.window.is_empty());
        assert_eq!(future.window.end, now);

        let until_only = resolve(None, Some(at(2024, 3, 12, 0)), 2, now, None, None).unwrap();
        assert_eq!(until_only.window.start, at(2024, 3, 10, 0));
        assert_eq!(until_only.window.end, now);
    }

    #[test]
    fn huge_days_back_is_invalid_window() {
        let now = at(2024, 3, 10, 15);
        let computed = resolve(None, None, u32::MAX, now, None, None);
        assert!(matches!(computed, Err(HarvestError::InvalidWindow(_))));

        let explicit = resolve(None, Some(now), u32::MAX, now, None, None);
        assert!(matches!(explicit, Err(HarvestError::InvalidWindow(_))));
    }

    #[test]
    fn month_split() {
        let window = TimeWindow::new(at(2024, 1, 20, 0), at(2024, 3, 5, 12)).unwrap();
        let parts = window.split_by_month();
        assert_eq!(
            parts,
            vec![
                TimeWindow { start: at(2024, 1, 20, 0), end: at(2024, 2, 1, 0) },
                TimeWindow { start: at(2024, 2, 1, 0), end: at(2024, 3, 1, 0) },
                TimeWindow { start: at(2024, 3, 1, 0), end: at(2024, 3, 5, 12) },
            ]
        );

        let december = TimeWindow::new(at(2023, 12, 30, 0), at(2024, 1, 2, 0)).unwrap();
        assert_eq!(december.split_by_month().len(), 2);

        let inside = TimeWindow::new(at(2024, 2, 1, 0), at(2024, 3, 1, 0)).unwrap();
        assert_eq!(inside.split_by_month(), vec![inside]);
    }

    #[test]
    fn parses_source_timestamp_shapes() {
        let expected = at(2024, 2, 9, 0);
        for text in [
            "2024-02-09T00:00:00.000",
            "2024-02-09T00:00:00Z",
            "2024-02-09 00:00:00",
            "2024-02-09",
            "02/09/2024",
            "20240209",
        ] {
            assert_eq!(parse_timestamp(text), Some(expected), "{text}");
        }
        assert_eq!(parse_timestamp("soon"), None);
        assert_eq!(normalize_cursor_value("02/09/2024"), "2024-02-09T00:00:00");
        assert_eq!(normalize_cursor_value(" pending "), "pending");
    }
}
