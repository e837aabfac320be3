//! Staging and canonical merge.
//!
//! Rows land in a private staging table keyed by natural key, then a single
//! merge upserts them into the canonical table that readers query.
//!
//! ```text
//! page rows ──stage()──▶ stg_<source> ──merge()──▶ <source>
//!            dedup by        keyed by        insert or overwrite,
//!            content hash    natural key     bump updated_at
//! ```
//!
//! Every function takes a `&mut SqliteConnection` so the caller decides the
//! transaction boundary: a page's staging writes commit together with its
//! watermark advance, and the merge commits together with the run outcome.

use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use std::collections::HashSet;

use crate::db::safe_identifier;
use crate::error::Result;

/// Validated staging/canonical table pair for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetTables {
    staging: String,
    canonical: String,
}

impl DatasetTables {
    pub fn new(staging: &str, canonical: &str) -> Result<Self> {
        Ok(Self {
            staging: safe_identifier(staging)?.to_string(),
            canonical: safe_identifier(canonical)?.to_string(),
        })
    }

    pub fn staging(&self) -> &str {
        &self.staging
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

/// A normalized row ready for staging.
#[derive(Debug, Clone)]
pub struct StageRow {
    /// Source identifier. Derived from the content hash when `None`.
    pub natural_key: Option<String>,
    pub parcel_key: Option<String>,
    pub fields: Value,
    pub raw: Value,
    /// Normalized incremental-field value; later values win.
    pub cursor_value: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOutcome {
    /// Rows written to staging (inserted or replaced).
    pub staged: u64,
    /// Rows dropped because an identical payload was already in the batch.
    pub duplicates: u64,
    /// Rows skipped because staging already holds a newer version.
    pub superseded: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
}

/// Serialize JSON with object keys sorted and no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 hex digest of the canonical JSON form.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stage a batch of rows.
///
/// Identical payloads within the batch are dropped. A row replaces the staged
/// row for its natural key unless the staged one carries a strictly newer
/// cursor value, so the latest load wins among equals.
pub async fn stage(
    conn: &mut SqliteConnection,
    tables: &DatasetTables,
    rows: &[StageRow],
    now: i64,
) -> Result<StageOutcome> {
    let sql = format!(
        r#"
        INSERT INTO {0} (natural_key, content_hash, parcel_key, fields_json, raw_json, cursor_value, loaded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(natural_key) DO UPDATE SET
            content_hash = excluded.content_hash,
            parcel_key = excluded.parcel_key,
            fields_json = excluded.fields_json,
            raw_json = excluded.raw_json,
            cursor_value = excluded.cursor_value,
            loaded_at = excluded.loaded_at
        WHERE excluded.cursor_value IS NULL
           OR {0}.cursor_value IS NULL
           OR excluded.cursor_value >= {0}.cursor_value
        "#,
        tables.staging()
    );

    let mut outcome = StageOutcome::default();
    let mut seen: HashSet<String> = HashSet::with_capacity(rows.len());

    for row in rows {
        let hash = content_hash(&row.raw);
        if !seen.insert(hash.clone()) {
            outcome.duplicates += 1;
            continue;
        }

        let natural_key = row
            .natural_key
            .clone()
            .unwrap_or_else(|| format!("sha256:{}", hash));

        let result = sqlx::query(&sql)
            .bind(&natural_key)
            .bind(&hash)
            .bind(&row.parcel_key)
            .bind(canonical_json(&row.fields))
            .bind(canonical_json(&row.raw))
            .bind(&row.cursor_value)
            .bind(now)
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() > 0 {
            outcome.staged += 1;
        } else {
            outcome.superseded += 1;
        }
    }

    Ok(outcome)
}

/// Merge staging into the canonical table, then clear staging.
///
/// `inserted` counts keys that had no canonical row before this merge; every
/// other staged key overwrote its canonical row and is counted as `updated`.
pub async fn merge(
    conn: &mut SqliteConnection,
    tables: &DatasetTables,
    now: i64,
) -> Result<MergeOutcome> {
    let staged: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", tables.staging()))
        .fetch_one(&mut *conn)
        .await?;

    let inserted: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {0} s WHERE NOT EXISTS (SELECT 1 FROM {1} c WHERE c.natural_key = s.natural_key)",
        tables.staging(),
        tables.canonical()
    ))
    .fetch_one(&mut *conn)
    .await?;

    // `WHERE true` keeps SQLite from parsing ON CONFLICT as a join clause.
    sqlx::query(&format!(
        r#"
        INSERT INTO {1} (natural_key, parcel_key, content_hash, fields_json, raw_json, cursor_value, created_at, updated_at)
        SELECT natural_key, parcel_key, content_hash, fields_json, raw_json, cursor_value, ?, ?
        FROM {0} WHERE true
        ON CONFLICT(natural_key) DO UPDATE SET
            parcel_key = excluded.parcel_key,
            content_hash = excluded.content_hash,
            fields_json = excluded.fields_json,
            raw_json = excluded.raw_json,
            cursor_value = excluded.cursor_value,
            updated_at = excluded.updated_at
        "#,
        tables.staging(),
        tables.canonical()
    ))
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    truncate(conn, tables).await?;

    Ok(MergeOutcome {
        inserted: inserted as u64,
        updated: (staged - inserted) as u64,
    })
}

pub async fn truncate(conn: &mut SqliteConnection, tables: &DatasetTables) -> Result<()> {
    sqlx::query(&format!("DELETE FROM {}", tables.staging()))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn staged_count(conn: &mut SqliteConnection, tables: &DatasetTables) -> Result<i64> {
    let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", tables.staging()))
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

pub async fn canonical_count(conn: &mut SqliteConnection, tables: &DatasetTables) -> Result<i64> {
    let count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", tables.canonical()))
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}
