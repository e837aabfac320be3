use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;
use crate::error::{HarvestError, Result};

const MAX_IDENTIFIER_LEN: usize = 63;

pub async fn connect(config: &Config) -> anyhow::Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Validate a table or column name before it is interpolated into SQL.
///
/// Allowed: an ASCII letter or `_` followed by ASCII letters, digits, or `_`,
/// at most 63 characters, not in SQLite's reserved `sqlite_` namespace.
pub fn safe_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    let reserved = name.to_ascii_lowercase().starts_with("sqlite_");

    if !valid_start || !valid_rest || reserved || name.len() > MAX_IDENTIFIER_LEN {
        return Err(HarvestError::UnsafeIdentifier(name.to_string()));
    }
    Ok(name)
}
