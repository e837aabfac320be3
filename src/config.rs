//! TOML configuration.
//!
//! The configuration is parsed once at startup into an immutable [`Config`]
//! and passed by reference into the components that need it.
//!
//! ```toml
//! [db]
//! path = "./data/harvest.sqlite"
//!
//! [harvest]
//! page_size = 1000
//! days_back = 7
//!
//! [http]
//! max_retries = 5
//!
//! [sources.dob_permits]
//! base_url = "https://data.cityofnewyork.us"
//! dataset_id = "ipu4-2q9a"
//! kind = "dob_permits"
//! partition_by_month = true
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::db::safe_identifier;

/// Largest page the SODA API serves in one request.
pub const MAX_PAGE_SIZE: u32 = 50_000;

/// Longest computed look-back window, in days.
pub const MAX_DAYS_BACK: u32 = 36_500;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Defaults for every harvest run.
#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    #[serde(default = "default_polite_min_ms")]
    pub polite_min_ms: u64,
    #[serde(default = "default_polite_max_ms")]
    pub polite_max_ms: u64,
    #[serde(default = "default_error_max_chars")]
    pub error_max_chars: usize,
    /// Conventional cursor names, most preferred first.
    #[serde(default = "default_preferred_date_fields")]
    pub preferred_date_fields: Vec<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            days_back: default_days_back(),
            polite_min_ms: default_polite_min_ms(),
            polite_max_ms: default_polite_max_ms(),
            error_max_chars: default_error_max_chars(),
            preferred_date_fields: default_preferred_date_fields(),
        }
    }
}

fn default_page_size() -> u32 {
    1000
}
fn default_days_back() -> u32 {
    7
}
fn default_polite_min_ms() -> u64 {
    250
}
fn default_polite_max_ms() -> u64 {
    750
}
fn default_error_max_chars() -> usize {
    1000
}
fn default_preferred_date_fields() -> Vec<String> {
    [
        "last_updated",
        "lastupdatedate",
        "last_update",
        "latest_status_date",
        "issuance_date",
        "issued_date",
        "filing_date",
        "filed_date",
        "status_date",
        "date_received",
        "date_entered",
        "inspection_date",
        "last_inspection_date",
        "last_status_date",
        "date",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// HTTP client and retry settings.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_retry_after_cap_secs")]
    pub retry_after_cap_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ms: default_jitter_ms(),
            retry_after_cap_secs: default_retry_after_cap_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_initial_ms() -> u64 {
    2_000
}
fn default_backoff_max_ms() -> u64 {
    60_000
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_retry_after_cap_secs() -> u64 {
    120
}
fn default_user_agent() -> String {
    concat!("parcel-harvest/", env!("CARGO_PKG_VERSION")).to_string()
}

/// One dataset to harvest.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub dataset_id: String,
    /// Row normalizer strategy (`dob_permits`, `dob_complaints`, `pluto`, `generic`).
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Pinned cursor field. When absent the selector discovers one.
    #[serde(default)]
    pub date_field: Option<String>,
    #[serde(default)]
    pub partition_by_month: bool,
    /// Column projection. Columns missing from the live schema are skipped.
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default)]
    pub staging_table: Option<String>,
    #[serde(default)]
    pub canonical_table: Option<String>,
    /// Environment variable holding the `X-App-Token` value.
    #[serde(default)]
    pub app_token_env: Option<String>,
    #[serde(default)]
    pub preferred_date_fields: Option<Vec<String>>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub days_back: Option<u32>,
    /// Upper bound on rows scanned when the source rejects date predicates.
    #[serde(default = "default_client_filter_row_cap")]
    pub client_filter_row_cap: usize,
}

fn default_base_url() -> String {
    "https://data.cityofnewyork.us".to_string()
}
fn default_kind() -> String {
    "generic".to_string()
}
fn default_client_filter_row_cap() -> usize {
    50_000
}

impl SourceConfig {
    /// Staging table name, defaulting to `stg_<source>`.
    pub fn staging_table(&self, source: &str) -> String {
        self.staging_table
            .clone()
            .unwrap_or_else(|| format!("stg_{}", source))
    }

    /// Canonical table name, defaulting to the source name.
    pub fn canonical_table(&self, source: &str) -> String {
        self.canonical_table
            .clone()
            .unwrap_or_else(|| source.to_string())
    }

    /// Read the app token from the configured environment variable, if set.
    pub fn app_token(&self) -> Option<String> {
        self.app_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|token| !token.trim().is_empty())
    }
}

impl Config {
    pub fn source(&self, name: &str) -> Result<&SourceConfig> {
        self.sources.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.sources.keys().map(String::as_str).collect();
            anyhow::anyhow!(
                "Unknown source: '{}'. Configured: {}",
                name,
                if known.is_empty() {
                    "(none)".to_string()
                } else {
                    known.join(", ")
                }
            )
        })
    }

    /// Effective page size for a source.
    pub fn page_size_for(&self, source: &SourceConfig) -> u32 {
        source.page_size.unwrap_or(self.harvest.page_size)
    }

    pub fn days_back_for(&self, source: &SourceConfig) -> u32 {
        source.days_back.unwrap_or(self.harvest.days_back)
    }

    pub fn preferred_fields_for<'a>(&'a self, source: &'a SourceConfig) -> &'a [String] {
        source
            .preferred_date_fields
            .as_deref()
            .unwrap_or(&self.harvest.preferred_date_fields)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate harvest
    if config.harvest.page_size == 0 || config.harvest.page_size > MAX_PAGE_SIZE {
        anyhow::bail!("harvest.page_size must be in [1, {}]", MAX_PAGE_SIZE);
    }
    if config.harvest.polite_min_ms > config.harvest.polite_max_ms {
        anyhow::bail!("harvest.polite_min_ms must be <= harvest.polite_max_ms");
    }
    if config.harvest.days_back == 0 || config.harvest.days_back > MAX_DAYS_BACK {
        anyhow::bail!("harvest.days_back must be in [1, {}]", MAX_DAYS_BACK);
    }
    if config.harvest.error_max_chars == 0 {
        anyhow::bail!("harvest.error_max_chars must be > 0");
    }

    // Validate http
    if config.http.backoff_initial_ms > config.http.backoff_max_ms {
        anyhow::bail!("http.backoff_initial_ms must be <= http.backoff_max_ms");
    }
    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }

    // Validate sources
    for (name, source) in &config.sources {
        if source.dataset_id.trim().is_empty() {
            anyhow::bail!("sources.{}.dataset_id must not be empty", name);
        }
        if !source.base_url.starts_with("http://") && !source.base_url.starts_with("https://") {
            anyhow::bail!(
                "sources.{}.base_url must be an http(s) URL, got '{}'",
                name,
                source.base_url
            );
        }
        if let Some(size) = source.page_size {
            if size == 0 || size > MAX_PAGE_SIZE {
                anyhow::bail!("sources.{}.page_size must be in [1, {}]", name, MAX_PAGE_SIZE);
            }
        }
        if let Some(days) = source.days_back {
            if days == 0 || days > MAX_DAYS_BACK {
                anyhow::bail!("sources.{}.days_back must be in [1, {}]", name, MAX_DAYS_BACK);
            }
        }
        let staging = source.staging_table(name);
        let canonical = source.canonical_table(name);
        safe_identifier(&staging)
            .with_context(|| format!("sources.{}: invalid staging table", name))?;
        safe_identifier(&canonical)
            .with_context(|| format!("sources.{}: invalid canonical table", name))?;
        if staging.eq_ignore_ascii_case(&canonical) {
            anyhow::bail!(
                "sources.{}: staging and canonical tables must differ ('{}')",
                name,
                staging
            );
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/harvest.sqlite"

[sources.dob_permits]
dataset_id = "ipu4-2q9a"
kind = "dob_permits"
"#;

    #[test]
    fn defaults_fill_missing_sections() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.harvest.page_size, 1000);
        assert_eq!(config.http.max_retries, 5);
        let source = config.source("dob_permits").unwrap();
        assert_eq!(source.base_url, "https://data.cityofnewyork.us");
        assert_eq!(source.staging_table("dob_permits"), "stg_dob_permits");
        assert_eq!(source.canonical_table("dob_permits"), "dob_permits");
        assert!(!source.partition_by_month);
        assert_eq!(config.page_size_for(source), 1000);
    }

    #[test]
    fn unknown_source_names_configured_ones() {
        let config = parse_config(MINIMAL).unwrap();
        let err = config.source("pluto").unwrap_err().to_string();
        assert!(err.contains("dob_permits"));
    }

    #[test]
    fn rejects_unsafe_table_names() {
        let text = format!("{}canonical_table = \"permits; DROP TABLE x\"\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(format!("{:#}", err).contains("unsafe SQL identifier"));
    }

    #[test]
    fn rejects_oversized_page() {
        let text = MINIMAL.replace(
            "[sources.dob_permits]",
            "[harvest]\npage_size = 60000\n\n[sources.dob_permits]",
        );
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn rejects_out_of_range_days_back() {
        let global = MINIMAL.replace(
            "[sources.dob_permits]",
            "[harvest]\ndays_back = 4000000000\n\n[sources.dob_permits]",
        );
        let err = parse_config(&global).unwrap_err().to_string();
        assert!(err.contains("harvest.days_back"), "{err}");

        let per_source = format!("{}days_back = 0\n", MINIMAL);
        let err = parse_config(&per_source).unwrap_err().to_string();
        assert!(err.contains("sources.dob_permits.days_back"), "{err}");

        let widest = format!("{}days_back = {}\n", MINIMAL, MAX_DAYS_BACK);
        assert!(parse_config(&widest).is_ok());
    }

    #[test]
    fn source_overrides_win() {
        let text = format!(
            "{}page_size = 50\ndays_back = 30\npreferred_date_fields = [\"date_entered\"]\n",
            MINIMAL
        );
        let config = parse_config(&text).unwrap();
        let source = config.source("dob_permits").unwrap();
        assert_eq!(config.page_size_for(source), 50);
        assert_eq!(config.days_back_for(source), 30);
        assert_eq!(config.preferred_fields_for(source), ["date_entered".to_string()]);
    }
}
