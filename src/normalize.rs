//! Dataset-specific row normalization.
//!
//! A [`RowNormalizer`] maps one raw source row to a [`NormalizedRow`]: the
//! natural key used for staging and merge, the parcel key consumers join on,
//! and a flat map of cleaned fields.
//!
//! Strategies are registered in a [`NormalizerRegistry`] by kind and resolved
//! once when a harvester is built, so nothing looks a strategy up by name
//! inside the page loop.
//!
//! | Kind | Natural key | Parcel key |
//! |------|-------------|------------|
//! | `dob_permits` | job number | `bbl`, else borough/block/lot |
//! | `dob_complaints` | complaint number, else `:id` | `bbl`, else borough/block/lot |
//! | `pluto` | parcel key | `bbl`, else borough/block/lot |
//! | `generic` | none (content hash) | canonical `bbl`/borough/block/lot headers |
//!
//! Normalizers never fail: malformed values become absent fields.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::client::RawRow;
use crate::error::{HarvestError, Result};
use crate::identity::{
    canonicalize_header, clean_parcel_key, normalize_address, normalize_borough, parcel_key,
    split_address, value_text, NormalizedAddress,
};
use crate::window::parse_timestamp;

/// Canonical form of one source row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRow {
    pub natural_key: Option<String>,
    pub parcel_key: Option<String>,
    pub fields: Map<String, Value>,
}

/// Strategy mapping raw rows of one dataset kind to canonical rows.
pub trait RowNormalizer: Send + Sync {
    /// Registry key, e.g. `"dob_permits"`.
    fn kind(&self) -> &str;

    /// One-line description for `harvest sources`.
    fn description(&self) -> &str;

    fn normalize(&self, row: &RawRow) -> NormalizedRow;
}

/// Strategies keyed by kind.
pub struct NormalizerRegistry {
    strategies: BTreeMap<String, Arc<dyn RowNormalizer>>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    /// Registry with every built-in strategy.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DobPermits));
        registry.register(Arc::new(DobComplaints));
        registry.register(Arc::new(Pluto));
        registry.register(Arc::new(Generic));
        registry
    }

    /// Register a strategy, replacing any previous one of the same kind.
    pub fn register(&mut self, normalizer: Arc<dyn RowNormalizer>) {
        self.strategies
            .insert(normalizer.kind().to_string(), normalizer);
    }

    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn RowNormalizer>> {
        self.strategies
            .get(kind)
            .cloned()
            .ok_or_else(|| HarvestError::UnknownNormalizer(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }
}

impl Default for NormalizerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

// ─── Field helpers ───────────────────────────────────────────────────────

/// Value of `key`, matched exactly first, then case-insensitively.
fn raw<'a>(row: &'a RawRow, key: &str) -> Option<&'a Value> {
    row.get(key).or_else(|| {
        row.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

/// First non-empty text among `keys`.
fn first_text(row: &RawRow, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| raw(row, key).and_then(value_text))
}

fn first_date(row: &RawRow, keys: &[&str]) -> Option<String> {
    first_text(row, keys)
        .and_then(|text| parse_timestamp(&text))
        .map(|ts| ts.format("%Y-%m-%d").to_string())
}

fn first_number(row: &RawRow, keys: &[&str]) -> Option<f64> {
    first_text(row, keys).and_then(|text| {
        let cleaned: String = text.chars().filter(|c| *c != '$' && *c != ',').collect();
        cleaned.trim().parse::<f64>().ok().filter(|n| n.is_finite())
    })
}

fn first_int(row: &RawRow, keys: &[&str]) -> Option<i64> {
    first_number(row, keys)
        .filter(|n| n.abs() < 9.0e15)
        .map(|n| n.trunc() as i64)
}

fn put_text(fields: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), Value::String(value));
    }
}

fn put_number(fields: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(number) = value.and_then(Number::from_f64) {
        fields.insert(key.to_string(), Value::Number(number));
    }
}

fn put_int(fields: &mut Map<String, Value>, key: &str, value: Option<i64>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), Value::Number(value.into()));
    }
}

fn put_address(fields: &mut Map<String, Value>, address: &NormalizedAddress) {
    put_text(fields, "house_number", address.house_number.clone());
    put_text(fields, "street", address.street.clone());
    put_text(fields, "address", address.full.clone());
}

/// Parcel key from an explicit BBL column, else from borough/block/lot.
fn resolve_parcel(
    row: &RawRow,
    bbl_keys: &[&str],
    borough_keys: &[&str],
    block_keys: &[&str],
    lot_keys: &[&str],
) -> Option<String> {
    if let Some(key) = first_text(row, bbl_keys).and_then(|bbl| clean_parcel_key(&bbl)) {
        return Some(key);
    }
    let borough = first_text(row, borough_keys);
    let block = first_text(row, block_keys);
    let lot = first_text(row, lot_keys);
    parcel_key(borough.as_deref(), block.as_deref(), lot.as_deref())
}

/// Address from separate house/street columns, falling back to splitting a
/// free-text address column.
fn resolve_address(
    row: &RawRow,
    house_keys: &[&str],
    street_keys: &[&str],
    address_keys: &[&str],
) -> NormalizedAddress {
    let mut house = first_text(row, house_keys);
    let mut street = first_text(row, street_keys);
    if house.is_none() || street.is_none() {
        if let Some(text) = first_text(row, address_keys) {
            let (split_house, split_street) = split_address(&text);
            house = house.or(split_house);
            street = street.or(split_street);
        }
    }
    normalize_address(house.as_deref(), street.as_deref())
}

fn borough_name(row: &RawRow, keys: &[&str], parcel: Option<&str>) -> Option<String> {
    first_text(row, keys)
        .and_then(|token| normalize_borough(&token))
        .or_else(|| parcel.and_then(|key| normalize_borough(&key[..1])))
        .map(|borough| borough.name().to_string())
}

const BOROUGH_KEYS: &[&str] = &["borough", "boro", "borocode", "borough_code"];

// ─── Strategies ──────────────────────────────────────────────────────────

/// DOB permit issuance and job filings.
pub struct DobPermits;

impl RowNormalizer for DobPermits {
    fn kind(&self) -> &str {
        "dob_permits"
    }

    fn description(&self) -> &str {
        "DOB permits keyed by job number"
    }

    fn normalize(&self, row: &RawRow) -> NormalizedRow {
        let natural_key = first_text(row, &["job_number", "job__", "job", "job_no", "jobnum", "job#"]);
        let parcel = resolve_parcel(
            row,
            &["bbl", "bbl_number"],
            BOROUGH_KEYS,
            &["block"],
            &["lot"],
        );
        let address = resolve_address(
            row,
            &["house__", "house_no", "house__no", "house_number"],
            &["street_name", "streetname", "street"],
            &["address"],
        );

        let mut fields = Map::new();
        put_text(&mut fields, "job_number", natural_key.clone());
        put_address(&mut fields, &address);
        put_text(&mut fields, "borough", borough_name(row, BOROUGH_KEYS, parcel.as_deref()));
        put_text(&mut fields, "job_type", first_text(row, &["job_type", "jobtype"]));
        put_text(&mut fields, "work_type", first_text(row, &["work_type"]));
        put_text(
            &mut fields,
            "status",
            first_text(row, &["current_status", "permit_status", "status"]),
        );
        put_text(
            &mut fields,
            "filing_date",
            first_date(row, &["filing_date", "filed_date", "date"]),
        );
        put_text(
            &mut fields,
            "issuance_date",
            first_date(row, &["issuance_date", "issued_date"]),
        );
        put_text(
            &mut fields,
            "latest_status_date",
            first_date(row, &["latest_status_date", "status_date"]),
        );
        put_text(
            &mut fields,
            "description",
            first_text(row, &["job_description", "description"]),
        );
        put_number(
            &mut fields,
            "estimated_cost",
            first_number(row, &["estimated_cost", "initial_cost"]),
        );

        NormalizedRow {
            natural_key,
            parcel_key: parcel,
            fields,
        }
    }
}

/// DOB complaints received.
pub struct DobComplaints;

impl RowNormalizer for DobComplaints {
    fn kind(&self) -> &str {
        "dob_complaints"
    }

    fn description(&self) -> &str {
        "DOB complaints keyed by complaint number"
    }

    fn normalize(&self, row: &RawRow) -> NormalizedRow {
        let natural_key = first_text(
            row,
            &[
                "complaint_id",
                "complaintid",
                "complaint_number",
                "complaintnumber",
                "complaintno",
                "complaintnum",
                "complaint",
                ":id",
            ],
        );
        let parcel = resolve_parcel(
            row,
            &["bbl", "bbl_number"],
            BOROUGH_KEYS,
            &["block", "block_number"],
            &["lot", "lot_number"],
        );
        let address = resolve_address(
            row,
            &["house_number", "house__", "housenumber"],
            &["street", "street_name", "streetname"],
            &["address"],
        );

        let mut fields = Map::new();
        put_text(&mut fields, "complaint_id", natural_key.clone());
        put_text(&mut fields, "bin", first_text(row, &["bin", "bin_number"]));
        put_address(&mut fields, &address);
        put_text(&mut fields, "borough", borough_name(row, BOROUGH_KEYS, parcel.as_deref()));
        put_text(&mut fields, "zipcode", first_text(row, &["zip", "zip_code", "zipcode"]));
        put_text(
            &mut fields,
            "category",
            first_text(row, &["complaint_category", "category"]),
        );
        put_text(&mut fields, "type", first_text(row, &["complaint_type", "type"]));
        put_text(
            &mut fields,
            "status",
            first_text(row, &["status", "status_description"]),
        );
        put_text(&mut fields, "priority", first_text(row, &["priority"]));
        put_text(&mut fields, "disposition", first_text(row, &["disposition"]));
        put_text(
            &mut fields,
            "date_received",
            first_date(row, &["date_received", "date_entered", "date"]),
        );
        put_text(
            &mut fields,
            "inspection_date",
            first_date(row, &["inspection_date", "last_inspection_date"]),
        );
        put_number(&mut fields, "latitude", first_number(row, &["latitude", "lat"]));
        put_number(&mut fields, "longitude", first_number(row, &["longitude", "long", "lng"]));

        NormalizedRow {
            natural_key,
            parcel_key: parcel,
            fields,
        }
    }
}

/// PLUTO tax-lot attributes, one row per parcel.
pub struct Pluto;

impl RowNormalizer for Pluto {
    fn kind(&self) -> &str {
        "pluto"
    }

    fn description(&self) -> &str {
        "PLUTO tax lots keyed by parcel key"
    }

    fn normalize(&self, row: &RawRow) -> NormalizedRow {
        let parcel = resolve_parcel(
            row,
            &["bbl"],
            BOROUGH_KEYS,
            &["block", "block_", "block_num"],
            &["lot", "lot_", "lot_num"],
        );
        let address = resolve_address(
            row,
            &["house", "housenum", "houseno", "addressnumber"],
            &["street", "street_name", "streetname", "stname"],
            &["address"],
        );

        let mut fields = Map::new();
        put_text(&mut fields, "bbl", parcel.clone());
        put_text(&mut fields, "borough", borough_name(row, BOROUGH_KEYS, parcel.as_deref()));
        put_int(&mut fields, "block", first_int(row, &["block", "block_", "block_num"]));
        put_int(&mut fields, "lot", first_int(row, &["lot", "lot_", "lot_num"]));
        put_address(&mut fields, &address);
        put_text(&mut fields, "zipcode", first_text(row, &["zipcode", "zip"]));
        put_text(&mut fields, "landuse", first_text(row, &["landuse", "land_use"]));
        put_text(
            &mut fields,
            "zoning",
            first_text(row, &["zoning", "zonedist1", "zoneddist1", "zonedistrict1"]),
        );
        put_number(&mut fields, "lot_area", first_number(row, &["lot_area", "lotarea"]));
        put_number(&mut fields, "bldg_area", first_number(row, &["bldg_area", "bldgarea"]));
        put_int(&mut fields, "units_res", first_int(row, &["units_res", "unitsres"]));
        put_int(&mut fields, "units_total", first_int(row, &["units_total", "unitstotal"]));
        put_int(&mut fields, "year_built", first_int(row, &["year_built", "yearbuilt"]));
        put_number(&mut fields, "latitude", first_number(row, &["latitude", "lat"]));
        put_number(&mut fields, "longitude", first_number(row, &["longitude", "lon", "lng"]));

        NormalizedRow {
            natural_key: parcel.clone(),
            parcel_key: parcel,
            fields,
        }
    }
}

/// Any dataset: canonical headers, best-effort parcel and address, no
/// natural key.
pub struct Generic;

impl RowNormalizer for Generic {
    fn kind(&self) -> &str {
        "generic"
    }

    fn description(&self) -> &str {
        "Canonicalized headers, keyed by content hash"
    }

    fn normalize(&self, row: &RawRow) -> NormalizedRow {
        let mut canonical = RawRow::new();
        for (header, value) in row {
            if header.starts_with(':') {
                continue;
            }
            let key = canonicalize_header(header);
            if key.is_empty() || canonical.contains_key(&key) {
                continue;
            }
            if let Some(text) = value_text(value) {
                canonical.insert(key, Value::String(text));
            }
        }

        let parcel = resolve_parcel(&canonical, &["bbl"], &["borough"], &["block"], &["lot"]);
        let address = resolve_address(&canonical, &["houseno"], &["street"], &["address"]);

        let mut fields = canonical;
        if address.full.is_some() {
            put_address(&mut fields, &address);
        }

        NormalizedRow {
            natural_key: None,
            parcel_key: parcel,
            fields,
        }
    }
}
