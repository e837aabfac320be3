//! Canonical identity keys for property records.
//!
//! Every function here is total: malformed input yields `None`, never a
//! panic or an error, so a single bad row cannot abort a page.
//!
//! # Parcel key
//!
//! The parcel key (BBL) is a fixed-width string of 10 digits:
//!
//! ```text
//! ┌─────────┬─────────────┬──────────┐
//! │ borough │    block    │   lot    │
//! │ 1 digit │  5 digits   │ 4 digits │
//! └─────────┴─────────────┴──────────┘
//! ```
//!
//! A 10-digit value embedded in any of the three inputs takes precedence
//! over recomputing the key from parts.

use serde_json::Value;

/// Width of a parcel key in digits.
pub const PARCEL_KEY_WIDTH: usize = 10;

const MAX_BLOCK: u32 = 99_999;
const MAX_LOT: u32 = 9_999;

/// One of the five boroughs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Borough {
    Manhattan,
    Bronx,
    Brooklyn,
    Queens,
    StatenIsland,
}

impl Borough {
    /// Single-digit borough code used as the first parcel key digit.
    pub fn code(self) -> char {
        match self {
            Borough::Manhattan => '1',
            Borough::Bronx => '2',
            Borough::Brooklyn => '3',
            Borough::Queens => '4',
            Borough::StatenIsland => '5',
        }
    }

    /// Canonical upper-case display name.
    pub fn name(self) -> &'static str {
        match self {
            Borough::Manhattan => "MANHATTAN",
            Borough::Bronx => "BRONX",
            Borough::Brooklyn => "BROOKLYN",
            Borough::Queens => "QUEENS",
            Borough::StatenIsland => "STATEN ISLAND",
        }
    }

    fn from_code(code: char) -> Option<Self> {
        match code {
            '1' => Some(Borough::Manhattan),
            '2' => Some(Borough::Bronx),
            '3' => Some(Borough::Brooklyn),
            '4' => Some(Borough::Queens),
            '5' => Some(Borough::StatenIsland),
            _ => None,
        }
    }
}

const BOROUGH_ALIASES: &[(&str, Borough)] = &[
    ("MANHATTAN", Borough::Manhattan),
    ("MN", Borough::Manhattan),
    ("NEW YORK", Borough::Manhattan),
    ("NEW YORK COUNTY", Borough::Manhattan),
    ("BRONX", Borough::Bronx),
    ("BX", Borough::Bronx),
    ("THE BRONX", Borough::Bronx),
    ("BRONX COUNTY", Borough::Bronx),
    ("BROOKLYN", Borough::Brooklyn),
    ("BK", Borough::Brooklyn),
    ("KINGS", Borough::Brooklyn),
    ("KINGS COUNTY", Borough::Brooklyn),
    ("QUEENS", Borough::Queens),
    ("QN", Borough::Queens),
    ("QNS", Borough::Queens),
    ("QUEENS COUNTY", Borough::Queens),
    ("STATEN ISLAND", Borough::StatenIsland),
    ("SI", Borough::StatenIsland),
    ("RICHMOND", Borough::StatenIsland),
    ("RICHMOND COUNTY", Borough::StatenIsland),
];

/// Header aliases: canonical name followed by the raw spellings mapped to it.
const HEADER_ALIASES: &[(&str, &[&str])] = &[
    ("bbl", &["bbl", "bbl_number"]),
    ("borough", &["borough", "boro", "brgh", "borocode"]),
    ("block", &["block", "block_number", "block_num"]),
    ("lot", &["lot", "lot_number", "lot_num"]),
    ("houseno", &["houseno", "housenum", "house_no", "house", "house_number"]),
    ("street", &["street", "stname", "streetname", "street_name", "st", "sname"]),
    ("zipcode", &["zipcode", "zip", "zip_code"]),
    ("address", &["address", "addr"]),
    ("latitude", &["latitude", "lat"]),
    ("longitude", &["longitude", "lon", "lng", "long"]),
];

/// Normalized house number, street, and their combination.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedAddress {
    pub house_number: Option<String>,
    pub street: Option<String>,
    pub full: Option<String>,
}

fn only_digits(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Map a borough token (code, abbreviation, full name, or county name) to
/// its canonical borough.
///
/// If the token contains digits, the first digit decides when it is a valid
/// code (`"3"`, `"03 "`, `"3.0"`). Otherwise the alias table is consulted.
pub fn normalize_borough(token: &str) -> Option<Borough> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    if let Some(first) = only_digits(token).chars().next() {
        if let Some(borough) = Borough::from_code(first) {
            return Some(borough);
        }
    }

    let upper = collapse_whitespace(&token.to_uppercase());
    BOROUGH_ALIASES
        .iter()
        .find(|(alias, _)| *alias == upper)
        .map(|(_, borough)| *borough)
}

/// Build the 10-digit parcel key from borough, block, and lot.
///
/// Returns `None` for an unknown borough, a non-numeric block or lot, or a
/// block/lot that does not fit its width.
pub fn parcel_key(borough: Option<&str>, block: Option<&str>, lot: Option<&str>) -> Option<String> {
    for candidate in [borough, block, lot].into_iter().flatten() {
        let digits = only_digits(candidate);
        if digits.len() == PARCEL_KEY_WIDTH {
            return Some(digits);
        }
    }

    let borough = normalize_borough(borough?)?;
    let block = parse_strict_digits(block?, MAX_BLOCK)?;
    let lot = parse_strict_digits(lot?, MAX_LOT)?;
    Some(format!("{}{:05}{:04}", borough.code(), block, lot))
}

/// Accept an existing parcel key only when it is exactly 10 digits with a
/// valid borough digit first.
pub fn clean_parcel_key(value: &str) -> Option<String> {
    let digits = only_digits(value);
    if digits.len() != PARCEL_KEY_WIDTH {
        return None;
    }
    let first = digits.chars().next()?;
    Borough::from_code(first).map(|_| digits)
}

fn parse_strict_digits(value: &str, max: u32) -> Option<u32> {
    let value = value.trim();
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let trimmed = value.trim_start_matches('0');
    if trimmed.len() > 9 {
        return None;
    }
    let parsed: u32 = if trimmed.is_empty() {
        0
    } else {
        trimmed.parse().ok()?
    };
    (parsed <= max).then_some(parsed)
}

/// Split free-text address into `(house_number, street)`.
///
/// Splits on the first whitespace run only when the first token is digits,
/// optionally hyphenated (`"41-02"`). Otherwise the whole text is the street.
pub fn split_address(text: &str) -> (Option<String>, Option<String>) {
    let text = text.trim();
    if text.is_empty() {
        return (None, None);
    }
    match text.split_once(char::is_whitespace) {
        Some((first, rest)) if is_house_token(first) => {
            let rest = rest.trim_start();
            let street = (!rest.is_empty()).then(|| rest.to_string());
            (Some(first.to_string()), street)
        }
        _ => (None, Some(text.to_string())),
    }
}

fn is_house_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .split('-')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

/// Normalize a house number: trimmed, upper-cased, leading zeros dropped,
/// Queens-style hyphenation preserved (`"41-2"` becomes `"41-02"`).
pub fn normalize_house_number(value: &str) -> Option<String> {
    let token: String = value
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if token.is_empty() {
        return None;
    }

    if let Some((left, right)) = token.split_once('-') {
        let is_num = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        if is_num(left) && is_num(right) {
            let right = strip_leading_zeros(right);
            return Some(format!("{}-{:0>2}", strip_leading_zeros(left), right));
        }
    }

    let cleaned: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Some(strip_leading_zeros(&cleaned));
    }
    Some(cleaned)
}

fn strip_leading_zeros(digits: &str) -> String {
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Upper-case a street name, turning punctuation into spaces and collapsing
/// whitespace runs.
pub fn normalize_street(value: &str) -> Option<String> {
    let replaced: String = value
        .to_uppercase()
        .chars()
        .map(|c| if is_word_char(c) || c.is_whitespace() { c } else { ' ' })
        .collect();
    let collapsed = collapse_whitespace(&replaced);
    (!collapsed.is_empty()).then_some(collapsed)
}

pub fn normalize_address(house: Option<&str>, street: Option<&str>) -> NormalizedAddress {
    let house_number = house.and_then(normalize_house_number);
    let street = street.and_then(normalize_street);
    let parts: Vec<&str> = [house_number.as_deref(), street.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    let full = (!parts.is_empty()).then(|| parts.join(" "));
    NormalizedAddress {
        house_number,
        street,
        full,
    }
}

/// Canonical token for a raw column header.
///
/// Lower-cases, collapses non-word runs to `_`, trims underscores, then maps
/// known aliases (`"StName"` becomes `"street"`). Unmapped headers pass
/// through as their token.
pub fn canonicalize_header(header: &str) -> String {
    let token = header_token(header);
    for (canonical, aliases) in HEADER_ALIASES {
        if *canonical == token || aliases.iter().any(|a| *a == token) {
            return canonical.to_string();
        }
    }
    token
}

fn header_token(header: &str) -> String {
    let mut token = String::with_capacity(header.len());
    let mut pending_sep = false;
    for c in header.trim().to_lowercase().chars() {
        if is_word_char(c) && c != '_' {
            if pending_sep && !token.is_empty() {
                token.push('_');
            }
            pending_sep = false;
            token.push(c);
        } else {
            pending_sep = true;
        }
    }
    token
}

/// Render a JSON scalar as trimmed text.
///
/// `null`, empty strings and `"N/A"` yield `None`. Integral numbers render
/// without a fractional part. Arrays and objects yield `None`.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("n/a") {
                None
            } else {
                Some(s.to_string())
            }
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(f.to_string())
                }
            } else {
                Some(n.to_string())
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
