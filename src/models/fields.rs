//! Normalization of loosely-typed field input.
//!
//! Intake screens and ticket payloads send flags as `"S"`, `"SI"`, `"Activo"` or
//! booleans, dates as ISO strings or `dd/mm/yyyy`, and numbers as strings.
//! Everything is converted to a canonical typed value at the boundary so that
//! snapshot comparison is plain equality.

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

/// Sentinel stored when an equipment has no linked equipment
pub const NO_LINKED_EQUIPMENT: &str = "0";

/// Parse a yes/no flag in any of the accepted spellings
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_uppercase().as_str() {
        "S" | "SI" | "SÍ" | "Y" | "YES" | "TRUE" | "1" | "ACTIVO" | "ACTIVE" => Some(true),
        "N" | "NO" | "FALSE" | "0" | "" | "INACTIVO" | "INACTIVE" => Some(false),
        _ => None,
    }
}

/// Parse a calendar date: `yyyy-mm-dd`, `dd/mm/yyyy` or an RFC 3339 timestamp
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.contains('/') {
        return NaiveDate::parse_from_str(raw, "%d/%m/%Y").ok();
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
        .or_else(|| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

/// Collapse every "no link" spelling to the stored sentinel
pub fn normalize_linked_equipment(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        None | Some("") => NO_LINKED_EQUIPMENT.to_string(),
        Some(v) if is_not_applicable(v) => NO_LINKED_EQUIPMENT.to_string(),
        Some(v) => v.to_string(),
    }
}

fn is_not_applicable(v: &str) -> bool {
    let lower = v.to_lowercase();
    lower == "no aplica" || lower == "not applicable" || lower == "n/a" || lower == "null"
}

/// Decimal parsing that treats blanks and garbage as zero
pub fn parse_decimal_lenient(raw: &str) -> Decimal {
    Decimal::from_str(raw.trim()).unwrap_or(Decimal::ZERO)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn flag_from_raw<E: serde::de::Error>(raw: RawScalar) -> Result<bool, E> {
    match raw {
        RawScalar::Bool(b) => Ok(b),
        RawScalar::Int(i) => Ok(i != 0),
        RawScalar::Float(f) => Ok(f != 0.0),
        RawScalar::Text(s) => {
            parse_flag(&s).ok_or_else(|| E::custom(format!("invalid flag value '{}'", s)))
        }
    }
}

/// Serde helpers for `Option<bool>` flags
pub mod option_flag {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<RawScalar> = Option::deserialize(deserializer)?;
        raw.map(flag_from_raw).transpose()
    }
}

/// Serde helpers for `Option<NaiveDate>` accepting the usual date spellings
pub mod option_date {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => parse_date(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid date '{}'", s))),
        }
    }
}

/// Serde helpers for `Option<Decimal>` accepting numbers or numeric strings
pub mod option_decimal {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<RawScalar> = Option::deserialize(deserializer)?;
        Ok(raw.map(|raw| match raw {
            RawScalar::Bool(_) => Decimal::ZERO,
            RawScalar::Int(i) => Decimal::from(i),
            RawScalar::Float(f) => Decimal::try_from(f).unwrap_or(Decimal::ZERO),
            RawScalar::Text(s) => parse_decimal_lenient(&s),
        }))
    }
}

/// Serde helpers for the linked-equipment reference (string or number)
pub mod option_linked {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<RawScalar> = Option::deserialize(deserializer)?;
        Ok(Some(match raw {
            None => normalize_linked_equipment(None),
            Some(RawScalar::Int(i)) => normalize_linked_equipment(Some(&i.to_string())),
            Some(RawScalar::Text(s)) => normalize_linked_equipment(Some(&s)),
            Some(_) => normalize_linked_equipment(None),
        }))
    }
}
