//! Equipment model

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use validator::Validate;

use super::fields::{self, NO_LINKED_EQUIPMENT};

/// Every versioned attribute of an equipment.
///
/// The live row and each history snapshot carry exactly this set; two states are
/// "the same version" when their normalized field sets are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct EquipmentFields {
    pub code: String,
    pub name: String,
    pub equipment_type: String,
    pub location: String,
    pub validity_date: Option<NaiveDate>,
    /// Assigned field operator (sampler)
    pub operator_id: Option<i32>,
    pub enabled: bool,
    /// Code prefix, e.g. `BAL`
    pub prefix: String,
    pub sequence_number: i32,
    pub has_field_sheet: bool,
    /// Tolerance thresholds
    pub error_0: Decimal,
    pub error_15: Decimal,
    pub error_30: Decimal,
    /// Linked equipment code, `"0"` when not applicable
    pub linked_equipment: String,
    pub notes: String,
    pub visible_to_sampler: bool,
    /// Measurement descriptors
    pub measures: String,
    pub unit_name: String,
    pub unit_symbol: String,
    pub include_in_report: bool,
}

/// Decimal places kept by the `NUMERIC(10,1)` tolerance columns
const TOLERANCE_SCALE: u32 = 1;

/// Round like PostgreSQL does when storing into the tolerance columns
fn stored_tolerance(value: Decimal) -> Decimal {
    value
        .round_dp_with_strategy(TOLERANCE_SCALE, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

impl EquipmentFields {
    /// Empty field set used as the base for new equipment
    pub fn blank() -> Self {
        Self {
            code: String::new(),
            name: String::new(),
            equipment_type: String::new(),
            location: String::new(),
            validity_date: None,
            operator_id: None,
            enabled: true,
            prefix: String::new(),
            sequence_number: 0,
            has_field_sheet: false,
            error_0: Decimal::ZERO,
            error_15: Decimal::ZERO,
            error_30: Decimal::ZERO,
            linked_equipment: NO_LINKED_EQUIPMENT.to_string(),
            notes: String::new(),
            visible_to_sampler: false,
            measures: String::new(),
            unit_name: String::new(),
            unit_symbol: String::new(),
            include_in_report: false,
        }
    }

    /// Canonical form: operator `0` is no operator, tolerances are rounded to
    /// the stored scale without trailing zeros, every "no link" spelling becomes
    /// the sentinel.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        out.operator_id = self.operator_id.filter(|id| *id != 0);
        out.error_0 = stored_tolerance(self.error_0);
        out.error_15 = stored_tolerance(self.error_15);
        out.error_30 = stored_tolerance(self.error_30);
        out.linked_equipment = fields::normalize_linked_equipment(Some(&self.linked_equipment));
        out
    }

    /// Type-aware equality used by snapshot matching
    pub fn same_state(&self, other: &EquipmentFields) -> bool {
        self.normalized() == other.normalized()
    }

    /// SHA-256 of the normalized field set, hex encoded
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(&self.normalized()).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Append a line to the free-text notes
    pub fn append_note(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if self.notes.trim().is_empty() {
            self.notes = line.to_string();
        } else {
            self.notes = format!("{}\n{}", self.notes.trim_end(), line);
        }
    }
}

/// Live equipment record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Equipment {
    pub id: i32,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub fields: EquipmentFields,
    /// Current version label (`v1`, `v2`, ...)
    pub version: String,
    /// Optimistic concurrency token, bumped on every live write
    pub revision: i64,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of a past equipment state
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EquipmentHistoryEntry {
    pub id: i32,
    pub equipment_id: i32,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub fields: EquipmentFields,
    pub version: String,
    pub changed_by: Option<i32>,
    pub changed_at: DateTime<Utc>,
}

/// Partial field set; absent fields keep their live value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(
        default,
        deserialize_with = "fields::option_date::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub validity_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<i32>,
    #[serde(
        default,
        deserialize_with = "fields::option_flag::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i32>,
    #[serde(
        default,
        deserialize_with = "fields::option_flag::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub has_field_sheet: Option<bool>,
    #[serde(
        default,
        deserialize_with = "fields::option_decimal::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_0: Option<Decimal>,
    #[serde(
        default,
        deserialize_with = "fields::option_decimal::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_15: Option<Decimal>,
    #[serde(
        default,
        deserialize_with = "fields::option_decimal::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_30: Option<Decimal>,
    #[serde(
        default,
        deserialize_with = "fields::option_linked::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub linked_equipment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(
        default,
        deserialize_with = "fields::option_flag::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub visible_to_sampler: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measures: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_symbol: Option<String>,
    #[serde(
        default,
        deserialize_with = "fields::option_flag::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub include_in_report: Option<bool>,
}

impl EquipmentPatch {
    /// Merge the patch over `base`, producing the candidate state
    pub fn apply(&self, base: &EquipmentFields) -> EquipmentFields {
        let mut next = base.clone();

        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(ref value) = self.$field {
                        next.$field = value.clone();
                    }
                )*
            };
        }

        merge!(
            code,
            name,
            equipment_type,
            location,
            prefix,
            sequence_number,
            error_0,
            error_15,
            error_30,
            linked_equipment,
            notes,
            measures,
            unit_name,
            unit_symbol,
        );

        macro_rules! merge_flag {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = self.$field {
                        next.$field = value;
                    }
                )*
            };
        }

        merge_flag!(enabled, has_field_sheet, visible_to_sampler, include_in_report);

        if self.validity_date.is_some() {
            next.validity_date = self.validity_date;
        }
        if let Some(operator_id) = self.operator_id {
            next.operator_id = Some(operator_id);
        }

        next.normalized()
    }
}

/// Direct creation request (admin path and approved NEW_EQUIPMENT requests)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewEquipment {
    #[validate(length(min = 1, message = "Equipment code is required"))]
    pub code: String,
    #[validate(length(min = 1, message = "Equipment name is required"))]
    pub name: String,
    #[validate(length(min = 1, message = "Equipment type is required"))]
    pub equipment_type: String,
    #[validate(length(min = 1, message = "Location is required"))]
    pub location: String,
    /// Remaining attributes
    #[serde(flatten)]
    pub details: EquipmentPatch,
}

impl NewEquipment {
    pub fn to_fields(&self) -> EquipmentFields {
        let mut fields = self.details.apply(&EquipmentFields::blank());
        fields.code = self.code.clone();
        fields.name = self.name.clone();
        fields.equipment_type = self.equipment_type.clone();
        fields.location = self.location.clone();
        fields.normalized()
    }
}

/// Equipment list filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EquipmentQuery {
    /// Free text over code, name, type and location
    pub search: Option<String>,
    pub equipment_type: Option<String>,
    pub location: Option<String>,
    pub enabled: Option<bool>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

/// Distinct values available to list filters
#[derive(Debug, Clone, Default, Serialize)]
pub struct EquipmentCatalogs {
    pub types: Vec<String>,
    pub locations: Vec<String>,
    pub names: Vec<String>,
}

/// One page of equipment
#[derive(Debug, Clone, Serialize)]
pub struct EquipmentPage {
    pub items: Vec<Equipment>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub catalogs: EquipmentCatalogs,
}

/// Proposed code for a new equipment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeSuggestion {
    pub prefix: String,
    pub sequence_number: i32,
    pub suggested_code: String,
}

/// Result of a versioned write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevisionOutcome {
    pub equipment_id: i32,
    pub previous_version: String,
    pub version: String,
}
