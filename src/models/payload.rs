//! Typed change-request payloads
//!
//! One variant per request type. DECOMMISSION and reactivation requests carry a
//! list of independently tracked items; every other type targets a single
//! equipment.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use validator::Validate;

use super::change_request::{ItemAction, RequestType};
use super::equipment::NewEquipment;
use super::fields;
use crate::error::{AppError, AppResult};

/// One target equipment inside a list-shaped payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEntry {
    pub equipment_id: i32,
    /// Equipment code, kept for display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rejected: bool,
    /// New validity date (reactivation only)
    #[serde(
        default,
        deserialize_with = "fields::option_date::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub validity_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ItemEntry {
    pub fn new(equipment_id: i32) -> Self {
        Self {
            equipment_id,
            code: None,
            processed: false,
            rejected: false,
            validity_date: None,
            note: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct DecommissionPayload {
    #[validate(length(min = 1, message = "At least one equipment is required"))]
    pub items: Vec<ItemEntry>,
    #[validate(length(min = 1, message = "A decommission reason is required"))]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReactivationPayload {
    #[validate(length(min = 1, message = "At least one equipment is required"))]
    pub items: Vec<ItemEntry>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FreshEquipmentPayload {
    #[validate(nested)]
    pub equipment: NewEquipment,
    #[serde(default)]
    pub reason: Option<String>,
}

/// CREATE_OR_REACTIVATE either registers a new equipment or re-enables a list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ActivationPayload {
    Fresh(FreshEquipmentPayload),
    Reactivation(ReactivationPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransferPayload {
    pub equipment_id: i32,
    #[serde(default)]
    pub new_location: Option<String>,
    #[serde(default)]
    pub new_operator_id: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProblemReportPayload {
    pub equipment_id: i32,
    #[validate(length(min = 1, message = "A problem description is required"))]
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReviewPayload {
    pub equipment_id: i32,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ValidityExtensionPayload {
    pub equipment_id: i32,
    #[serde(deserialize_with = "required_date")]
    pub new_validity_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LostPayload {
    pub equipment_id: i32,
    #[validate(length(min = 1, message = "Loss circumstances are required"))]
    pub circumstances: String,
    #[serde(default, deserialize_with = "fields::option_date::deserialize")]
    pub lost_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DisablePayload {
    pub equipment_id: i32,
    #[validate(length(min = 1, message = "A reason is required"))]
    pub reason: String,
    #[serde(default, deserialize_with = "fields::option_date::deserialize")]
    pub validity_date: Option<NaiveDate>,
}

fn required_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: serde::Deserializer<'de>,
{
    fields::option_date::deserialize(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("a date is required"))
}

/// Payload of a change request, keyed by request type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPayload {
    CreateOrReactivate(ActivationPayload),
    Decommission(DecommissionPayload),
    Transfer(TransferPayload),
    ProblemReport(ProblemReportPayload),
    Review(ReviewPayload),
    ValidityExtension(ValidityExtensionPayload),
    Lost(LostPayload),
    Disable(DisablePayload),
    NewEquipment(FreshEquipmentPayload),
}

impl RequestPayload {
    pub fn request_type(&self) -> RequestType {
        match self {
            RequestPayload::CreateOrReactivate(_) => RequestType::CreateOrReactivate,
            RequestPayload::Decommission(_) => RequestType::Decommission,
            RequestPayload::Transfer(_) => RequestType::Transfer,
            RequestPayload::ProblemReport(_) => RequestType::ProblemReport,
            RequestPayload::Review(_) => RequestType::Review,
            RequestPayload::ValidityExtension(_) => RequestType::ValidityExtension,
            RequestPayload::Lost(_) => RequestType::Lost,
            RequestPayload::Disable(_) => RequestType::Disable,
            RequestPayload::NewEquipment(_) => RequestType::NewEquipment,
        }
    }

    /// Item list of list-shaped payloads
    pub fn items(&self) -> Option<&[ItemEntry]> {
        match self {
            RequestPayload::Decommission(p) => Some(&p.items),
            RequestPayload::CreateOrReactivate(ActivationPayload::Reactivation(p)) => {
                Some(&p.items)
            }
            _ => None,
        }
    }

    pub fn items_mut(&mut self) -> Option<&mut Vec<ItemEntry>> {
        match self {
            RequestPayload::Decommission(p) => Some(&mut p.items),
            RequestPayload::CreateOrReactivate(ActivationPayload::Reactivation(p)) => {
                Some(&mut p.items)
            }
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        self.items().is_some()
    }

    /// Every equipment id the payload refers to (none for fresh creation)
    pub fn target_equipment_ids(&self) -> Vec<i32> {
        if let Some(items) = self.items() {
            return items.iter().map(|item| item.equipment_id).collect();
        }
        match self {
            RequestPayload::Transfer(p) => vec![p.equipment_id],
            RequestPayload::ProblemReport(p) => vec![p.equipment_id],
            RequestPayload::Review(p) => vec![p.equipment_id],
            RequestPayload::ValidityExtension(p) => vec![p.equipment_id],
            RequestPayload::Lost(p) => vec![p.equipment_id],
            RequestPayload::Disable(p) => vec![p.equipment_id],
            _ => Vec::new(),
        }
    }

    /// `true` once every list entry is processed; single payloads never are
    pub fn all_processed(&self) -> bool {
        self.items()
            .map(|items| items.iter().all(|item| item.processed))
            .unwrap_or(false)
    }

    /// Entries still awaiting a decision
    pub fn pending_items(&self) -> Vec<i32> {
        self.items()
            .map(|items| {
                items
                    .iter()
                    .filter(|item| !item.processed)
                    .map(|item| item.equipment_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether at least one processed entry was approved
    pub fn any_item_approved(&self) -> bool {
        self.items()
            .map(|items| items.iter().any(|item| item.processed && !item.rejected))
            .unwrap_or(false)
    }

    /// Structural validation performed on submission and on revisions
    pub fn validate(&self) -> AppResult<()> {
        let result = match self {
            RequestPayload::CreateOrReactivate(ActivationPayload::Fresh(p)) => p.validate(),
            RequestPayload::CreateOrReactivate(ActivationPayload::Reactivation(p)) => p.validate(),
            RequestPayload::Decommission(p) => p.validate(),
            RequestPayload::Transfer(p) => p.validate(),
            RequestPayload::ProblemReport(p) => p.validate(),
            RequestPayload::Review(p) => p.validate(),
            RequestPayload::ValidityExtension(p) => p.validate(),
            RequestPayload::Lost(p) => p.validate(),
            RequestPayload::Disable(p) => p.validate(),
            RequestPayload::NewEquipment(p) => p.validate(),
        };
        result.map_err(|e| AppError::Validation(e.to_string()))?;

        if let RequestPayload::Transfer(p) = self {
            let location_blank = p.new_location.as_deref().map_or(true, |l| l.trim().is_empty());
            if location_blank && p.new_operator_id.is_none() {
                return Err(AppError::Validation(
                    "A transfer needs a new location or a new operator".to_string(),
                ));
            }
        }

        if let Some(items) = self.items() {
            let mut seen = HashSet::new();
            for item in items {
                if !seen.insert(item.equipment_id) {
                    return Err(AppError::Validation(format!(
                        "Equipment {} is listed more than once",
                        item.equipment_id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Record a decision on one list entry.
    ///
    /// Fails with `NotFound` when the equipment is not part of the list and with
    /// `InvalidTransition` when the entry was already processed.
    pub fn mark_item(&mut self, equipment_id: i32, action: ItemAction) -> AppResult<&ItemEntry> {
        let items = self.items_mut().ok_or_else(|| {
            AppError::Validation("This request does not carry an item list".to_string())
        })?;

        let item = items
            .iter_mut()
            .find(|item| item.equipment_id == equipment_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Equipment {} is not part of this request", equipment_id))
            })?;

        if item.processed {
            return Err(AppError::InvalidTransition(format!(
                "Equipment {} was already processed",
                equipment_id
            )));
        }

        item.processed = true;
        item.rejected = action == ItemAction::Reject;
        Ok(item)
    }

    /// Validation for a new submission: structure, and no entry decided yet
    pub fn validate_submission(&self) -> AppResult<()> {
        self.validate()?;
        if let Some(item) = self
            .items()
            .and_then(|items| items.iter().find(|item| item.processed || item.rejected))
        {
            return Err(AppError::Validation(format!(
                "Equipment {} cannot be submitted as already processed",
                item.equipment_id
            )));
        }
        Ok(())
    }

    /// Forget every decision carried by the entries
    fn clear_progress(&mut self) {
        if let Some(items) = self.items_mut() {
            for item in items.iter_mut() {
                item.processed = false;
                item.rejected = false;
            }
        }
    }

    /// Replace this payload with a reviewer's revision.
    ///
    /// The revision must keep the request type. Decisions come only from this
    /// payload: flags sent in the revision are ignored, and entries already
    /// processed keep their recorded decision even if the revision omits them.
    pub fn revise(&self, mut revised: RequestPayload) -> AppResult<RequestPayload> {
        if revised.request_type() != self.request_type() {
            return Err(AppError::Validation(format!(
                "Revised payload is {} but the request is {}",
                revised.request_type(),
                self.request_type()
            )));
        }
        revised.validate()?;
        revised.clear_progress();

        if let (Some(current), Some(next)) = (self.items(), revised.items_mut()) {
            for done in current.iter().filter(|item| item.processed) {
                match next.iter_mut().find(|item| item.equipment_id == done.equipment_id) {
                    Some(item) => {
                        item.processed = true;
                        item.rejected = done.rejected;
                    }
                    None => next.push(done.clone()),
                }
            }
        }

        Ok(revised)
    }
}
