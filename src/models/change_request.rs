//! Change request model and workflow enums

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use super::payload::RequestPayload;
use crate::error::AppError;

// ---------------------------------------------------------------------------
// RequestType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    CreateOrReactivate,
    Decommission,
    Transfer,
    ProblemReport,
    Review,
    ValidityExtension,
    Lost,
    Disable,
    NewEquipment,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::CreateOrReactivate => "CREATE_OR_REACTIVATE",
            RequestType::Decommission => "DECOMMISSION",
            RequestType::Transfer => "TRANSFER",
            RequestType::ProblemReport => "PROBLEM_REPORT",
            RequestType::Review => "REVIEW",
            RequestType::ValidityExtension => "VALIDITY_EXTENSION",
            RequestType::Lost => "LOST",
            RequestType::Disable => "DISABLE",
            RequestType::NewEquipment => "NEW_EQUIPMENT",
        }
    }
}

impl FromStr for RequestType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_OR_REACTIVATE" => Ok(RequestType::CreateOrReactivate),
            "DECOMMISSION" => Ok(RequestType::Decommission),
            "TRANSFER" => Ok(RequestType::Transfer),
            "PROBLEM_REPORT" => Ok(RequestType::ProblemReport),
            "REVIEW" => Ok(RequestType::Review),
            "VALIDITY_EXTENSION" => Ok(RequestType::ValidityExtension),
            "LOST" => Ok(RequestType::Lost),
            "DISABLE" => Ok(RequestType::Disable),
            "NEW_EQUIPMENT" => Ok(RequestType::NewEquipment),
            other => Err(AppError::Validation(format!("Unknown request type '{}'", other))),
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Who authored a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    FieldSampler,
    TechnicalStaff,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::FieldSampler => "FIELD_SAMPLER",
            Origin::TechnicalStaff => "TECHNICAL_STAFF",
        }
    }
}

impl FromStr for Origin {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FIELD_SAMPLER" => Ok(Origin::FieldSampler),
            "TECHNICAL_STAFF" => Ok(Origin::TechnicalStaff),
            other => Err(AppError::Validation(format!("Unknown request origin '{}'", other))),
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RequestState
// ---------------------------------------------------------------------------

/// Workflow state of a change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    PendingTechnical,
    InTechnicalReview,
    PendingQuality,
    RejectedTechnical,
    Approved,
    Rejected,
    /// Approved by quality, execution handed back to technical staff
    DeferredToTechnical,
}

/// Technical sub-status of the legacy two-column representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TechnicalStatus {
    #[serde(rename = "DERIVADO")]
    Derived,
    #[serde(rename = "RECHAZADO")]
    Rejected,
    #[serde(rename = "PENDING")]
    Pending,
}

impl TechnicalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TechnicalStatus::Derived => "DERIVADO",
            TechnicalStatus::Rejected => "RECHAZADO",
            TechnicalStatus::Pending => "PENDING",
        }
    }
}

impl RequestState {
    /// Initial state for a freshly submitted request
    pub fn initial_for(origin: Origin) -> Self {
        match origin {
            Origin::FieldSampler => RequestState::PendingTechnical,
            Origin::TechnicalStaff => RequestState::PendingQuality,
        }
    }

    /// No further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::RejectedTechnical | RequestState::Approved | RequestState::Rejected
        )
    }

    /// Legacy `(status, technical sub-status)` pair shown on older screens
    pub fn legacy_pair(&self) -> (&'static str, Option<TechnicalStatus>) {
        match self {
            RequestState::PendingTechnical => ("PENDING_TECHNICAL", None),
            RequestState::InTechnicalReview => ("EN_REVISION_TECNICA", None),
            RequestState::PendingQuality => ("PENDING_QUALITY", Some(TechnicalStatus::Derived)),
            RequestState::RejectedTechnical => {
                ("REJECTED_TECHNICAL", Some(TechnicalStatus::Rejected))
            }
            RequestState::Approved => ("APPROVED", Some(TechnicalStatus::Derived)),
            RequestState::Rejected => ("REJECTED", Some(TechnicalStatus::Derived)),
            RequestState::DeferredToTechnical => ("APPROVED", Some(TechnicalStatus::Pending)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::PendingTechnical => "PENDING_TECHNICAL",
            RequestState::InTechnicalReview => "IN_TECHNICAL_REVIEW",
            RequestState::PendingQuality => "PENDING_QUALITY",
            RequestState::RejectedTechnical => "REJECTED_TECHNICAL",
            RequestState::Approved => "APPROVED",
            RequestState::Rejected => "REJECTED",
            RequestState::DeferredToTechnical => "DEFERRED_TO_TECHNICAL",
        }
    }
}

impl FromStr for RequestState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_TECHNICAL" => Ok(RequestState::PendingTechnical),
            "IN_TECHNICAL_REVIEW" => Ok(RequestState::InTechnicalReview),
            "PENDING_QUALITY" => Ok(RequestState::PendingQuality),
            "REJECTED_TECHNICAL" => Ok(RequestState::RejectedTechnical),
            "APPROVED" => Ok(RequestState::Approved),
            "REJECTED" => Ok(RequestState::Rejected),
            "DEFERRED_TO_TECHNICAL" => Ok(RequestState::DeferredToTechnical),
            other => Err(AppError::Validation(format!("Unknown request state '{}'", other))),
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TechnicalDecision {
    #[serde(rename = "DERIVADO", alias = "DERIVED")]
    Derived,
    #[serde(rename = "RECHAZADO", alias = "REJECTED")]
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityDecision {
    #[serde(rename = "APROBADO", alias = "APPROVED")]
    Approved,
    #[serde(rename = "RECHAZADO", alias = "REJECTED")]
    Rejected,
    #[serde(rename = "PENDIENTE_TECNICA", alias = "DEFER_TO_TECHNICAL")]
    DeferToTechnical,
}

/// Decision on one entry of a list-shaped payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemAction {
    #[serde(rename = "APROBADO", alias = "APPROVE")]
    Approve,
    #[serde(rename = "RECHAZADO", alias = "REJECT")]
    Reject,
}

// ---------------------------------------------------------------------------
// ChangeRequest
// ---------------------------------------------------------------------------

/// Raw change request row
#[derive(Debug, Clone, FromRow)]
pub struct ChangeRequestRow {
    pub id: i32,
    pub request_type: String,
    pub state: String,
    pub origin: String,
    pub payload: serde_json::Value,
    pub requester_id: i32,
    pub technical_reviewer_id: Option<i32>,
    pub quality_reviewer_id: Option<i32>,
    pub technical_feedback: Option<String>,
    pub quality_feedback: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub technical_reviewed_at: Option<DateTime<Utc>>,
    pub quality_decided_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Change request with typed state and payload
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRequest {
    pub id: i32,
    pub request_type: RequestType,
    pub state: RequestState,
    pub origin: Origin,
    pub payload: RequestPayload,
    pub requester_id: i32,
    pub technical_reviewer_id: Option<i32>,
    pub quality_reviewer_id: Option<i32>,
    pub technical_feedback: Option<String>,
    pub quality_feedback: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub technical_reviewed_at: Option<DateTime<Utc>>,
    pub quality_decided_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ChangeRequestRow> for ChangeRequest {
    type Error = AppError;

    fn try_from(row: ChangeRequestRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            request_type: row.request_type.parse()?,
            state: row.state.parse()?,
            origin: row.origin.parse()?,
            payload: serde_json::from_value(row.payload)?,
            requester_id: row.requester_id,
            technical_reviewer_id: row.technical_reviewer_id,
            quality_reviewer_id: row.quality_reviewer_id,
            technical_feedback: row.technical_feedback,
            quality_feedback: row.quality_feedback,
            submitted_at: row.submitted_at,
            technical_reviewed_at: row.technical_reviewed_at,
            quality_decided_at: row.quality_decided_at,
            updated_at: row.updated_at,
        })
    }
}

/// New request submission
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub request_type: RequestType,
    pub payload: RequestPayload,
    pub requester_id: i32,
    pub origin: Origin,
}

/// Quality review input
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QualityReview {
    pub feedback: Option<String>,
    pub reviewer_id: i32,
    pub revised_payload: Option<RequestPayload>,
    pub target_item_id: Option<i32>,
    pub item_action: Option<ItemAction>,
}

/// Change request list filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestQuery {
    pub state: Option<RequestState>,
    pub request_type: Option<RequestType>,
    pub requester_id: Option<i32>,
    /// Hide requests authored by this user (reviewer inboxes)
    pub exclude_requester_id: Option<i32>,
    pub origin: Option<Origin>,
}
