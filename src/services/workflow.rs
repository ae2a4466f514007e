//! Change request state machine
//!
//! Pure decisions only: which state a transition leads to, which equipment
//! changes an approval implies and which notifications a new state triggers.
//! [`WorkflowService`](super::change_requests::WorkflowService) executes them.

use chrono::NaiveDate;
use serde_json::json;

use super::notifications::{EventCode, Notification};
use crate::{
    error::{AppError, AppResult},
    models::{
        change_request::{ChangeRequest, ItemAction, QualityDecision, RequestState, TechnicalDecision},
        equipment::{EquipmentFields, EquipmentPatch},
        payload::{ActivationPayload, ItemEntry, RequestPayload, Severity},
    },
};

/// A workflow action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Accept,
    Technical(TechnicalDecision),
    Quality(QualityDecision),
    CompleteDeferred,
}

impl Transition {
    fn describe(&self) -> &'static str {
        match self {
            Transition::Accept => "accept for technical review",
            Transition::Technical(TechnicalDecision::Derived) => "forward to quality",
            Transition::Technical(TechnicalDecision::Rejected) => "reject at technical review",
            Transition::Quality(QualityDecision::Approved) => "approve",
            Transition::Quality(QualityDecision::Rejected) => "reject",
            Transition::Quality(QualityDecision::DeferToTechnical) => "defer to technical staff",
            Transition::CompleteDeferred => "complete deferred execution of",
        }
    }
}

/// State reached by applying `transition` in `current`
pub fn next_state(current: RequestState, transition: Transition) -> AppResult<RequestState> {
    use RequestState::*;

    if current.is_terminal() {
        return Err(AppError::InvalidTransition(format!(
            "Cannot {} a request that is already {}",
            transition.describe(),
            current
        )));
    }

    let next = match (current, transition) {
        (PendingTechnical, Transition::Accept) => InTechnicalReview,
        (InTechnicalReview | PendingTechnical, Transition::Technical(TechnicalDecision::Derived)) => {
            PendingQuality
        }
        (InTechnicalReview | PendingTechnical, Transition::Technical(TechnicalDecision::Rejected)) => {
            RejectedTechnical
        }
        (PendingQuality, Transition::Quality(QualityDecision::Approved)) => Approved,
        (PendingQuality, Transition::Quality(QualityDecision::Rejected)) => Rejected,
        (PendingQuality, Transition::Quality(QualityDecision::DeferToTechnical)) => {
            DeferredToTechnical
        }
        (DeferredToTechnical, Transition::CompleteDeferred) => Approved,
        (state, transition) => {
            return Err(AppError::InvalidTransition(format!(
                "Cannot {} a request in state {}",
                transition.describe(),
                state
            )))
        }
    };
    Ok(next)
}

// ---------------------------------------------------------------------------
// Approval effects
// ---------------------------------------------------------------------------

/// Equipment change implied by an approval
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Create(EquipmentFields),
    Revise {
        equipment_id: i32,
        patch: EquipmentPatch,
    },
    Disable {
        equipment_id: i32,
        reason: String,
        validity_date: Option<NaiveDate>,
    },
    Annotate {
        equipment_id: i32,
        note: String,
    },
}

impl Effect {
    pub fn equipment_id(&self) -> Option<i32> {
        match self {
            Effect::Create(_) => None,
            Effect::Revise { equipment_id, .. }
            | Effect::Disable { equipment_id, .. }
            | Effect::Annotate { equipment_id, .. } => Some(*equipment_id),
        }
    }
}

/// Effect of approving one entry of a list-shaped payload
pub fn item_effect(payload: &RequestPayload, item: &ItemEntry) -> AppResult<Effect> {
    match payload {
        RequestPayload::Decommission(p) => Ok(Effect::Disable {
            equipment_id: item.equipment_id,
            reason: format!("Decommissioned: {}", p.reason.trim()),
            validity_date: None,
        }),
        RequestPayload::CreateOrReactivate(ActivationPayload::Reactivation(_)) => {
            let validity_date = item.validity_date.ok_or_else(|| {
                AppError::Validation(format!(
                    "Equipment {} needs a validity date to be reactivated",
                    item.equipment_id
                ))
            })?;
            Ok(Effect::Revise {
                equipment_id: item.equipment_id,
                patch: EquipmentPatch {
                    enabled: Some(true),
                    validity_date: Some(validity_date),
                    ..Default::default()
                },
            })
        }
        _ => Err(AppError::Validation(
            "This request does not carry an item list".to_string(),
        )),
    }
}

/// Effects of approving a single-target payload
pub fn single_effects(payload: &RequestPayload) -> Vec<Effect> {
    match payload {
        RequestPayload::ValidityExtension(p) => vec![Effect::Revise {
            equipment_id: p.equipment_id,
            patch: EquipmentPatch {
                validity_date: Some(p.new_validity_date),
                ..Default::default()
            },
        }],
        RequestPayload::Lost(p) => {
            let reason = match p.lost_on {
                Some(date) => format!("Lost on {}: {}", date, p.circumstances.trim()),
                None => format!("Lost: {}", p.circumstances.trim()),
            };
            vec![Effect::Disable {
                equipment_id: p.equipment_id,
                reason,
                validity_date: None,
            }]
        }
        RequestPayload::Disable(p) => vec![Effect::Disable {
            equipment_id: p.equipment_id,
            reason: p.reason.trim().to_string(),
            validity_date: p.validity_date,
        }],
        RequestPayload::ProblemReport(p) if p.severity == Severity::Critical => {
            vec![Effect::Annotate {
                equipment_id: p.equipment_id,
                note: format!("Critical problem reported: {}", p.description.trim()),
            }]
        }
        RequestPayload::Transfer(p) => vec![Effect::Revise {
            equipment_id: p.equipment_id,
            patch: EquipmentPatch {
                location: p
                    .new_location
                    .as_deref()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
                operator_id: p.new_operator_id,
                ..Default::default()
            },
        }],
        RequestPayload::NewEquipment(p)
        | RequestPayload::CreateOrReactivate(ActivationPayload::Fresh(p)) => {
            vec![Effect::Create(p.equipment.to_fields())]
        }
        _ => Vec::new(),
    }
}

/// Approve everything still open: every pending list entry, or the single target
pub fn approve_all(payload: &mut RequestPayload) -> AppResult<Vec<Effect>> {
    if !payload.is_list() {
        return Ok(single_effects(payload));
    }
    let mut effects = Vec::new();
    for equipment_id in payload.pending_items() {
        let item = payload.mark_item(equipment_id, ItemAction::Approve)?.clone();
        effects.push(item_effect(payload, &item)?);
    }
    Ok(effects)
}

fn reject_all(payload: &mut RequestPayload) -> AppResult<()> {
    for equipment_id in payload.pending_items() {
        payload.mark_item(equipment_id, ItemAction::Reject)?;
    }
    Ok(())
}

/// Result of one quality review call
#[derive(Debug, Clone)]
pub struct QualityOutcome {
    pub state: RequestState,
    pub payload: RequestPayload,
    pub effects: Vec<Effect>,
}

/// Plan a quality review.
///
/// With a target item only that entry is decided, and the item action must
/// agree with the decision. The request leaves `PENDING_QUALITY` once every
/// entry is processed, as APPROVED when at least one entry was approved and
/// REJECTED otherwise. A whole-list rejection follows the same rule.
pub fn plan_quality(
    current: RequestState,
    mut payload: RequestPayload,
    decision: QualityDecision,
    target: Option<(i32, ItemAction)>,
) -> AppResult<QualityOutcome> {
    let state = next_state(current, Transition::Quality(decision))?;

    if let Some((equipment_id, action)) = target {
        match (decision, action) {
            (QualityDecision::Approved, ItemAction::Approve)
            | (QualityDecision::Rejected, ItemAction::Reject) => {}
            (QualityDecision::DeferToTechnical, _) => {
                return Err(AppError::Validation(
                    "A single item cannot be deferred to technical staff".to_string(),
                ))
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "Item action {:?} contradicts the {:?} decision",
                    action, decision
                )))
            }
        }
        let item = payload.mark_item(equipment_id, action)?.clone();
        let effects = match action {
            ItemAction::Approve => vec![item_effect(&payload, &item)?],
            ItemAction::Reject => Vec::new(),
        };
        let state = if payload.all_processed() {
            list_outcome(&payload)
        } else {
            RequestState::PendingQuality
        };
        return Ok(QualityOutcome {
            state,
            payload,
            effects,
        });
    }

    let (state, effects) = match decision {
        QualityDecision::Approved => (state, approve_all(&mut payload)?),
        QualityDecision::Rejected if payload.is_list() => {
            reject_all(&mut payload)?;
            (list_outcome(&payload), Vec::new())
        }
        QualityDecision::Rejected | QualityDecision::DeferToTechnical => (state, Vec::new()),
    };

    Ok(QualityOutcome {
        state,
        payload,
        effects,
    })
}

/// Final state of a fully processed item list: entries approved earlier were
/// already executed, so any approval makes the request APPROVED.
fn list_outcome(payload: &RequestPayload) -> RequestState {
    if payload.any_item_approved() {
        RequestState::Approved
    } else {
        RequestState::Rejected
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

fn context(request: &ChangeRequest) -> serde_json::Value {
    let (legacy_status, technical_status) = request.state.legacy_pair();
    json!({
        "request_id": request.id,
        "request_type": request.request_type,
        "state": request.state,
        "status": legacy_status,
        "technical_status": technical_status,
        "requester_id": request.requester_id,
        "technical_feedback": request.technical_feedback,
        "quality_feedback": request.quality_feedback,
        "equipment_ids": request.payload.target_equipment_ids(),
    })
}

/// Notifications for a freshly submitted request
pub fn submission_notifications(request: &ChangeRequest) -> Vec<Notification> {
    let group = match request.state {
        RequestState::PendingTechnical => EventCode::NewForTechnical,
        _ => EventCode::NewForQuality,
    };
    vec![
        Notification::new(group, context(request)),
        Notification::new(EventCode::Received, context(request)),
    ]
}

/// Notifications for the state a request just entered
pub fn transition_notifications(
    request: &ChangeRequest,
    item: Option<(i32, ItemAction)>,
) -> Vec<Notification> {
    let mut notifications = Vec::new();

    if let Some((equipment_id, action)) = item {
        let mut ctx = context(request);
        ctx["equipment_id"] = json!(equipment_id);
        ctx["item_action"] = json!(action);
        notifications.push(Notification::new(EventCode::ItemProcessed, ctx));
    }

    let event = match request.state {
        RequestState::InTechnicalReview => Some(EventCode::InReview),
        RequestState::PendingQuality if item.is_none() => Some(EventCode::Derived),
        RequestState::RejectedTechnical => Some(EventCode::RejectedTechnical),
        RequestState::Approved => Some(EventCode::Approved),
        RequestState::Rejected => Some(EventCode::Rejected),
        RequestState::DeferredToTechnical => Some(EventCode::PendingTechnical),
        _ => None,
    };
    if let Some(event) = event {
        notifications.push(Notification::new(event, context(request)));
    }

    notifications
}
