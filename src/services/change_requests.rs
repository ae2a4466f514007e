//! Change request workflow service
//!
//! Each operation locks the request row, applies one transition (and, on
//! approval, its equipment changes) in a single transaction, and only after
//! commit hands the resulting notifications to the notifier.

use chrono::Utc;
use sqlx::PgConnection;
use std::{collections::HashSet, sync::Arc};

use super::{
    equipment::EquipmentService,
    notifications::{self, Notification, Notifier},
    workflow::{self, Effect, Transition},
};
use crate::{
    error::{AppError, AppResult},
    models::{
        change_request::{
            ChangeRequest, QualityDecision, QualityReview, RequestQuery, RequestState, RequestType,
            SubmitRequest, TechnicalDecision,
        },
        payload::RequestPayload,
    },
    repository::Repository,
};

#[derive(Clone)]
pub struct WorkflowService {
    repository: Repository,
    equipment: EquipmentService,
    notifier: Arc<dyn Notifier>,
}

impl WorkflowService {
    pub fn new(repository: Repository, equipment: EquipmentService, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            repository,
            equipment,
            notifier,
        }
    }

    /// Get change request by ID
    pub async fn get_by_id(&self, id: i32) -> AppResult<ChangeRequest> {
        self.repository.change_requests.get_by_id(id).await
    }

    /// List change requests, newest first
    pub async fn list(&self, query: &RequestQuery) -> AppResult<Vec<ChangeRequest>> {
        self.repository.change_requests.list(query).await
    }

    /// Record a new request in its origin-dependent initial state
    pub async fn submit(&self, submission: SubmitRequest) -> AppResult<ChangeRequest> {
        let SubmitRequest {
            request_type,
            payload,
            requester_id,
            origin,
        } = submission;

        if payload.request_type() != request_type {
            return Err(AppError::Validation(format!(
                "Payload of type {} submitted as {}",
                payload.request_type(),
                request_type
            )));
        }
        payload.validate_submission()?;

        let mut tx = self.repository.begin().await?;

        if request_type == RequestType::Decommission {
            // Concurrent submissions for the same equipment queue up here
            let targets = payload.target_equipment_ids();
            self.repository.equipment.lock_ids(&mut tx, &targets).await?;

            let open: HashSet<i32> = self
                .repository
                .change_requests
                .open_decommission_targets(&mut tx)
                .await?
                .into_iter()
                .collect();
            if let Some(id) = targets.into_iter().find(|id| open.contains(id)) {
                return Err(AppError::Validation(format!(
                    "Equipment {} already has a decommission request in progress",
                    id
                )));
            }
        }

        let state = RequestState::initial_for(origin);
        let request = self
            .repository
            .change_requests
            .insert(&mut tx, &payload, state, origin, requester_id)
            .await?;
        tx.commit().await?;

        tracing::info!(
            request_id = request.id,
            requester_id,
            "{} request submitted by {} as {}",
            request.request_type,
            request.origin,
            request.state
        );
        self.notify(workflow::submission_notifications(&request));
        Ok(request)
    }

    /// Technical staff start reviewing a pending request
    pub async fn accept_for_technical_review(
        &self,
        id: i32,
        feedback: Option<String>,
    ) -> AppResult<ChangeRequest> {
        let mut tx = self.repository.begin().await?;
        let mut request = self.repository.change_requests.lock_by_id(&mut tx, id).await?;

        request.state = workflow::next_state(request.state, Transition::Accept)?;
        if feedback.is_some() {
            request.technical_feedback = feedback;
        }

        let request = self.repository.change_requests.update(&mut tx, &request).await?;
        tx.commit().await?;

        tracing::info!(request_id = id, "Request accepted for technical review");
        self.notify(workflow::transition_notifications(&request, None));
        Ok(request)
    }

    /// Forward to quality or reject at the technical stage
    pub async fn resolve_technical_review(
        &self,
        id: i32,
        decision: TechnicalDecision,
        feedback: Option<String>,
        reviewer_id: i32,
        revised_payload: Option<RequestPayload>,
    ) -> AppResult<ChangeRequest> {
        let mut tx = self.repository.begin().await?;
        let mut request = self.repository.change_requests.lock_by_id(&mut tx, id).await?;

        request.state = workflow::next_state(request.state, Transition::Technical(decision))?;
        if let Some(revised) = revised_payload {
            request.payload = request.payload.revise(revised)?;
        }
        request.technical_reviewer_id = Some(reviewer_id);
        request.technical_feedback = feedback;
        request.technical_reviewed_at = Some(Utc::now());

        let request = self.repository.change_requests.update(&mut tx, &request).await?;
        tx.commit().await?;

        tracing::info!(
            request_id = id,
            reviewer_id,
            "Technical review resolved: {}",
            request.state
        );
        self.notify(workflow::transition_notifications(&request, None));
        Ok(request)
    }

    /// Quality decision on a whole request or on one entry of its item list.
    ///
    /// Approval effects run in the same transaction; if one fails nothing is
    /// committed and `SideEffect` is returned.
    pub async fn resolve_quality_review(
        &self,
        id: i32,
        decision: QualityDecision,
        review: QualityReview,
    ) -> AppResult<ChangeRequest> {
        let QualityReview {
            feedback,
            reviewer_id,
            revised_payload,
            target_item_id,
            item_action,
        } = review;

        let target = match (target_item_id, item_action) {
            (Some(item_id), Some(action)) => Some((item_id, action)),
            (None, None) => None,
            _ => {
                return Err(AppError::Validation(
                    "An item decision needs both the item and the action".to_string(),
                ))
            }
        };

        let mut tx = self.repository.begin().await?;
        let mut request = self.repository.change_requests.lock_by_id(&mut tx, id).await?;

        let payload = match revised_payload {
            Some(revised) => request.payload.revise(revised)?,
            None => request.payload.clone(),
        };
        let outcome = workflow::plan_quality(request.state, payload, decision, target)?;

        self.apply_effects(&mut tx, id, outcome.effects, reviewer_id).await?;

        request.state = outcome.state;
        request.payload = outcome.payload;
        request.quality_reviewer_id = Some(reviewer_id);
        if feedback.is_some() {
            request.quality_feedback = feedback;
        }
        if request.state != RequestState::PendingQuality {
            request.quality_decided_at = Some(Utc::now());
        }

        let request = self.repository.change_requests.update(&mut tx, &request).await?;
        tx.commit().await?;

        match target {
            Some((item_id, action)) => tracing::info!(
                request_id = id,
                reviewer_id,
                "Item {} resolved ({:?}), request now {}",
                item_id,
                action,
                request.state
            ),
            None => tracing::info!(
                request_id = id,
                reviewer_id,
                "Quality review resolved: {}",
                request.state
            ),
        }
        self.notify(workflow::transition_notifications(&request, target));
        Ok(request)
    }

    /// Technical staff record execution of a request deferred to them
    pub async fn complete_deferred(
        &self,
        id: i32,
        feedback: Option<String>,
        reviewer_id: i32,
    ) -> AppResult<ChangeRequest> {
        let mut tx = self.repository.begin().await?;
        let mut request = self.repository.change_requests.lock_by_id(&mut tx, id).await?;

        request.state = workflow::next_state(request.state, Transition::CompleteDeferred)?;
        let effects = workflow::approve_all(&mut request.payload)?;
        self.apply_effects(&mut tx, id, effects, reviewer_id).await?;

        request.technical_reviewer_id = Some(reviewer_id);
        if feedback.is_some() {
            request.technical_feedback = feedback;
        }
        request.technical_reviewed_at = Some(Utc::now());

        let request = self.repository.change_requests.update(&mut tx, &request).await?;
        tx.commit().await?;

        tracing::info!(request_id = id, reviewer_id, "Deferred request completed");
        self.notify(workflow::transition_notifications(&request, None));
        Ok(request)
    }

    async fn apply_effects(
        &self,
        conn: &mut PgConnection,
        request_id: i32,
        effects: Vec<Effect>,
        actor_id: i32,
    ) -> AppResult<()> {
        let actor = Some(actor_id);
        for effect in effects {
            let result = match &effect {
                Effect::Create(fields) => self
                    .equipment
                    .create_in(conn, fields, actor)
                    .await
                    .map(|equipment| equipment.version),
                Effect::Revise {
                    equipment_id,
                    patch,
                } => self
                    .equipment
                    .revise_in(conn, *equipment_id, patch, actor)
                    .await
                    .map(|outcome| outcome.version),
                Effect::Disable {
                    equipment_id,
                    reason,
                    validity_date,
                } => self
                    .equipment
                    .disable_in(conn, *equipment_id, reason, *validity_date, actor)
                    .await
                    .map(|outcome| outcome.version),
                Effect::Annotate { equipment_id, note } => self
                    .equipment
                    .annotate_in(conn, *equipment_id, note, actor)
                    .await
                    .map(|outcome| outcome.version),
            };

            match result {
                Ok(version) => tracing::debug!(
                    request_id,
                    equipment_id = ?effect.equipment_id(),
                    "Approval effect applied, equipment at {}",
                    version
                ),
                Err(e) => {
                    tracing::error!(
                        request_id,
                        equipment_id = ?effect.equipment_id(),
                        "Approval effect failed: {}",
                        e
                    );
                    return Err(AppError::SideEffect {
                        request_id,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn notify(&self, notifications: Vec<Notification>) {
        notifications::dispatch(self.notifier.clone(), notifications);
    }
}
