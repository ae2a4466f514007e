//! Change request lifecycle against PostgreSQL

use chrono::NaiveDate;
use labfleet::{
    error::{AppError, AppResult},
    models::{
        change_request::{
            ChangeRequest, ItemAction, Origin, QualityDecision, QualityReview, RequestQuery, RequestState,
            RequestType, SubmitRequest, TechnicalDecision, TechnicalStatus,
        },
        payload::RequestPayload,
    },
    services::Services,
};
use serde_json::json;
use sqlx::PgPool;

use super::{seed_equipment, services};

const SAMPLER: i32 = 10;
const TECHNICIAN: i32 = 20;
const QUALITY: i32 = 30;

fn payload(value: serde_json::Value) -> RequestPayload {
    serde_json::from_value(value).unwrap()
}

fn decommission(ids: &[i32]) -> RequestPayload {
    let items: Vec<_> = ids.iter().map(|id| json!({ "equipment_id": id })).collect();
    payload(json!({
        "type": "DECOMMISSION",
        "data": { "items": items, "reason": "End of service life" }
    }))
}

async fn submit(services: &Services, payload: RequestPayload, origin: Origin) -> AppResult<ChangeRequest> {
    services
        .workflow
        .submit(SubmitRequest {
            request_type: payload.request_type(),
            payload,
            requester_id: SAMPLER,
            origin,
        })
        .await
}

fn item_review(equipment_id: i32, action: ItemAction) -> QualityReview {
    QualityReview {
        reviewer_id: QUALITY,
        target_item_id: Some(equipment_id),
        item_action: Some(action),
        ..Default::default()
    }
}

fn whole_review() -> QualityReview {
    QualityReview {
        reviewer_id: QUALITY,
        ..Default::default()
    }
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn decommission_list_is_resolved_item_by_item(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let e2 = seed_equipment(&services, "BAL.02/MA.PM", "PM").await.id;

    let request = submit(&services, decommission(&[e1, e2]), Origin::FieldSampler)
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::PendingTechnical);
    assert_eq!(request.request_type, RequestType::Decommission);

    let request = services
        .workflow
        .accept_for_technical_review(request.id, None)
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::InTechnicalReview);

    let request = services
        .workflow
        .resolve_technical_review(
            request.id,
            TechnicalDecision::Derived,
            Some("Checked on site".to_string()),
            TECHNICIAN,
            None,
        )
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::PendingQuality);
    assert_eq!(
        request.state.legacy_pair(),
        ("PENDING_QUALITY", Some(TechnicalStatus::Derived))
    );
    assert_eq!(request.technical_reviewer_id, Some(TECHNICIAN));

    let request = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, item_review(e1, ItemAction::Approve))
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::PendingQuality);
    let items = request.payload.items().unwrap();
    assert!(items.iter().find(|i| i.equipment_id == e1).unwrap().processed);
    assert!(!items.iter().find(|i| i.equipment_id == e2).unwrap().processed);
    assert!(!services.equipment.get_by_id(e1).await.unwrap().fields.enabled);
    assert!(services.equipment.get_by_id(e2).await.unwrap().fields.enabled);

    let request = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, item_review(e2, ItemAction::Approve))
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::Approved);
    assert!(request.quality_decided_at.is_some());

    let e1 = services.equipment.get_by_id(e1).await.unwrap();
    assert_eq!(e1.version, "v2");
    assert!(e1.fields.notes.contains("End of service life"));
    assert!(!services.equipment.get_by_id(e2).await.unwrap().fields.enabled);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn items_resolve_in_any_order(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let e2 = seed_equipment(&services, "BAL.02/MA.PM", "PM").await.id;

    let request = submit(&services, decommission(&[e1, e2]), Origin::TechnicalStaff)
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::PendingQuality);

    services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Rejected, item_review(e2, ItemAction::Reject))
        .await
        .unwrap();
    let request = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, item_review(e1, ItemAction::Approve))
        .await
        .unwrap();

    assert_eq!(request.state, RequestState::Approved);
    assert!(!services.equipment.get_by_id(e1).await.unwrap().fields.enabled);
    let e2 = services.equipment.get_by_id(e2).await.unwrap();
    assert!(e2.fields.enabled);
    assert_eq!(e2.version, "v1");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn item_cannot_be_resolved_twice(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let e2 = seed_equipment(&services, "BAL.02/MA.PM", "PM").await.id;
    let request = submit(&services, decommission(&[e1, e2]), Origin::TechnicalStaff)
        .await
        .unwrap();

    services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, item_review(e1, ItemAction::Approve))
        .await
        .unwrap();
    let err = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Rejected, item_review(e1, ItemAction::Reject))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let err = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, item_review(9999, ItemAction::Approve))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn equipment_cannot_be_in_two_open_decommissions(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let e2 = seed_equipment(&services, "BAL.02/MA.PM", "PM").await.id;

    submit(&services, decommission(&[e1]), Origin::FieldSampler)
        .await
        .unwrap();
    let err = submit(&services, decommission(&[e2, e1]), Origin::FieldSampler)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    submit(&services, decommission(&[e2]), Origin::FieldSampler)
        .await
        .unwrap();
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn technical_staff_validity_extension_skips_technical_stage(pool: PgPool) {
    let services = services(pool);
    let id = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;

    let request = submit(
        &services,
        payload(json!({
            "type": "VALIDITY_EXTENSION",
            "data": { "equipment_id": id, "new_validity_date": "2026-01-15" }
        })),
        Origin::TechnicalStaff,
    )
    .await
    .unwrap();
    assert_eq!(request.state, RequestState::PendingQuality);

    let request = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, whole_review())
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::Approved);

    let equipment = services.equipment.get_by_id(id).await.unwrap();
    assert_eq!(equipment.fields.validity_date, NaiveDate::from_ymd_opt(2026, 1, 15));
    assert_eq!(equipment.version, "v2");
    assert_eq!(services.equipment.history(id).await.unwrap()[0].version, "v1");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn out_of_order_transitions_are_rejected(pool: PgPool) {
    let services = services(pool);
    let id = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let request = submit(
        &services,
        payload(json!({
            "type": "REVIEW",
            "data": { "equipment_id": id, "notes": "Display flickers" }
        })),
        Origin::FieldSampler,
    )
    .await
    .unwrap();

    let err = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, whole_review())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let request = services
        .workflow
        .resolve_technical_review(request.id, TechnicalDecision::Rejected, None, TECHNICIAN, None)
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::RejectedTechnical);

    let err = services
        .workflow
        .accept_for_technical_review(request.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let err = services
        .workflow
        .accept_for_technical_review(9999, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn deferred_request_is_completed_by_technical_staff(pool: PgPool) {
    let services = services(pool);
    let id = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let request = submit(
        &services,
        payload(json!({
            "type": "TRANSFER",
            "data": { "equipment_id": id, "new_location": "TCO" }
        })),
        Origin::TechnicalStaff,
    )
    .await
    .unwrap();

    let request = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::DeferToTechnical, whole_review())
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::DeferredToTechnical);
    assert_eq!(services.equipment.get_by_id(id).await.unwrap().fields.location, "PM");

    let request = services
        .workflow
        .complete_deferred(request.id, Some("Moved".to_string()), TECHNICIAN)
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::Approved);

    let equipment = services.equipment.get_by_id(id).await.unwrap();
    assert_eq!(equipment.fields.location, "TCO");
    assert_eq!(equipment.version, "v2");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn failed_effect_rolls_back_the_decision(pool: PgPool) {
    let services = services(pool);
    let request = submit(
        &services,
        payload(json!({
            "type": "TRANSFER",
            "data": { "equipment_id": 9999, "new_location": "TCO" }
        })),
        Origin::TechnicalStaff,
    )
    .await
    .unwrap();

    let err = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, whole_review())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SideEffect { request_id, .. } if request_id == request.id));

    let request = services.workflow.get_by_id(request.id).await.unwrap();
    assert_eq!(request.state, RequestState::PendingQuality);
    assert!(request.quality_reviewer_id.is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn approved_new_equipment_request_creates_it(pool: PgPool) {
    let services = services(pool);
    let request = submit(
        &services,
        payload(json!({
            "type": "NEW_EQUIPMENT",
            "data": {
                "equipment": {
                    "code": "SON.01/MA.TCO",
                    "name": "Sonda de oxígeno",
                    "equipment_type": "Sonda",
                    "location": "TCO",
                    "prefix": "SON",
                    "sequence_number": 1
                }
            }
        })),
        Origin::TechnicalStaff,
    )
    .await
    .unwrap();

    services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, whole_review())
        .await
        .unwrap();

    let query = serde_json::from_value(json!({ "location": "TCO" })).unwrap();
    let page = services.equipment.list(&query).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].fields.code, "SON.01/MA.TCO");
    assert_eq!(page.items[0].version, "v1");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn requests_filter_by_state_and_requester(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let e2 = seed_equipment(&services, "BAL.02/MA.PM", "PM").await.id;
    submit(&services, decommission(&[e1]), Origin::FieldSampler)
        .await
        .unwrap();
    submit(&services, decommission(&[e2]), Origin::TechnicalStaff)
        .await
        .unwrap();

    let pending_quality = services
        .workflow
        .list(&RequestQuery {
            state: Some(RequestState::PendingQuality),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending_quality.len(), 1);
    assert_eq!(pending_quality[0].payload.target_equipment_ids(), vec![e2]);

    let others = services
        .workflow
        .list(&RequestQuery {
            exclude_requester_id: Some(SAMPLER),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(others.is_empty());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn revised_payload_cannot_skip_undecided_items(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let e2 = seed_equipment(&services, "BAL.02/MA.PM", "PM").await.id;
    let request = submit(&services, decommission(&[e1, e2]), Origin::TechnicalStaff)
        .await
        .unwrap();

    let forged = payload(json!({
        "type": "DECOMMISSION",
        "data": {
            "items": [{ "equipment_id": e1 }, { "equipment_id": e2, "processed": true }],
            "reason": "End of service life"
        }
    }));
    let request = services
        .workflow
        .resolve_quality_review(
            request.id,
            QualityDecision::Approved,
            QualityReview {
                revised_payload: Some(forged),
                ..item_review(e1, ItemAction::Approve)
            },
        )
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::PendingQuality);
    assert_eq!(request.payload.pending_items(), vec![e2]);

    let request = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, item_review(e2, ItemAction::Approve))
        .await
        .unwrap();
    assert_eq!(request.state, RequestState::Approved);
    assert!(!services.equipment.get_by_id(e2).await.unwrap().fields.enabled);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn submissions_with_decided_items_are_refused(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;

    let err = submit(
        &services,
        payload(json!({
            "type": "DECOMMISSION",
            "data": { "items": [{ "equipment_id": e1, "processed": true }], "reason": "Old" }
        })),
        Origin::TechnicalStaff,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(services.workflow.list(&RequestQuery::default()).await.unwrap().is_empty());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn whole_rejection_keeps_executed_items_approved(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;
    let e2 = seed_equipment(&services, "BAL.02/MA.PM", "PM").await.id;
    let request = submit(&services, decommission(&[e1, e2]), Origin::TechnicalStaff)
        .await
        .unwrap();

    services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Approved, item_review(e1, ItemAction::Approve))
        .await
        .unwrap();
    let request = services
        .workflow
        .resolve_quality_review(request.id, QualityDecision::Rejected, whole_review())
        .await
        .unwrap();

    assert_eq!(request.state, RequestState::Approved);
    assert!(request.payload.all_processed());
    assert!(!services.equipment.get_by_id(e1).await.unwrap().fields.enabled);
    assert!(services.equipment.get_by_id(e2).await.unwrap().fields.enabled);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn concurrent_decommissions_of_one_equipment_admit_one(pool: PgPool) {
    let services = services(pool);
    let e1 = seed_equipment(&services, "BAL.01/MA.PM", "PM").await.id;

    let (a, b) = tokio::join!(
        submit(&services, decommission(&[e1]), Origin::FieldSampler),
        submit(&services, decommission(&[e1]), Origin::FieldSampler),
    );
    let admitted = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    assert!([a, b]
        .into_iter()
        .any(|r| matches!(r, Err(AppError::Validation(_)))));
}
