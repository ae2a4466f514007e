//! Versioned equipment writes against PostgreSQL

use chrono::NaiveDate;
use labfleet::{error::AppError, models::equipment::EquipmentPatch};
use rust_decimal::Decimal;
use sqlx::PgPool;

use super::{seed_equipment, services};

fn move_to(location: &str) -> EquipmentPatch {
    EquipmentPatch {
        location: Some(location.to_string()),
        ..Default::default()
    }
}

async fn history_len(pool: &PgPool, equipment_id: i32) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM equipment_history WHERE equipment_id = $1")
        .bind(equipment_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn created_equipment_starts_at_v1(pool: PgPool) {
    let services = services(pool.clone());
    let equipment = seed_equipment(&services, "BAL.01/MA.PM", "PM").await;

    assert_eq!(equipment.version, "v1");
    assert!(equipment.fields.enabled);
    assert_eq!(equipment.fields.linked_equipment, "0");
    assert_eq!(equipment.fingerprint, equipment.fields.fingerprint());
    assert_eq!(history_len(&pool, equipment.id).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn no_op_revision_keeps_label_and_history(pool: PgPool) {
    let services = services(pool.clone());
    let equipment = seed_equipment(&services, "BAL.01/MA.TCO", "TCO").await;
    let id = equipment.id;

    services.equipment.revise(id, &move_to("LAB"), Some(1)).await.unwrap();
    let outcome = services.equipment.revise(id, &move_to("PM"), Some(1)).await.unwrap();
    assert_eq!(outcome.version, "v3");
    assert_eq!(history_len(&pool, id).await, 2);

    let outcome = services.equipment.revise(id, &move_to("PM"), Some(1)).await.unwrap();
    assert_eq!(outcome.version, "v3");
    assert_eq!(outcome.previous_version, "v3");
    assert_eq!(history_len(&pool, id).await, 2);

    // Leave and come back: v3 now has a snapshot that must bubble, not duplicate
    services.equipment.revise(id, &move_to("TCO"), Some(1)).await.unwrap();
    services.equipment.revise(id, &move_to("PM"), Some(1)).await.unwrap();
    let before = history_len(&pool, id).await;
    let outcome = services.equipment.revise(id, &move_to("PM"), Some(2)).await.unwrap();
    assert_eq!(outcome.version, "v3");
    assert_eq!(history_len(&pool, id).await, before);

    let history = services.equipment.history(id).await.unwrap();
    assert_eq!(history[0].version, "v3");
    assert_eq!(history[0].changed_by, Some(2));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn returning_to_a_state_reuses_its_label(pool: PgPool) {
    let services = services(pool);
    let id = seed_equipment(&services, "BAL.02/MA.PM", "PM").await.id;

    let first = services.equipment.revise(id, &move_to("TCO"), None).await.unwrap();
    let second = services.equipment.revise(id, &move_to("LAB"), None).await.unwrap();
    let third = services.equipment.revise(id, &move_to("TCO"), None).await.unwrap();

    assert_eq!(first.version, "v2");
    assert_eq!(second.version, "v3");
    assert_eq!(third.version, first.version);

    let fresh = services.equipment.revise(id, &move_to("OFF"), None).await.unwrap();
    assert_eq!(fresh.version, "v4");
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn restore_makes_snapshot_live_and_removes_it(pool: PgPool) {
    let services = services(pool);
    let id = seed_equipment(&services, "BAL.03/MA.PM", "PM").await.id;
    services.equipment.revise(id, &move_to("TCO"), None).await.unwrap();
    services.equipment.revise(id, &move_to("LAB"), None).await.unwrap();

    let history = services.equipment.history(id).await.unwrap();
    let target = history.iter().find(|h| h.version == "v1").unwrap().clone();

    let outcome = services.equipment.restore(id, target.id, Some(5)).await.unwrap();
    assert_eq!(outcome.version, "v1");

    let live = services.equipment.get_by_id(id).await.unwrap();
    assert!(live.fields.same_state(&target.fields));
    assert_eq!(live.version, "v1");

    let history = services.equipment.history(id).await.unwrap();
    assert!(history.iter().all(|h| h.id != target.id));
    assert!(history.iter().any(|h| h.version == "v3" && h.fields.location == "LAB"));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn restore_rejects_entries_of_other_equipment(pool: PgPool) {
    let services = services(pool);
    let a = seed_equipment(&services, "BAL.04/MA.PM", "PM").await.id;
    let b = seed_equipment(&services, "BAL.05/MA.PM", "PM").await.id;
    services.equipment.revise(b, &move_to("TCO"), None).await.unwrap();
    let foreign = services.equipment.history(b).await.unwrap()[0].id;

    let err = services.equipment.restore(a, foreign, None).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = services.equipment.restore(9999, foreign, None).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn disable_appends_reason_and_versions(pool: PgPool) {
    let services = services(pool);
    let id = seed_equipment(&services, "BAL.06/MA.PM", "PM").await.id;

    let outcome = services
        .equipment
        .disable(id, "Lost during field trip", NaiveDate::from_ymd_opt(2025, 12, 31), Some(3))
        .await
        .unwrap();
    assert_eq!(outcome.version, "v2");

    let live = services.equipment.get_by_id(id).await.unwrap();
    assert!(!live.fields.enabled);
    assert!(live.fields.notes.ends_with("Lost during field trip"));
    assert_eq!(live.fields.validity_date, NaiveDate::from_ymd_opt(2025, 12, 31));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn history_listing_is_capped(pool: PgPool) {
    let services = services(pool);
    let id = seed_equipment(&services, "BAL.07/MA.PM", "PM").await.id;
    for n in 0..10 {
        services
            .equipment
            .revise(id, &move_to(&format!("SITE{}", n)), None)
            .await
            .unwrap();
    }

    let history = services.equipment.history(id).await.unwrap();
    assert_eq!(history.len(), 7);
    assert!(history.windows(2).all(|w| w[0].changed_at >= w[1].changed_at));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn concurrent_revisions_get_distinct_labels(pool: PgPool) {
    let services = services(pool);
    let id = seed_equipment(&services, "BAL.08/MA.PM", "PM").await.id;

    let to_tco = move_to("TCO");
    let to_lab = move_to("LAB");
    let (a, b) = tokio::join!(
        services.equipment.revise(id, &to_tco, None),
        services.equipment.revise(id, &to_lab, None),
    );
    let mut labels = vec![a.unwrap().version, b.unwrap().version];
    labels.sort();
    assert_eq!(labels, vec!["v2", "v3"]);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn sweep_disables_only_expired_equipment(pool: PgPool) {
    let services = services(pool);
    let expired = seed_equipment(&services, "BAL.09/MA.PM", "PM").await.id;
    let current = seed_equipment(&services, "BAL.10/MA.PM", "PM").await.id;
    services
        .equipment
        .revise(
            current,
            &EquipmentPatch {
                validity_date: NaiveDate::from_ymd_opt(2030, 1, 1),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    let disabled = services
        .equipment
        .sweep_expired(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap())
        .await
        .unwrap();
    assert_eq!(disabled, 1);
    assert!(!services.equipment.get_by_id(expired).await.unwrap().fields.enabled);
    assert!(services.equipment.get_by_id(current).await.unwrap().fields.enabled);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn code_suggestion_uses_known_prefixes(pool: PgPool) {
    let services = services(pool);
    seed_equipment(&services, "BAL.01/MA.PM", "PM").await;

    let suggestion = services
        .equipment
        .suggest_code("Balanza", "TCO", "")
        .await
        .unwrap();
    assert_eq!(suggestion.prefix, "BAL");
    assert_eq!(suggestion.sequence_number, 2);
    assert_eq!(suggestion.suggested_code, "BAL.02/MA.TCO");

    let fallback = services
        .equipment
        .suggest_code("Sonda", "PM", "Sonda multiparámetro")
        .await
        .unwrap();
    assert_eq!(fallback.prefix, "MPA");
    assert_eq!(fallback.suggested_code, "MPA.01/MA.PM");

    assert_eq!(services.equipment.next_sequence_number("Balanza").await.unwrap(), 2);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn repeated_tolerance_patch_is_a_no_op(pool: PgPool) {
    let services = services(pool.clone());
    let id = seed_equipment(&services, "BAL.11/MA.PM", "PM").await.id;
    let patch = EquipmentPatch {
        error_0: Some(Decimal::new(25, 2)),
        ..Default::default()
    };

    for _ in 0..3 {
        let outcome = services.equipment.revise(id, &patch, None).await.unwrap();
        assert_eq!(outcome.version, "v2");
    }
    assert_eq!(history_len(&pool, id).await, 1);

    let live = services.equipment.get_by_id(id).await.unwrap();
    assert_eq!(live.fields.error_0, Decimal::new(3, 1));
    assert_eq!(live.fingerprint, live.fields.fingerprint());
}
