//! Database integration tests
//!
//! Each test gets a fresh database with the migrations applied.
//! Run with: DATABASE_URL=postgres://... cargo test -- --ignored

mod change_request_workflow;
mod equipment_versioning;

use std::sync::Arc;

use labfleet::{
    config::AppConfig,
    models::equipment::{Equipment, NewEquipment},
    repository::Repository,
    services::{notifications::NoopNotifier, Services},
};
use sqlx::PgPool;

pub fn services(pool: PgPool) -> Services {
    Services::with_notifier(Repository::new(pool), &AppConfig::default(), Arc::new(NoopNotifier))
}

pub async fn seed_equipment(services: &Services, code: &str, location: &str) -> Equipment {
    let new: NewEquipment = serde_json::from_value(serde_json::json!({
        "code": code,
        "name": "Balanza analítica",
        "equipment_type": "Balanza",
        "location": location,
        "validity_date": "2025-06-30",
        "prefix": "BAL",
        "sequence_number": 1,
    }))
    .expect("valid equipment");
    services
        .equipment
        .create(&new, Some(1))
        .await
        .expect("equipment created")
}
