//! Business logic services

pub mod change_requests;
pub mod equipment;
pub mod notifications;
pub mod versioning;
pub mod workflow;

use std::sync::Arc;

use crate::{config::AppConfig, repository::Repository};
use notifications::{NoopNotifier, Notifier, TracingNotifier};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub equipment: equipment::EquipmentService,
    pub workflow: change_requests::WorkflowService,
}

impl Services {
    /// Create all services with the given repository
    pub fn new(repository: Repository, config: &AppConfig) -> Self {
        let notifier: Arc<dyn Notifier> = if config.notifications.enabled {
            Arc::new(TracingNotifier)
        } else {
            Arc::new(NoopNotifier)
        };
        Self::with_notifier(repository, config, notifier)
    }

    /// Create all services around a custom notifier
    pub fn with_notifier(repository: Repository, config: &AppConfig, notifier: Arc<dyn Notifier>) -> Self {
        let equipment = equipment::EquipmentService::new(repository.clone(), config.versioning.clone());
        Self {
            workflow: change_requests::WorkflowService::new(repository, equipment.clone(), notifier),
            equipment,
        }
    }
}
