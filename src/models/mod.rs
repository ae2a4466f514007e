//! Data models for Labfleet

pub mod change_request;
pub mod equipment;
pub mod fields;
pub mod payload;

// Re-export commonly used types
pub use change_request::{
    ChangeRequest, ItemAction, Origin, QualityDecision, QualityReview, RequestQuery, RequestState,
    RequestType, SubmitRequest, TechnicalDecision,
};
pub use equipment::{
    Equipment, EquipmentFields, EquipmentHistoryEntry, EquipmentPatch, EquipmentQuery,
    NewEquipment, RevisionOutcome,
};
pub use payload::{ItemEntry, RequestPayload};
