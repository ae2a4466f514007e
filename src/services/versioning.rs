//! Version planning for equipment writes
//!
//! These functions only decide. Given the locked live row and its full history
//! they return what must be archived, which label the live row takes and which
//! entry (if any) leaves the history. The equipment service executes the plan
//! inside one transaction.

use crate::error::{AppError, AppResult};
use crate::models::equipment::{EquipmentFields, EquipmentHistoryEntry};

/// What happens to the pre-write live state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Archive {
    /// An entry already carries the live label: refresh its timestamp
    Touch(i32),
    /// Insert a snapshot of the live row under its label
    Snapshot,
    /// Nothing to archive
    Skip,
}

/// Plan for `revise`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionPlan {
    pub archive: Archive,
    /// Label the live row carries afterwards
    pub version: String,
    /// History entry whose label was reused, if any
    pub reused_from: Option<i32>,
    /// Candidate equals the live state; the live row is left untouched
    pub unchanged: bool,
}

/// Plan for `restore`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    pub archive: Archive,
    pub version: String,
    pub fields: EquipmentFields,
    /// The restored entry, deleted once live
    pub remove: i32,
}

/// Numeric part of a `vN` label; anything unparseable counts as 1
pub fn version_number(label: &str) -> u32 {
    label
        .trim()
        .strip_prefix(['v', 'V'])
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(1)
}

pub fn version_label(number: u32) -> String {
    format!("v{}", number)
}

/// Label following `current`
pub fn next_version_label(current: &str) -> String {
    version_label(version_number(current) + 1)
}

/// Fresh label for a state never seen before.
///
/// One past the highest label in use, so a label reused by time travel never
/// collides with a later fresh one.
fn fresh_label(live_version: &str, history: &[EquipmentHistoryEntry]) -> String {
    let highest = history
        .iter()
        .map(|entry| version_number(&entry.version))
        .chain(std::iter::once(version_number(live_version)))
        .max()
        .unwrap_or(1);
    version_label(highest + 1)
}

fn plan_archive(live_version: &str, history: &[EquipmentHistoryEntry]) -> Archive {
    history
        .iter()
        .find(|entry| entry.version == live_version)
        .map(|entry| Archive::Touch(entry.id))
        .unwrap_or(Archive::Snapshot)
}

/// Decide how a candidate state is written over the live state.
///
/// `history` must hold every entry of the equipment, most recent first.
pub fn plan_revision(
    live: &EquipmentFields,
    live_version: &str,
    candidate: &EquipmentFields,
    history: &[EquipmentHistoryEntry],
) -> RevisionPlan {
    let archive = plan_archive(live_version, history);

    if live.same_state(candidate) {
        return RevisionPlan {
            archive: match archive {
                Archive::Touch(id) => Archive::Touch(id),
                _ => Archive::Skip,
            },
            version: live_version.to_string(),
            reused_from: None,
            unchanged: true,
        };
    }

    // Matching sees history as it stands after the archive step: the archived
    // state first, then everything else newest first.
    let archived_live = match archive {
        Archive::Touch(id) => history.iter().find(|entry| entry.id == id).map(|entry| {
            (Some(entry.id), entry.version.as_str(), &entry.fields)
        }),
        _ => Some((None, live_version, live)),
    };
    let others = history
        .iter()
        .filter(|entry| Archive::Touch(entry.id) != archive)
        .map(|entry| (Some(entry.id), entry.version.as_str(), &entry.fields));

    let matched = archived_live
        .into_iter()
        .chain(others)
        .find(|(_, _, fields)| fields.same_state(candidate));

    match matched {
        Some((id, version, _)) => RevisionPlan {
            archive,
            version: version.to_string(),
            reused_from: id,
            unchanged: false,
        },
        None => RevisionPlan {
            archive,
            version: fresh_label(live_version, history),
            reused_from: None,
            unchanged: false,
        },
    }
}

/// Decide how a history entry becomes live again.
///
/// Fails with `NotFound` when `history_id` is not an entry of this equipment.
pub fn plan_restore(
    equipment_id: i32,
    live_version: &str,
    history_id: i32,
    history: &[EquipmentHistoryEntry],
) -> AppResult<RestorePlan> {
    let target = history
        .iter()
        .find(|entry| entry.id == history_id && entry.equipment_id == equipment_id)
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "History entry {} not found for equipment {}",
                history_id, equipment_id
            ))
        })?;

    Ok(RestorePlan {
        archive: plan_archive(live_version, history),
        version: target.version.clone(),
        fields: target.fields.normalized(),
        remove: target.id,
    })
}
