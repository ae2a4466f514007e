//! Equipment service: versioned writes, history and fleet queries
//!
//! Every write locks the live row, plans the archive and label with
//! [`versioning`](super::versioning) and applies the plan in the same
//! transaction. The `*_in` variants run inside a caller's transaction so
//! workflow approvals commit together with their equipment changes.

use chrono::NaiveDate;
use sqlx::PgConnection;
use std::future::Future;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};
use validator::Validate;

use super::versioning::{self, Archive};
use crate::{
    config::VersioningConfig,
    error::{AppError, AppResult},
    models::equipment::{
        CodeSuggestion, Equipment, EquipmentFields, EquipmentHistoryEntry, EquipmentPage,
        EquipmentPatch, EquipmentQuery, NewEquipment, RevisionOutcome,
    },
    repository::Repository,
};

/// Prefix used when nothing better is known
const DEFAULT_PREFIX: &str = "EQ";

/// Keyword to prefix table, matched accent-insensitively on name and type
const KEYWORD_PREFIXES: &[(&str, &str)] = &[
    ("analizador", "ANA"),
    ("balanza", "BAL"),
    ("camara", "CAM"),
    ("centrifuga", "CEN"),
    ("gps", "GPS"),
    ("instrumento", "INS"),
    ("medidor", "MED"),
    ("multiparametro", "MPA"),
    ("phmetro", "PHM"),
    ("sonda", "SON"),
];

/// Lowercase without diacritics
fn fold(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Prefix from the keyword table, if any keyword occurs in name or type
pub fn keyword_prefix(name: &str, equipment_type: &str) -> Option<&'static str> {
    let haystack = fold(&format!("{} {}", name, equipment_type));
    KEYWORD_PREFIXES
        .iter()
        .find(|(keyword, _)| haystack.contains(keyword))
        .map(|(_, prefix)| *prefix)
}

/// `{PREFIX}.{NN}/MA.{LOCATION}`
pub fn format_code(prefix: &str, sequence_number: i32, location: &str) -> String {
    format!("{}.{:02}/MA.{}", prefix, sequence_number, location.trim())
}

#[derive(Clone)]
pub struct EquipmentService {
    repository: Repository,
    config: VersioningConfig,
}

impl EquipmentService {
    pub fn new(repository: Repository, config: VersioningConfig) -> Self {
        Self { repository, config }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_by_id(&self, id: i32) -> AppResult<Equipment> {
        self.repository.equipment.get_by_id(id).await
    }

    /// Most recent snapshots of an equipment, newest first
    pub async fn history(&self, id: i32) -> AppResult<Vec<EquipmentHistoryEntry>> {
        // Verify equipment exists
        self.repository.equipment.get_by_id(id).await?;
        self.repository
            .equipment
            .history(id, self.config.history_limit)
            .await
    }

    /// Filtered, paginated equipment list with filter catalogs
    pub async fn list(&self, query: &EquipmentQuery) -> AppResult<EquipmentPage> {
        let (items, total) = self.repository.equipment.list(query).await?;
        let catalogs = self
            .repository
            .equipment
            .catalogs(query.location.as_deref())
            .await?;
        Ok(EquipmentPage {
            items,
            total,
            page: query.page.unwrap_or(1).max(1),
            per_page: query.per_page.unwrap_or(50).clamp(1, 500),
            catalogs,
        })
    }

    /// Propose a code for a new equipment of this type at this location
    pub async fn suggest_code(
        &self,
        equipment_type: &str,
        location: &str,
        name: &str,
    ) -> AppResult<CodeSuggestion> {
        let prefix = match self
            .repository
            .equipment
            .most_common_prefix(name, equipment_type)
            .await?
        {
            Some(prefix) => prefix,
            None => keyword_prefix(name, equipment_type)
                .unwrap_or(DEFAULT_PREFIX)
                .to_string(),
        };

        let sequence_number = self
            .repository
            .equipment
            .max_sequence_for_prefix(&prefix)
            .await?
            + 1;

        Ok(CodeSuggestion {
            suggested_code: format_code(&prefix, sequence_number, location),
            prefix,
            sequence_number,
        })
    }

    /// Next sequence number within an equipment type
    pub async fn next_sequence_number(&self, equipment_type: &str) -> AppResult<i32> {
        Ok(self
            .repository
            .equipment
            .max_sequence_for_type(equipment_type)
            .await?
            + 1)
    }

    // -----------------------------------------------------------------------
    // Standalone writes (one transaction each, retried on conflict)
    // -----------------------------------------------------------------------

    /// Register a new equipment at `v1`
    pub async fn create(&self, new: &NewEquipment, actor_id: Option<i32>) -> AppResult<Equipment> {
        new.validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let mut tx = self.repository.begin().await?;
        let equipment = self.create_in(&mut tx, &new.to_fields(), actor_id).await?;
        tx.commit().await?;
        Ok(equipment)
    }

    /// Apply a partial field set and return the resulting version label
    pub async fn revise(
        &self,
        id: i32,
        patch: &EquipmentPatch,
        actor_id: Option<i32>,
    ) -> AppResult<RevisionOutcome> {
        self.with_conflict_retry("revise", id, move || async move {
            let mut tx = self.repository.begin().await?;
            let outcome = self.revise_in(&mut tx, id, patch, actor_id).await?;
            tx.commit().await?;
            Ok(outcome)
        })
        .await
    }

    /// Make a history entry live again
    pub async fn restore(
        &self,
        id: i32,
        history_id: i32,
        actor_id: Option<i32>,
    ) -> AppResult<RevisionOutcome> {
        self.with_conflict_retry("restore", id, move || async move {
            let mut tx = self.repository.begin().await?;
            let outcome = self.restore_in(&mut tx, id, history_id, actor_id).await?;
            tx.commit().await?;
            Ok(outcome)
        })
        .await
    }

    /// Disable an equipment, recording the reason in its notes
    pub async fn disable(
        &self,
        id: i32,
        reason: &str,
        validity_date: Option<NaiveDate>,
        actor_id: Option<i32>,
    ) -> AppResult<RevisionOutcome> {
        self.with_conflict_retry("disable", id, move || async move {
            let mut tx = self.repository.begin().await?;
            let outcome = self
                .disable_in(&mut tx, id, reason, validity_date, actor_id)
                .await?;
            tx.commit().await?;
            Ok(outcome)
        })
        .await
    }

    /// Disable every enabled equipment whose validity ended before `as_of`.
    ///
    /// Returns how many were disabled. One failure does not stop the sweep.
    pub async fn sweep_expired(&self, as_of: NaiveDate) -> AppResult<usize> {
        let expired = self.repository.equipment.find_expired(as_of).await?;
        tracing::info!("Expiration sweep as of {}: {} candidates", as_of, expired.len());

        let mut disabled = 0;
        for equipment in expired {
            let reason = match equipment.fields.validity_date {
                Some(date) => format!("Validity expired on {}", date),
                None => "Validity expired".to_string(),
            };
            match self.disable(equipment.id, &reason, None, None).await {
                Ok(outcome) => {
                    disabled += 1;
                    tracing::debug!(
                        "Disabled expired equipment {} ({}) at {}",
                        equipment.id,
                        equipment.fields.code,
                        outcome.version
                    );
                }
                Err(e) => {
                    tracing::error!("Failed to disable expired equipment {}: {}", equipment.id, e);
                }
            }
        }

        tracing::info!("Expiration sweep disabled {} equipment", disabled);
        Ok(disabled)
    }

    // -----------------------------------------------------------------------
    // Writes inside a caller's transaction
    // -----------------------------------------------------------------------

    pub async fn create_in(
        &self,
        conn: &mut PgConnection,
        fields: &EquipmentFields,
        actor_id: Option<i32>,
    ) -> AppResult<Equipment> {
        let equipment = self
            .repository
            .equipment
            .insert(conn, &fields.normalized(), &versioning::version_label(1))
            .await?;
        tracing::info!(
            equipment_id = equipment.id,
            actor_id = ?actor_id,
            "Equipment {} created at {}",
            equipment.fields.code,
            equipment.version
        );
        Ok(equipment)
    }

    pub async fn revise_in(
        &self,
        conn: &mut PgConnection,
        id: i32,
        patch: &EquipmentPatch,
        actor_id: Option<i32>,
    ) -> AppResult<RevisionOutcome> {
        let live = self.repository.equipment.lock_by_id(conn, id).await?;
        let candidate = patch.apply(&live.fields);
        self.write_candidate(conn, live, candidate, actor_id).await
    }

    pub async fn disable_in(
        &self,
        conn: &mut PgConnection,
        id: i32,
        reason: &str,
        validity_date: Option<NaiveDate>,
        actor_id: Option<i32>,
    ) -> AppResult<RevisionOutcome> {
        let live = self.repository.equipment.lock_by_id(conn, id).await?;
        let mut candidate = live.fields.clone();
        candidate.enabled = false;
        candidate.append_note(reason);
        if validity_date.is_some() {
            candidate.validity_date = validity_date;
        }
        self.write_candidate(conn, live, candidate, actor_id).await
    }

    /// Append a note without touching anything else
    pub async fn annotate_in(
        &self,
        conn: &mut PgConnection,
        id: i32,
        note: &str,
        actor_id: Option<i32>,
    ) -> AppResult<RevisionOutcome> {
        let live = self.repository.equipment.lock_by_id(conn, id).await?;
        let mut candidate = live.fields.clone();
        candidate.append_note(note);
        self.write_candidate(conn, live, candidate, actor_id).await
    }

    pub async fn restore_in(
        &self,
        conn: &mut PgConnection,
        id: i32,
        history_id: i32,
        actor_id: Option<i32>,
    ) -> AppResult<RevisionOutcome> {
        let live = self.repository.equipment.lock_by_id(conn, id).await?;
        let history = self.repository.equipment.history_for_update(conn, id).await?;
        let plan = versioning::plan_restore(id, &live.version, history_id, &history)?;

        self.archive(conn, &live, plan.archive, actor_id).await?;
        self.repository
            .equipment
            .write_live(conn, id, live.revision, &plan.fields, &plan.version)
            .await?;
        self.repository.equipment.delete_history(conn, plan.remove).await?;

        tracing::info!(
            equipment_id = id,
            actor_id = ?actor_id,
            "Equipment restored from {} to {}",
            live.version,
            plan.version
        );
        Ok(RevisionOutcome {
            equipment_id: id,
            previous_version: live.version,
            version: plan.version,
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn write_candidate(
        &self,
        conn: &mut PgConnection,
        live: Equipment,
        candidate: EquipmentFields,
        actor_id: Option<i32>,
    ) -> AppResult<RevisionOutcome> {
        let history = self
            .repository
            .equipment
            .history_for_update(conn, live.id)
            .await?;
        let plan = versioning::plan_revision(&live.fields, &live.version, &candidate, &history);

        self.archive(conn, &live, plan.archive, actor_id).await?;

        if plan.unchanged {
            tracing::debug!(equipment_id = live.id, "No field changed, staying at {}", live.version);
            return Ok(RevisionOutcome {
                equipment_id: live.id,
                previous_version: live.version.clone(),
                version: live.version,
            });
        }

        match plan.reused_from {
            Some(history_id) => tracing::debug!(
                equipment_id = live.id,
                "State matches history entry {}, reusing {}",
                history_id,
                plan.version
            ),
            None => tracing::debug!(equipment_id = live.id, "New state, assigning {}", plan.version),
        }

        self.repository
            .equipment
            .write_live(conn, live.id, live.revision, &candidate, &plan.version)
            .await?;

        tracing::info!(
            equipment_id = live.id,
            actor_id = ?actor_id,
            "Equipment revised from {} to {}",
            live.version,
            plan.version
        );
        Ok(RevisionOutcome {
            equipment_id: live.id,
            previous_version: live.version,
            version: plan.version,
        })
    }

    async fn archive(
        &self,
        conn: &mut PgConnection,
        live: &Equipment,
        archive: Archive,
        actor_id: Option<i32>,
    ) -> AppResult<()> {
        match archive {
            Archive::Touch(history_id) => {
                tracing::debug!(equipment_id = live.id, "Bubbling history entry {} ({})", history_id, live.version);
                self.repository
                    .equipment
                    .touch_history(conn, history_id, actor_id)
                    .await
            }
            Archive::Snapshot => {
                tracing::debug!(equipment_id = live.id, "Archiving live state as {}", live.version);
                self.repository
                    .equipment
                    .insert_history(conn, live.id, &live.fields, &live.version, actor_id)
                    .await
                    .map(|_| ())
            }
            Archive::Skip => Ok(()),
        }
    }

    async fn with_conflict_retry<T, F, Fut>(&self, operation: &str, id: i32, mut attempt: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(e) if e.is_conflict() && retries < self.config.max_conflict_retries => {
                    retries += 1;
                    tracing::warn!(
                        equipment_id = id,
                        "{} hit a concurrent write, retry {}/{}",
                        operation,
                        retries,
                        self.config.max_conflict_retries
                    );
                }
                other => return other,
            }
        }
    }
}
