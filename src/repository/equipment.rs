//! Equipment and equipment history repository
//!
//! Reads go through the pool. Every mutation takes the open transaction of the
//! calling engine operation so archive, match and live write commit together.

use chrono::NaiveDate;
use sqlx::{
    postgres::PgArguments, query::QueryAs, PgConnection, Pool, Postgres,
};

use crate::{
    error::{AppError, AppResult},
    models::equipment::{
        Equipment, EquipmentCatalogs, EquipmentFields, EquipmentHistoryEntry, EquipmentQuery,
    },
};

/// Columns shared by the live table and the history table, in bind order
const FIELD_COLUMNS: &str = "code, name, equipment_type, location, validity_date, operator_id, \
    enabled, prefix, sequence_number, has_field_sheet, error_0, error_15, error_30, \
    linked_equipment, notes, visible_to_sampler, measures, unit_name, unit_symbol, \
    include_in_report";

/// Bind every versioned field, starting at the next placeholder
fn bind_fields<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    fields: &'q EquipmentFields,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    query
        .bind(&fields.code)
        .bind(&fields.name)
        .bind(&fields.equipment_type)
        .bind(&fields.location)
        .bind(fields.validity_date)
        .bind(fields.operator_id)
        .bind(fields.enabled)
        .bind(&fields.prefix)
        .bind(fields.sequence_number)
        .bind(fields.has_field_sheet)
        .bind(fields.error_0)
        .bind(fields.error_15)
        .bind(fields.error_30)
        .bind(&fields.linked_equipment)
        .bind(&fields.notes)
        .bind(fields.visible_to_sampler)
        .bind(&fields.measures)
        .bind(&fields.unit_name)
        .bind(&fields.unit_symbol)
        .bind(fields.include_in_report)
}

/// `$from, $from+1, ...` for the twenty field columns
fn field_placeholders(from: usize) -> String {
    (from..from + 20)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone)]
pub struct EquipmentRepository {
    pool: Pool<Postgres>,
}

impl EquipmentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Get equipment by ID
    pub async fn get_by_id(&self, id: i32) -> AppResult<Equipment> {
        sqlx::query_as::<_, Equipment>("SELECT * FROM equipment WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::equipment_not_found(id))
    }

    /// Most recent history entries, newest first
    pub async fn history(&self, equipment_id: i32, limit: i64) -> AppResult<Vec<EquipmentHistoryEntry>> {
        let rows = sqlx::query_as::<_, EquipmentHistoryEntry>(
            r#"
            SELECT * FROM equipment_history
            WHERE equipment_id = $1
            ORDER BY changed_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(equipment_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// List equipment with optional filters and pagination
    pub async fn list(&self, query: &EquipmentQuery) -> AppResult<(Vec<Equipment>, i64)> {
        let page = query.page.unwrap_or(1).max(1);
        let per_page = query.per_page.unwrap_or(50).clamp(1, 500);
        let offset = (page - 1) * per_page;

        let mut conditions = Vec::new();
        let mut idx = 1;

        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s.to_lowercase()));

        if search.is_some() {
            conditions.push(format!(
                "(LOWER(code) LIKE ${0} OR LOWER(name) LIKE ${0} OR LOWER(equipment_type) LIKE ${0} OR LOWER(location) LIKE ${0})",
                idx
            ));
            idx += 1;
        }
        if query.equipment_type.is_some() {
            conditions.push(format!("equipment_type = ${}", idx));
            idx += 1;
        }
        if query.location.is_some() {
            conditions.push(format!("location = ${}", idx));
            idx += 1;
        }
        if query.enabled.is_some() {
            conditions.push(format!("enabled = ${}", idx));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_q = format!("SELECT COUNT(*) FROM equipment {}", where_clause);
        let mut count_builder = sqlx::query_scalar::<_, i64>(&count_q);
        if let Some(ref s) = search { count_builder = count_builder.bind(s); }
        if let Some(ref t) = query.equipment_type { count_builder = count_builder.bind(t); }
        if let Some(ref l) = query.location { count_builder = count_builder.bind(l); }
        if let Some(e) = query.enabled { count_builder = count_builder.bind(e); }
        let total = count_builder.fetch_one(&self.pool).await?;

        let select_q = format!(
            "SELECT * FROM equipment {} ORDER BY code, id LIMIT {} OFFSET {}",
            where_clause, per_page, offset
        );
        let mut builder = sqlx::query_as::<_, Equipment>(&select_q);
        if let Some(ref s) = search { builder = builder.bind(s); }
        if let Some(ref t) = query.equipment_type { builder = builder.bind(t); }
        if let Some(ref l) = query.location { builder = builder.bind(l); }
        if let Some(e) = query.enabled { builder = builder.bind(e); }

        let rows = builder.fetch_all(&self.pool).await?;
        Ok((rows, total))
    }

    /// Distinct filter values, narrowed to a location when given
    pub async fn catalogs(&self, location: Option<&str>) -> AppResult<EquipmentCatalogs> {
        async fn distinct(
            pool: &Pool<Postgres>,
            column: &str,
            location: Option<&str>,
        ) -> AppResult<Vec<String>> {
            let query = format!(
                "SELECT DISTINCT {0} FROM equipment WHERE {0} <> '' AND ($1::TEXT IS NULL OR location = $1) ORDER BY {0}",
                column
            );
            let values = sqlx::query_scalar::<_, String>(&query)
                .bind(location)
                .fetch_all(pool)
                .await?;
            Ok(values)
        }

        Ok(EquipmentCatalogs {
            types: distinct(&self.pool, "equipment_type", location).await?,
            locations: distinct(&self.pool, "location", None).await?,
            names: distinct(&self.pool, "name", location).await?,
        })
    }

    /// Most common code prefix among equipment whose name or type matches,
    /// name matches ranked first
    pub async fn most_common_prefix(&self, name: &str, equipment_type: &str) -> AppResult<Option<String>> {
        let name_pattern = (!name.trim().is_empty()).then(|| format!("%{}%", name.trim().to_lowercase()));
        let type_pattern = format!("%{}%", equipment_type.trim().to_lowercase());

        let prefix = sqlx::query_scalar::<_, String>(
            r#"
            SELECT prefix FROM equipment
            WHERE prefix <> ''
              AND (($1::TEXT IS NOT NULL AND LOWER(name) LIKE $1) OR LOWER(equipment_type) LIKE $2)
            GROUP BY prefix
            ORDER BY MAX(CASE WHEN $1::TEXT IS NOT NULL AND LOWER(name) LIKE $1 THEN 1 ELSE 0 END) DESC,
                     COUNT(*) DESC,
                     prefix
            LIMIT 1
            "#,
        )
        .bind(name_pattern)
        .bind(type_pattern)
        .fetch_optional(&self.pool)
        .await?;
        Ok(prefix)
    }

    /// Highest sequence number used with a prefix
    pub async fn max_sequence_for_prefix(&self, prefix: &str) -> AppResult<i32> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT MAX(sequence_number) FROM equipment WHERE prefix = $1")
                .bind(prefix)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    /// Highest sequence number used within an equipment type
    pub async fn max_sequence_for_type(&self, equipment_type: &str) -> AppResult<i32> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT MAX(sequence_number) FROM equipment WHERE equipment_type = $1")
                .bind(equipment_type)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(0))
    }

    /// Enabled equipment whose validity date is strictly before `as_of`
    pub async fn find_expired(&self, as_of: NaiveDate) -> AppResult<Vec<Equipment>> {
        let rows = sqlx::query_as::<_, Equipment>(
            r#"
            SELECT * FROM equipment
            WHERE enabled = TRUE AND validity_date IS NOT NULL AND validity_date < $1
            ORDER BY validity_date, id
            "#,
        )
        .bind(as_of)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Transactional operations
    // -----------------------------------------------------------------------

    /// Read and row-lock the live record
    pub async fn lock_by_id(&self, conn: &mut PgConnection, id: i32) -> AppResult<Equipment> {
        sqlx::query_as::<_, Equipment>("SELECT * FROM equipment WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| AppError::equipment_not_found(id))
    }

    /// Row-lock several live records in id order, returning the ids that exist
    pub async fn lock_ids(&self, conn: &mut PgConnection, ids: &[i32]) -> AppResult<Vec<i32>> {
        let locked = sqlx::query_scalar::<_, i32>(
            "SELECT id FROM equipment WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(ids)
        .fetch_all(conn)
        .await?;
        Ok(locked)
    }

    /// Every history entry of an equipment, most recent first, locked
    pub async fn history_for_update(
        &self,
        conn: &mut PgConnection,
        equipment_id: i32,
    ) -> AppResult<Vec<EquipmentHistoryEntry>> {
        let rows = sqlx::query_as::<_, EquipmentHistoryEntry>(
            r#"
            SELECT * FROM equipment_history
            WHERE equipment_id = $1
            ORDER BY changed_at DESC, id DESC
            FOR UPDATE
            "#,
        )
        .bind(equipment_id)
        .fetch_all(conn)
        .await?;
        Ok(rows)
    }

    /// Snapshot a field set into history
    pub async fn insert_history(
        &self,
        conn: &mut PgConnection,
        equipment_id: i32,
        fields: &EquipmentFields,
        version: &str,
        changed_by: Option<i32>,
    ) -> AppResult<EquipmentHistoryEntry> {
        let query = format!(
            "INSERT INTO equipment_history (equipment_id, version, changed_by, {}) \
             VALUES ($1, $2, $3, {}) RETURNING *",
            FIELD_COLUMNS,
            field_placeholders(4)
        );
        let builder = sqlx::query_as::<_, EquipmentHistoryEntry>(&query)
            .bind(equipment_id)
            .bind(version)
            .bind(changed_by);
        let row = bind_fields(builder, fields).fetch_one(conn).await?;
        Ok(row)
    }

    /// Bubble an existing entry to the top of the history
    pub async fn touch_history(
        &self,
        conn: &mut PgConnection,
        history_id: i32,
        changed_by: Option<i32>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE equipment_history h
            SET changed_at = GREATEST(
                    NOW(),
                    (SELECT MAX(o.changed_at) + INTERVAL '1 microsecond'
                     FROM equipment_history o
                     WHERE o.equipment_id = h.equipment_id)
                ),
                changed_by = COALESCE($2, h.changed_by)
            WHERE h.id = $1
            "#,
        )
        .bind(history_id)
        .bind(changed_by)
        .execute(conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("History entry {} not found", history_id)));
        }
        Ok(())
    }

    /// Remove an entry that became live again
    pub async fn delete_history(&self, conn: &mut PgConnection, history_id: i32) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM equipment_history WHERE id = $1")
            .bind(history_id)
            .execute(conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("History entry {} not found", history_id)));
        }
        Ok(())
    }

    /// Overwrite the live row if its revision is still `expected_revision`.
    ///
    /// Returns `Conflict` when another writer moved the revision.
    pub async fn write_live(
        &self,
        conn: &mut PgConnection,
        id: i32,
        expected_revision: i64,
        fields: &EquipmentFields,
        version: &str,
    ) -> AppResult<Equipment> {
        let assignments = FIELD_COLUMNS
            .split(',')
            .map(str::trim)
            .enumerate()
            .map(|(i, column)| format!("{} = ${}", column, i + 5))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "UPDATE equipment SET version = $3, fingerprint = $4, revision = revision + 1, \
             updated_at = NOW(), {} WHERE id = $1 AND revision = $2 RETURNING *",
            assignments
        );
        let fingerprint = fields.fingerprint();
        let builder = sqlx::query_as::<_, Equipment>(&query)
            .bind(id)
            .bind(expected_revision)
            .bind(version)
            .bind(&fingerprint);
        bind_fields(builder, fields)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!(
                    "Equipment {} changed concurrently (expected revision {})",
                    id, expected_revision
                ))
            })
    }

    /// Insert a new live record
    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        fields: &EquipmentFields,
        version: &str,
    ) -> AppResult<Equipment> {
        let query = format!(
            "INSERT INTO equipment (version, fingerprint, {}) VALUES ($1, $2, {}) RETURNING *",
            FIELD_COLUMNS,
            field_placeholders(3)
        );
        let fingerprint = fields.fingerprint();
        let builder = sqlx::query_as::<_, Equipment>(&query)
            .bind(version)
            .bind(&fingerprint);
        let row = bind_fields(builder, fields).fetch_one(conn).await?;
        Ok(row)
    }
}
