//! Change request repository

use sqlx::{PgConnection, Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::{
        change_request::{ChangeRequest, ChangeRequestRow, Origin, RequestQuery, RequestState, RequestType},
        payload::RequestPayload,
    },
};

#[derive(Clone)]
pub struct ChangeRequestsRepository {
    pool: Pool<Postgres>,
}

impl ChangeRequestsRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get change request by ID
    pub async fn get_by_id(&self, id: i32) -> AppResult<ChangeRequest> {
        sqlx::query_as::<_, ChangeRequestRow>("SELECT * FROM change_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::request_not_found(id))?
            .try_into()
    }

    /// List change requests, newest first
    pub async fn list(&self, query: &RequestQuery) -> AppResult<Vec<ChangeRequest>> {
        let mut conditions = Vec::new();
        let mut idx = 1;

        if query.state.is_some() {
            conditions.push(format!("state = ${}", idx));
            idx += 1;
        }
        if query.request_type.is_some() {
            conditions.push(format!("request_type = ${}", idx));
            idx += 1;
        }
        if query.requester_id.is_some() {
            conditions.push(format!("requester_id = ${}", idx));
            idx += 1;
        }
        if query.exclude_requester_id.is_some() {
            conditions.push(format!("requester_id <> ${}", idx));
            idx += 1;
        }
        if query.origin.is_some() {
            conditions.push(format!("origin = ${}", idx));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let select_q = format!(
            "SELECT * FROM change_requests {} ORDER BY submitted_at DESC, id DESC",
            where_clause
        );
        let mut builder = sqlx::query_as::<_, ChangeRequestRow>(&select_q);
        if let Some(state) = query.state { builder = builder.bind(state.as_str()); }
        if let Some(request_type) = query.request_type { builder = builder.bind(request_type.as_str()); }
        if let Some(requester) = query.requester_id { builder = builder.bind(requester); }
        if let Some(excluded) = query.exclude_requester_id { builder = builder.bind(excluded); }
        if let Some(origin) = query.origin { builder = builder.bind(origin.as_str()); }

        builder
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ChangeRequest::try_from)
            .collect()
    }

    /// Equipment ids already targeted by open decommission requests
    pub async fn open_decommission_targets(&self, conn: &mut PgConnection) -> AppResult<Vec<i32>> {
        let ids = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT DISTINCT (item ->> 'equipment_id')::INT
            FROM change_requests,
                 jsonb_array_elements(payload -> 'data' -> 'items') AS item
            WHERE request_type = $1
              AND state NOT IN ($2, $3, $4)
              AND COALESCE((item ->> 'processed')::BOOLEAN, FALSE) = FALSE
            "#,
        )
        .bind(RequestType::Decommission.as_str())
        .bind(RequestState::Approved.as_str())
        .bind(RequestState::Rejected.as_str())
        .bind(RequestState::RejectedTechnical.as_str())
        .fetch_all(conn)
        .await?;
        Ok(ids)
    }

    /// Persist a new request
    pub async fn insert(
        &self,
        conn: &mut PgConnection,
        payload: &RequestPayload,
        state: RequestState,
        origin: Origin,
        requester_id: i32,
    ) -> AppResult<ChangeRequest> {
        let payload_json = serde_json::to_value(payload)?;
        sqlx::query_as::<_, ChangeRequestRow>(
            r#"
            INSERT INTO change_requests (request_type, state, origin, payload, requester_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(payload.request_type().as_str())
        .bind(state.as_str())
        .bind(origin.as_str())
        .bind(payload_json)
        .bind(requester_id)
        .fetch_one(conn)
        .await?
        .try_into()
    }

    /// Read and row-lock a request for a workflow transition
    pub async fn lock_by_id(&self, conn: &mut PgConnection, id: i32) -> AppResult<ChangeRequest> {
        sqlx::query_as::<_, ChangeRequestRow>("SELECT * FROM change_requests WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| AppError::request_not_found(id))?
            .try_into()
    }

    /// Write back state, payload, reviewers and feedback of a locked request
    pub async fn update(&self, conn: &mut PgConnection, request: &ChangeRequest) -> AppResult<ChangeRequest> {
        let payload_json = serde_json::to_value(&request.payload)?;
        sqlx::query_as::<_, ChangeRequestRow>(
            r#"
            UPDATE change_requests
            SET state = $2,
                payload = $3,
                technical_reviewer_id = $4,
                quality_reviewer_id = $5,
                technical_feedback = $6,
                quality_feedback = $7,
                technical_reviewed_at = $8,
                quality_decided_at = $9,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(request.id)
        .bind(request.state.as_str())
        .bind(payload_json)
        .bind(request.technical_reviewer_id)
        .bind(request.quality_reviewer_id)
        .bind(&request.technical_feedback)
        .bind(&request.quality_feedback)
        .bind(request.technical_reviewed_at)
        .bind(request.quality_decided_at)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| AppError::request_not_found(request.id))?
        .try_into()
    }
}
