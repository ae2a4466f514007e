//! Error types for Labfleet

use serde::Serialize;
use thiserror::Error;

/// Stable numeric codes reported to callers alongside the error message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Failure = 1,
    DbFailure = 3,
    NoSuchEquipment = 5,
    NoSuchHistoryEntry = 6,
    NoSuchRequest = 7,
    BadValue = 18,
    InvalidTransition = 22,
    VersionConflict = 23,
    SideEffectFailure = 24,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Side effect failed for request {request_id}: {message}")]
    SideEffect { request_id: i32, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub error: String,
    pub message: String,
}

impl AppError {
    /// Equipment lookup failure
    pub fn equipment_not_found(id: i32) -> Self {
        AppError::NotFound(format!("Equipment {} not found", id))
    }

    /// Change request lookup failure
    pub fn request_not_found(id: i32) -> Self {
        AppError::NotFound(format!("Change request {} not found", id))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::NotFound(msg) if msg.starts_with("History entry") => {
                ErrorCode::NoSuchHistoryEntry
            }
            AppError::NotFound(msg) if msg.starts_with("Change request") => ErrorCode::NoSuchRequest,
            AppError::NotFound(_) => ErrorCode::NoSuchEquipment,
            AppError::Validation(_) => ErrorCode::BadValue,
            AppError::InvalidTransition(_) => ErrorCode::InvalidTransition,
            AppError::Conflict(_) => ErrorCode::VersionConflict,
            AppError::SideEffect { .. } => ErrorCode::SideEffectFailure,
            AppError::Database(_) => ErrorCode::DbFailure,
            AppError::Serialization(_) | AppError::Config(_) | AppError::Internal(_) => {
                ErrorCode::Failure
            }
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_conflict(&self) -> bool {
        match self {
            AppError::Conflict(_) => true,
            // unique_violation / serialization_failure / deadlock_detected
            AppError::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("23505") | Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }

    /// Build the structured failure result handed back to callers
    pub fn to_response(&self) -> ErrorResponse {
        let code = self.code();
        let message = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "Database error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal error".to_string()
            }
            other => other.to_string(),
        };

        ErrorResponse {
            code: code as u32,
            error: format!("{:?}", code),
            message,
        }
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
