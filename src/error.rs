//! Error taxonomy for the task board.
//!
//! Every variant carries enough context (task id, states, lease holder) to be
//! actionable without a follow-up lookup. `ErrorCode` gives callers a stable,
//! serializable discriminant for structured output.

use crate::states::{TaskState, format_states};
use serde::Serialize;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Caller errors
    NotFound,
    ValidationError,
    InvalidTransition,

    // Ownership conflicts
    AlreadyClaimed,
    NotOwner,
    NoAgentAvailable,

    // Internal errors
    DatabaseError,
    InternalError,
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error(
        "Invalid transition for task {task_id}: {from} -> {to} (allowed from {from}: {allowed})",
        allowed = format_states(.from.allowed_exits())
    )]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("Task {task_id} already claimed by {holder} (expires {expires_at})")]
    AlreadyClaimed {
        task_id: String,
        holder: String,
        expires_at: String,
    },

    #[error(
        "Worker {worker_id} does not hold task {task_id} (current holder: {current})",
        current = .holder.as_deref().unwrap_or("none")
    )]
    NotOwner {
        task_id: String,
        worker_id: String,
        holder: Option<String>,
    },

    #[error("No agent available for category '{category}'")]
    NoAgentAvailable { category: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] refinery::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BoardError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::validation(field, format!("{} is required", field))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            BoardError::NotFound(_) => ErrorCode::NotFound,
            BoardError::Validation { .. } => ErrorCode::ValidationError,
            BoardError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            BoardError::AlreadyClaimed { .. } => ErrorCode::AlreadyClaimed,
            BoardError::NotOwner { .. } => ErrorCode::NotOwner,
            BoardError::NoAgentAvailable { .. } => ErrorCode::NoAgentAvailable,
            BoardError::Database(_) | BoardError::Migration(_) => ErrorCode::DatabaseError,
            BoardError::Serialization(_) | BoardError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Structured form for JSON output.
    pub fn report(&self) -> ErrorReport {
        let field = match self {
            BoardError::Validation { field, .. } => Some(field.clone()),
            _ => None,
        };
        ErrorReport {
            code: self.code(),
            message: self.to_string(),
            field,
        }
    }
}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for BoardError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<BoardError>() {
            Ok(board_err) => board_err,
            Err(err) => BoardError::internal(err),
        }
    }
}

/// Serializable error payload.
#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Result type for board operations.
pub type Result<T> = std::result::Result<T, BoardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_claimed_names_holder_and_expiry() {
        let err = BoardError::AlreadyClaimed {
            task_id: "TASK-003".into(),
            holder: "bot-a".into(),
            expires_at: "2026-01-01T00:05:00.000Z".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("TASK-003"));
        assert!(msg.contains("bot-a"));
        assert!(msg.contains("2026-01-01T00:05:00.000Z"));
        assert_eq!(err.code(), ErrorCode::AlreadyClaimed);
    }

    #[test]
    fn invalid_transition_lists_allowed_exits() {
        let err = BoardError::InvalidTransition {
            task_id: "TASK-001".into(),
            from: TaskState::Planned,
            to: TaskState::Done,
        };
        assert!(err.to_string().contains("running, blocked"));
    }

    #[test]
    fn anyhow_roundtrip_keeps_variant() {
        let wrapped = anyhow::Error::new(BoardError::NotFound("TASK-404".into()));
        let back: BoardError = wrapped.into();
        assert_eq!(back.code(), ErrorCode::NotFound);
    }

    #[test]
    fn report_serializes_code_in_screaming_case() {
        let report = BoardError::missing_field("title").report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert_eq!(json["field"], "title");
    }
}
