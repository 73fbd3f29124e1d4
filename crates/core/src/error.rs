//! The error taxonomy shared by every Kira crate.

use thiserror::Error;

use crate::entity::EntityState;
use crate::time::TimeError;

/// Category tag attached to every validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IssueCategory {
    Schema,
    Task,
    Note,
    Event,
    Common,
    Fsm,
}

/// One actionable validation failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ValidationIssue {
    pub category: IssueCategory,
    pub field: String,
    pub message: String,
    /// Human-readable remediation hint.
    pub hint: String,
}

impl ValidationIssue {
    pub fn new(
        category: IssueCategory,
        field: impl Into<String>,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            category,
            field: field.into(),
            message: message.into(),
            hint: hint.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}: {}", self.category, self.field, self.message)
    }
}

/// Which side won a sync conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
    Tie,
}

#[derive(Debug, Error)]
pub enum KiraError {
    #[error("validation failed with {} issue(s)", issues.len())]
    Validation { issues: Vec<ValidationIssue> },
    #[error("transition {from} -> {to} rejected: {reason}")]
    Fsm {
        from: EntityState,
        to: EntityState,
        reason: String,
    },
    #[error("entity not found: {id}")]
    NotFound { id: String },
    #[error("could not lock '{id}' within {waited_ms}ms")]
    LockTimeout { id: String, waited_ms: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frontmatter error: {0}")]
    Frontmatter(String),
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("remote '{source_name}' failed: {message}")]
    Remote { source_name: String, message: String },
    #[error("duplicate event fingerprint {fingerprint}")]
    DuplicateEvent { fingerprint: String },
    #[error("sync conflict resolved for {winner:?}")]
    Conflict { winner: ConflictWinner },
}

impl KiraError {
    /// Concise machine-readable identifier, surfaced to collaborators and
    /// stamped on audit records.
    pub fn code(&self) -> &'static str {
        match self {
            KiraError::Validation { .. } => "validation_failed",
            KiraError::Fsm { .. } => "fsm_guard_failed",
            KiraError::NotFound { .. } => "not_found",
            KiraError::LockTimeout { .. } => "lock_timeout",
            KiraError::Io(_) => "io_error",
            KiraError::Frontmatter(_) => "frontmatter_invalid",
            KiraError::Time(_) => "timestamp_invalid",
            KiraError::Storage(_) => "storage_error",
            KiraError::Remote { .. } => "remote_error",
            KiraError::DuplicateEvent { .. } => "duplicate_event",
            KiraError::Conflict { winner: ConflictWinner::Remote } => "conflict_remote_won",
            KiraError::Conflict { winner: ConflictWinner::Local } => "conflict_local_won",
            KiraError::Conflict { winner: ConflictWinner::Tie } => "conflict_tie",
        }
    }

    /// Whether a bus handler should retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KiraError::LockTimeout { .. } | KiraError::Io(_) | KiraError::Remote { .. } | KiraError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KiraError>;
