//! Error types for Tether operations.

use crate::enums::{EntityKind, TaskState};
use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {kind:?} with id {id}")]
    NotFound { kind: EntityKind, id: Uuid },

    #[error("Invalid state transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        task_id: Uuid,
        from: TaskState,
        /// `None` when the rejected mutation carried no state change
        /// (e.g. appending to a terminal task).
        to: Option<TaskState>,
    },

    /// Transient backend failure. Retried internally up to the configured
    /// bound before being surfaced; callers may retry the whole operation.
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    /// Permanent backend failure. Never retried; a fresh attempt would hit
    /// the same error.
    #[error("Storage backend error: {reason}")]
    Internal { reason: String },

    #[error("Stored {kind:?} row could not be decoded: {reason}")]
    Decode { kind: EntityKind, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors, rejected before any mutation is attempted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Top-level error for all Tether operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TetherError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TetherError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TetherError::Storage(StorageError::Unavailable { .. }))
    }

    /// Convenience constructor for [`StorageError::NotFound`].
    pub fn not_found(kind: EntityKind, id: Uuid) -> Self {
        TetherError::Storage(StorageError::NotFound { kind, id })
    }
}

/// Result type alias for Tether operations.
pub type TetherResult<T> = Result<T, TetherError>;
