use std::collections::BTreeMap;

use thiserror::Error;

/// Error taxonomy shared by the engine, queue, registry, and HTTP surface.
///
/// Each variant maps onto a stable wire code; the bridge translates them
/// into HTTP statuses without losing the classification.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input malformed; `fields` carries field-path -> reason.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: BTreeMap<String, String>,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate, version race, or lease-lost.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller no longer holds the lease on a task.
    #[error("lease lost on task {task_id}")]
    LeaseLost { task_id: String },

    /// Illegal state-machine transition.
    #[error("invalid transition: {0}")]
    StateMachineViolation(String),

    /// Storage or downstream dependency failing.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Single-field validation error.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        let field = field.into();
        let reason = reason.into();
        let mut fields = BTreeMap::new();
        fields.insert(field.clone(), reason.clone());
        CoreError::Validation {
            message: format!("{field}: {reason}"),
            fields,
        }
    }

    /// Stable machine-readable code for the wire error body.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation { .. } => "validation",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) | CoreError::LeaseLost { .. } => "conflict",
            CoreError::StateMachineViolation(_) => "state_machine_violation",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<tokio_rusqlite::Error> for CoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        CoreError::Unavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Unavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_collects_field() {
        let err = CoreError::validation("target_host_id", "must not be empty");
        match err {
            CoreError::Validation { fields, .. } => {
                assert_eq!(fields["target_host_id"], "must not be empty");
            }
            _ => panic!("expected validation"),
        }
    }

    #[test]
    fn lease_lost_maps_to_conflict_code() {
        let err = CoreError::LeaseLost {
            task_id: "task-x".into(),
        };
        assert_eq!(err.code(), "conflict");
    }
}
