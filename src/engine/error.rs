use chrono::{DateTime, Utc};
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// The slot was taken by the appointment carried here.
    #[error("slot no longer available: conflicts with appointment {0}")]
    Conflict(Ulid),
    #[error(
        "policy window closed: {hours_until_start:.1}h until start at {start_at}, \
         changes require at least {policy_hours}h notice"
    )]
    PolicyViolation {
        start_at: DateTime<Utc>,
        hours_until_start: f64,
        policy_hours: u32,
    },
    #[error("unauthorized")]
    Unauthorized,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(crate) fn author_not_found(id: Ulid) -> Self {
        EngineError::NotFound { entity: "author", id }
    }

    pub(crate) fn type_not_found(id: Ulid) -> Self {
        EngineError::NotFound { entity: "interview type", id }
    }

    pub(crate) fn appointment_not_found(id: Ulid) -> Self {
        EngineError::NotFound { entity: "appointment", id }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Conflict(_) => "conflict",
            EngineError::PolicyViolation { .. } => "policy",
            EngineError::Unauthorized => "unauthorized",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::Storage(_) => "storage",
        }
    }
}
