use crate::{Kind, ObjectKey};

/// Errors surfaced by stores, the status updater and the reconcilers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: ObjectKey },
    /// A single optimistic-concurrency write lost the race.
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict { kind: Kind, key: ObjectKey, message: String },
    #[error("gave up updating {kind} {key} status after {attempts} conflicting attempts")]
    ConflictExhausted { kind: Kind, key: ObjectKey, attempts: u32 },
    #[error("deadline exceeded while updating {kind} {key} status")]
    DeadlineExceeded { kind: Kind, key: ObjectKey },
    #[error("transient: {0}")]
    Transient(String),
    #[error("precondition: {0}")]
    Precondition(String),
}

impl Error {
    pub fn not_found(kind: Kind, key: &ObjectKey) -> Self {
        Self::NotFound { kind, key: key.clone() }
    }

    pub fn conflict(kind: Kind, key: &ObjectKey, message: impl Into<String>) -> Self {
        Self::Conflict { kind, key: key.clone(), message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether redelivering the work item can change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Precondition(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
