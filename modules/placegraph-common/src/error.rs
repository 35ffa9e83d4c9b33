use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PlaceGraphError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Identity ambiguous for '{name}': best candidate '{candidate}' scored {score:.2}")]
    IdentityAmbiguous {
        name: String,
        candidate: String,
        score: f64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conflict queue error: {0}")]
    Queue(String),

    #[error("Conflict {0} not found")]
    ConflictNotFound(Uuid),

    #[error("Conflict {0} already disposed")]
    ConflictAlreadyDisposed(Uuid),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    Connection,
    Timeout,
    Constraint,
    Query,
}

/// A graph store failure. Connection and timeout failures are transient and
/// worth retrying; constraint and query failures are not.
#[derive(Debug, Clone, Error)]
#[error("store error ({kind:?}): {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Connection, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Timeout, message: message.into() }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Constraint, message: message.into() }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Query, message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, StoreErrorKind::Connection | StoreErrorKind::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(StoreError::connection("refused").is_retryable());
        assert!(StoreError::timeout("deadline").is_retryable());
        assert!(!StoreError::constraint("unique").is_retryable());
        assert!(!StoreError::query("syntax").is_retryable());
    }
}
