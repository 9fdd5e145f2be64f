use uuid::Uuid;

use crate::models::AlertState;

/// Failures surfaced by alert lifecycle operations.
///
/// `InvalidTransition` and `AlertNotFound` are caller mistakes and are never
/// retried. `PersistenceConflict` means a concurrent writer won the
/// compare-and-swap; callers inside this crate retry it with backoff before
/// letting it escape. `PersistenceUnavailable` wraps store errors that
/// survived the bounded retry loop.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("invalid transition: cannot {action} an alert in state {from}")]
    InvalidTransition {
        from: AlertState,
        action: &'static str,
    },

    #[error("alert {0} not found")]
    AlertNotFound(Uuid),

    #[error("concurrent update lost the version check")]
    PersistenceConflict,

    #[error("alert store unavailable")]
    PersistenceUnavailable(#[from] sqlx::Error),
}

impl AlertError {
    /// Whether a local retry with backoff can still succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AlertError::PersistenceConflict | AlertError::PersistenceUnavailable(_)
        )
    }
}
