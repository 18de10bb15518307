use sea_orm::error::DbErr;
use serde::Serialize;
use std::time::Duration;
use validator::ValidationErrors;

/// Stable, machine-readable classification of a [`ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InsufficientStock,
    OverDelivery,
    OverInvoice,
    Overpayment,
    NoDeliverableLines,
    NoDeliveryNote,
    Conflict,
    Validation,
    Timeout,
    Storage,
    Internal,
}

/// Error type returned by every fulfillment and ledger operation.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Over delivery: {0}")]
    OverDelivery(String),

    #[error("Over invoice: {0}")]
    OverInvoice(String),

    #[error("Overpayment: {0}")]
    Overpayment(String),

    #[error("Order {0} has no deliverable lines")]
    NoDeliverableLines(i64),

    #[error("Order {0} has no delivery note")]
    NoDeliveryNote(i64),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ServiceError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        ServiceError::NotFound(format!("{} {} not found", entity, id))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::DatabaseError(_) => ErrorKind::Storage,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::InvalidState(_) => ErrorKind::InvalidState,
            ServiceError::InsufficientStock(_) => ErrorKind::InsufficientStock,
            ServiceError::OverDelivery(_) => ErrorKind::OverDelivery,
            ServiceError::OverInvoice(_) => ErrorKind::OverInvoice,
            ServiceError::Overpayment(_) => ErrorKind::Overpayment,
            ServiceError::NoDeliverableLines(_) => ErrorKind::NoDeliverableLines,
            ServiceError::NoDeliveryNote(_) => ErrorKind::NoDeliveryNote,
            ServiceError::Conflict(_) => ErrorKind::Conflict,
            ServiceError::ValidationError(_) => ErrorKind::Validation,
            ServiceError::Timeout(_) => ErrorKind::Timeout,
            ServiceError::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Storage failures that may succeed when the whole unit of work is
    /// replayed: lock waits, deadlocks, serialization failures and pool
    /// exhaustion. Domain errors are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::DatabaseError(err) => is_transient_db_error(err),
            _ => false,
        }
    }
}

fn is_transient_db_error(err: &DbErr) -> bool {
    if matches!(err, DbErr::ConnectionAcquire(_)) {
        return true;
    }
    let message = err.to_string().to_ascii_lowercase();
    [
        "deadlock",
        "could not serialize",
        "database is locked",
        "database table is locked",
        "lock timeout",
        "pool timed out",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

impl From<ValidationErrors> for ServiceError {
    fn from(errors: ValidationErrors) -> Self {
        ServiceError::ValidationError(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_are_not_transient() {
        assert!(!ServiceError::InsufficientStock("lot 1".into()).is_transient());
        assert!(!ServiceError::Conflict("number taken".into()).is_transient());
        assert!(!ServiceError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn lock_errors_are_transient() {
        let err = ServiceError::DatabaseError(DbErr::Custom(
            "error returned from database: database is locked".into(),
        ));
        assert!(err.is_transient());

        let err = ServiceError::DatabaseError(DbErr::Custom(
            "deadlock detected while waiting for ShareLock".into(),
        ));
        assert!(err.is_transient());

        let err = ServiceError::DatabaseError(DbErr::RecordNotFound("x".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(ServiceError::NoDeliveryNote(3).kind(), ErrorKind::NoDeliveryNote);
        assert_eq!(ErrorKind::OverInvoice.as_ref(), "OverInvoice");
    }
}
