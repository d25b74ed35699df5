//! Ledger error types

use uuid::Uuid;

/// Errors produced by ledger use cases.
///
/// The variants map onto the HTTP statuses the admin controller layer
/// returns: `NotFound` -> 404, validation failures -> 400, everything
/// else -> 500. Validation errors are raised before any mutation; a
/// failure inside a transactional group rolls the whole group back.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Referenced subscription/invoice/payment/credit/feature does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Operation not permitted in the aggregate's current lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Monetary validation failure (negative result, over-refund, bad amount)
    #[error("invalid adjustment: {0}")]
    InvalidAdjustment(String),

    /// Tenant has no available credits to consume
    #[error("no available credits for tenant {0}")]
    NoCreditAvailable(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// HTTP status the admin API layer should map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            LedgerError::NotFound(_) => 404,
            LedgerError::InvalidState(_)
            | LedgerError::InvalidAdjustment(_)
            | LedgerError::NoCreditAvailable(_) => 400,
            LedgerError::Database(_) => 500,
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(LedgerError::NotFound("invoice".into()).status_code(), 404);
        assert_eq!(
            LedgerError::InvalidState("invoice is voided".into()).status_code(),
            400
        );
        assert_eq!(
            LedgerError::InvalidAdjustment("amount would go negative".into()).status_code(),
            400
        );
        assert_eq!(
            LedgerError::NoCreditAvailable(Uuid::new_v4()).status_code(),
            400
        );
        assert_eq!(
            LedgerError::Database(sqlx::Error::RowNotFound).status_code(),
            500
        );
    }
}
