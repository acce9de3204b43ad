//! Error types surfaced by the connection pool.

use thiserror::Error;

use crate::xa::XaError;

/// Result type alias for pool operations.
pub type TransxResult<T> = Result<T, TransxError>;

/// Errors that can occur while borrowing, using or returning connections.
#[derive(Debug, Clone, Error)]
pub enum TransxError {
    /// Terminal: the pool was destroyed and hands out nothing new.
    #[error("managed connection pool has been destroyed")]
    PoolDestroyed,

    /// A permit or a per-connection lock was not obtained in time.
    #[error("allocation timeout: {0}")]
    AllocationTimeout(String),

    #[error("reauthentication not allowed: {0}")]
    SecurityMismatch(String),

    /// Physical-layer failure; the affected connection gets evicted.
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("connection handle has been closed")]
    AlreadyClosed,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error(transparent)]
    Xa(#[from] XaError),
}

impl TransxError {
    /// Whether the caller may simply try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransxError::AllocationTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xa::XAER_RMFAIL;

    #[test]
    fn only_allocation_timeout_is_retryable() {
        assert!(TransxError::AllocationTimeout("busy".into()).is_retryable());
        assert!(!TransxError::PoolDestroyed.is_retryable());
        assert!(!TransxError::SecurityMismatch("user".into()).is_retryable());
        assert!(!TransxError::AlreadyClosed.is_retryable());
    }

    #[test]
    fn xa_error_converts_transparently() {
        let err: TransxError = XaError::new(XAER_RMFAIL, "resource manager gone").into();
        assert!(matches!(err, TransxError::Xa(ref x) if x.code() == XAER_RMFAIL));
        assert!(err.to_string().contains("resource manager gone"));
    }

    #[test]
    fn messages_name_the_condition() {
        assert_eq!(
            TransxError::PoolDestroyed.to_string(),
            "managed connection pool has been destroyed"
        );
        assert!(
            TransxError::SecurityMismatch("credentials differ".into())
                .to_string()
                .starts_with("reauthentication not allowed")
        );
    }
}
