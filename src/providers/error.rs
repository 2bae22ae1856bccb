/// Provider error with retry classification.
///
/// The dispatchers use [`ProviderError::is_retryable`] to decide between
/// retrying an operation with backoff and giving up on it (abandoning the
/// lease so the work is redelivered later).
///
/// **Retryable**: database busy/locked, pool or connection timeouts, lock
/// acquisition timeouts.
///
/// **Permanent**: constraint violations, corrupt rows, lost or unknown lease
/// tokens, schema mismatches.
///
/// ```rust
/// use durasql::providers::ProviderError;
///
/// let busy = ProviderError::retryable("ack_orchestration_item", "database is locked");
/// assert!(busy.is_retryable());
///
/// let lost = ProviderError::permanent("ack_orchestration_item", "lease expired");
/// assert!(!lost.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct ProviderError {
    /// Operation that failed (e.g. "ack_orchestration_item")
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Classify a database error.
    pub fn from_sqlx(operation: &str, e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => {
                Self::retryable(operation, format!("Connection error: {e}"))
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::permanent(operation, format!("Constraint violation: {e}"))
            }
            sqlx::Error::Database(db) => {
                let msg = db.message();
                if msg.contains("database is locked") || msg.contains("database is busy") || msg.contains("SQLITE_BUSY")
                {
                    Self::retryable(operation, format!("Database locked: {e}"))
                } else {
                    Self::permanent(operation, e.to_string())
                }
            }
            sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
                Self::permanent(operation, format!("Corrupt row: {e}"))
            }
            _ => Self::retryable(operation, e.to_string()),
        }
    }

    pub(crate) fn serialization(operation: &str, e: serde_json::Error) -> Self {
        Self::permanent(operation, format!("Serialization error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_and_permanent_classification() {
        let retryable = ProviderError::retryable("fetch_orchestration_item", "Database is busy");
        assert!(retryable.is_retryable());
        assert_eq!(retryable.operation, "fetch_orchestration_item");

        let permanent = ProviderError::permanent("ack_orchestration_item", "Duplicate event detected");
        assert!(!permanent.is_retryable());

        let display = permanent.to_string();
        assert!(display.contains("ack_orchestration_item"));
        assert!(display.contains("Duplicate"));

        let _err: Box<dyn std::error::Error> = Box::new(permanent);
    }

    #[test]
    fn pool_timeouts_are_retryable() {
        assert!(ProviderError::from_sqlx("fetch_work_item", sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn missing_rows_are_permanent() {
        assert!(!ProviderError::from_sqlx("read_history", sqlx::Error::RowNotFound).is_retryable());
    }
}
